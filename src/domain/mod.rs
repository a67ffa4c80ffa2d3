//! Domain layer - Core types and port definitions
//!
//! This module defines the identities, object bodies and traits (ports) the
//! reconciliation engine works against, following hexagonal architecture
//! principles.

pub mod ports;
pub mod resource;

pub use ports::*;
pub use resource::*;
