//! Store adapters
//!
//! Implementations of the object store and node ports: against a live
//! cluster, and in memory for standalone mode and tests.

pub mod cluster;
pub mod memory;
pub mod nodes;
pub mod simulated;

pub use cluster::KubeObjectStore;
pub use memory::{MemoryObjectStore, WriteCounts};
pub use nodes::KubeNodeRuntime;
pub use simulated::{NodeEvent, SimulatedNodes};
