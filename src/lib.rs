//! Storage Provisioner Operator
//!
//! A Kubernetes operator that deploys CSI drivers and dynamic storage
//! provisioners from custom resources, and keeps them converged.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Controller                                    │
//! │        store events + periodic resync ──► WorkQueue (one pass per key)      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Desired-State  │  │   Diff/Apply    │  │     Rollout                 │  │
//! │  │  Synthesizer    │─►│   Engine        │─►│     Coordinator             │  │
//! │  │  (pure)         │  │  (retry budget) │  │  (cordon/drain/verify)      │  │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │                                │                         │                  │
//! │                    ┌───────────┴───────────┐  ┌──────────┴──────────┐       │
//! │                    │  Generation Ledger    │─►│  Status Aggregator  │       │
//! │                    │  (applied/observed)   │  │  (observedGen)      │       │
//! │                    └───────────────────────┘  └─────────────────────┘       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Ports                                          │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │      ObjectStore            │  │     NodeDrainer / NodePlugins       │   │
//! │  │  (Kubernetes | memory)      │  │  (Kubernetes | simulated)           │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconciliation engine, rollout and work queue
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`store`]: Object store and node adapters
//! - [`error`]: Error types and handling

pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use controller::{
    Controller, DesiredStateSynthesizer, DiffApplyEngine, GenerationLedger, OperatorConfig,
    OperatorMetrics, ReconcileOutcome, Reconciler, RolloutCoordinator, StatusAggregator,
    WorkQueue,
};

pub use crd::{
    CephFsProvisioner, CsiDriverDeployment, CsiDriverDeploymentSpec, EfsProvisioner,
    LocalStorageProvider, ManagementState, ManilaProvisioner, NodeUpdateStrategy,
    SnapshotController, StorageStatus,
};

pub use domain::ports::{
    DesiredObject, NodeDrainer, NodePlugins, ObjectIdentity, ObjectKind, ObjectStore, ParentKey,
    ProvisionerKind, StoredObject,
};
pub use domain::resource::ProvisionerResource;

pub use error::{Error, ErrorAction, Result};

pub use store::{KubeNodeRuntime, KubeObjectStore, MemoryObjectStore, SimulatedNodes};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
