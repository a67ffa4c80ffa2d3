//! Reconciliation engine
//!
//! Turns provisioner resources into child workloads:
//! - Desired-state synthesis (pure spec -> children mapping)
//! - Generation ledger (durable applied/observed generations)
//! - Diff/apply against the object store
//! - Node-by-node rollout of CSI node plugins
//! - Status aggregation and the keyed work queue driving it all

pub mod diff_apply;
pub mod ledger;
pub mod metrics;
pub mod provisioners;
pub mod reconciler;
pub mod rollout;
pub mod selector;
pub mod status;
pub mod synthesizer;
pub mod workqueue;

#[cfg(test)]
pub(crate) mod fixtures;

pub use diff_apply::{ApplyAction, ApplyReport, ChildOutcome, DiffApplyEngine, RetryPolicy};
pub use ledger::{
    ChildResourceRecord, FileLedgerBackend, GenerationLedger, LedgerBackend, MemoryLedgerBackend,
};
pub use metrics::OperatorMetrics;
pub use provisioners::ProvisionerImages;
pub use reconciler::{Controller, ReconcileOutcome, Reconciler};
pub use rollout::{
    NodePhase, NodeRolloutState, RolloutConfig, RolloutCoordinator, RolloutPlan, RolloutTarget,
};
pub use status::{ConditionInput, StatusAggregator, StatusInput};
pub use synthesizer::{DesiredStateSynthesizer, SidecarImages, SynthesizerConfig};
pub use workqueue::WorkQueue;

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the controller and everything it drives
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Images and paths used during synthesis
    pub synthesizer: SynthesizerConfig,
    /// Retry budget for store writes
    pub retry: RetryPolicy,
    /// Node rollout limits
    pub rollout: RolloutConfig,
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Interval between full resyncs of every resource
    pub resync_interval: Duration,
    /// First requeue delay of a failing key
    pub queue_base_delay: Duration,
    /// Cap on the requeue delay of a failing key
    pub queue_max_delay: Duration,
    /// Ledger file; in memory when unset
    pub ledger_path: Option<PathBuf>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            synthesizer: SynthesizerConfig::default(),
            retry: RetryPolicy::default(),
            rollout: RolloutConfig::default(),
            workers: 2,
            resync_interval: Duration::from_secs(300),
            queue_base_delay: Duration::from_millis(500),
            queue_max_delay: Duration::from_secs(300),
            ledger_path: None,
        }
    }
}
