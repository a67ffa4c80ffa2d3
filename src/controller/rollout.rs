//! Rollout Coordinator
//!
//! Replaces CSI node plugin pods one node at a time (or a few at a time) when
//! the node DaemonSet changes. Each node walks
//! `Pending -> Cordoning -> Draining -> Updating -> Verifying -> Done`; the
//! Rolling strategy skips cordon and drain. A node that times out becomes
//! `Failed` and halts the plan until the DaemonSet changes again or the plan
//! is reset.
//!
//! Plans live in a concurrent table keyed by parent. Before every node
//! transition the parent is re-read; a deleted or re-specified parent aborts
//! the plan.

use crate::controller::metrics::OperatorMetrics;
use crate::crd::{NodeRolloutStatus, NodeUpdateStrategy, RolloutStatus};
use crate::domain::ports::{
    EvictionOutcome, NodeDrainerRef, NodePluginsRef, ObjectIdentity, ObjectStoreRef, ParentKey,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use k8s_openapi::api::core::v1::NodeSelector;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Nodes allowed to leave `Pending` together
    pub max_concurrent_nodes: usize,
    /// Bound on waiting for one pod eviction
    pub eviction_timeout: Duration,
    /// Bound on waiting for the new plugin socket
    pub verify_timeout: Duration,
    /// Poll interval while verifying
    pub verify_interval: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 1,
            eviction_timeout: Duration::from_secs(300),
            verify_timeout: Duration::from_secs(300),
            verify_interval: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Plan Types
// =============================================================================

/// Rollout phase of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    Pending,
    Cordoning,
    Draining,
    Updating,
    Verifying,
    Done,
    Failed,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Pending => "Pending",
            NodePhase::Cordoning => "Cordoning",
            NodePhase::Draining => "Draining",
            NodePhase::Updating => "Updating",
            NodePhase::Verifying => "Verifying",
            NodePhase::Done => "Done",
            NodePhase::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Pending" => NodePhase::Pending,
            "Cordoning" => NodePhase::Cordoning,
            "Draining" => NodePhase::Draining,
            "Updating" => NodePhase::Updating,
            "Verifying" => NodePhase::Verifying,
            "Done" => NodePhase::Done,
            "Failed" => NodePhase::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodePhase::Done | NodePhase::Failed)
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRolloutState {
    pub node: String,
    pub phase: NodePhase,
    pub last_transition: DateTime<Utc>,
    /// Reason for the last failure or retry
    pub message: Option<String>,
}

/// What a plan rolls out
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutTarget {
    pub parent: ParentKey,
    /// Parent generation the plan was computed from
    pub parent_generation: i64,
    pub daemon_set: ObjectIdentity,
    /// DaemonSet generation every node must run
    pub target_generation: i64,
    pub strategy: NodeUpdateStrategy,
    pub driver_name: String,
    pub node_selector: Option<NodeSelector>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPlan {
    pub target: RolloutTarget,
    /// Ordered by node name
    pub nodes: Vec<NodeRolloutState>,
    pub halted: bool,
    pub failure: Option<String>,
}

impl RolloutPlan {
    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.phase == NodePhase::Done)
    }

    /// Still making progress
    pub fn is_active(&self) -> bool {
        !self.halted && !self.is_complete()
    }

    pub fn node(&self, name: &str) -> Option<&NodeRolloutState> {
        self.nodes.iter().find(|n| n.node == name)
    }

    pub fn phase(&self, name: &str) -> Option<NodePhase> {
        self.node(name).map(|n| n.phase)
    }

    pub fn to_status(&self) -> RolloutStatus {
        RolloutStatus {
            target_generation: self.target.target_generation,
            strategy: self.target.strategy.to_string(),
            halted: self.halted,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeRolloutStatus {
                    node_name: n.node.clone(),
                    phase: n.phase.to_string(),
                    last_transition_time: n.last_transition,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct RolloutCoordinator {
    store: ObjectStoreRef,
    drainer: NodeDrainerRef,
    plugins: NodePluginsRef,
    config: RolloutConfig,
    plans: DashMap<ParentKey, RolloutPlan>,
    /// DaemonSet generation of halted plans discarded through `reset`
    released: DashMap<ParentKey, i64>,
    shutdown: CancellationToken,
    metrics: Option<OperatorMetrics>,
}

impl RolloutCoordinator {
    pub fn new(
        store: ObjectStoreRef,
        drainer: NodeDrainerRef,
        plugins: NodePluginsRef,
        config: RolloutConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            drainer,
            plugins,
            config,
            plans: DashMap::new(),
            released: DashMap::new(),
            shutdown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OperatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current plan of a parent
    pub fn snapshot(&self, parent: &ParentKey) -> Option<RolloutPlan> {
        self.plans.get(parent).map(|p| p.clone())
    }

    /// Discard a plan, allowing a halted rollout to start over
    pub fn reset(&self, parent: &ParentKey) -> Option<RolloutPlan> {
        let removed = self.plans.remove(parent).map(|(_, plan)| plan);
        if let Some(plan) = &removed {
            if plan.halted {
                self.released
                    .insert(parent.clone(), plan.target.target_generation);
            }
            info!(parent = %parent, "Rollout plan reset");
        }
        removed
    }

    /// Abort and discard a plan
    pub fn abort(&self, parent: &ParentKey, reason: &str) {
        self.released.remove(parent);
        if self.plans.remove(parent).is_some() {
            warn!(parent = %parent, reason, "Rollout aborted");
        }
    }

    /// Rebuild a halted plan from the status persisted before a restart.
    ///
    /// Only applies when no plan is held for the parent and the persisted
    /// rollout halted on the same DaemonSet generation; the failed node is
    /// then left alone until the DaemonSet changes or the plan is reset.
    pub fn restore_halted(
        &self,
        target: &RolloutTarget,
        persisted: &RolloutStatus,
        failure: Option<String>,
    ) -> bool {
        if !persisted.halted
            || persisted.target_generation != target.target_generation
            || self.plans.contains_key(&target.parent)
            || self.released.get(&target.parent).map(|g| *g) == Some(target.target_generation)
        {
            return false;
        }
        let nodes = persisted
            .nodes
            .iter()
            .map(|n| NodeRolloutState {
                node: n.node_name.clone(),
                phase: NodePhase::parse(&n.phase).unwrap_or(NodePhase::Pending),
                last_transition: n.last_transition_time,
                message: None,
            })
            .collect();
        let plan = RolloutPlan {
            target: target.clone(),
            nodes,
            halted: true,
            failure,
        };
        info!(
            parent = %target.parent,
            generation = target.target_generation,
            "Restored halted rollout plan from status"
        );
        self.plans.insert(target.parent.clone(), plan);
        true
    }

    /// Return the plan for `target`, computing a new one when none exists or
    /// the existing plan targets another DaemonSet generation.
    ///
    /// Nodes already running the target generation start out `Done`.
    pub async fn ensure_plan(&self, target: RolloutTarget) -> Result<RolloutPlan> {
        if let Some(mut plan) = self.plans.get_mut(&target.parent) {
            if plan.target.daemon_set == target.daemon_set
                && plan.target.target_generation == target.target_generation
            {
                plan.target.parent_generation = target.parent_generation;
                return Ok(plan.clone());
            }
        }

        let mut nodes = self.plugins.list_nodes(target.node_selector.as_ref()).await?;
        nodes.sort();
        nodes.dedup();

        let now = Utc::now();
        let mut states = Vec::with_capacity(nodes.len());
        for node in nodes {
            let current = self
                .plugins
                .plugin_socket_ready(&node, &target.daemon_set, target.target_generation)
                .await?;
            states.push(NodeRolloutState {
                node,
                phase: if current { NodePhase::Done } else { NodePhase::Pending },
                last_transition: now,
                message: None,
            });
        }

        let plan = RolloutPlan {
            target,
            nodes: states,
            halted: false,
            failure: None,
        };
        info!(
            parent = %plan.target.parent,
            daemon_set = %plan.target.daemon_set,
            generation = plan.target.target_generation,
            strategy = %plan.target.strategy,
            nodes = plan.nodes.len(),
            pending = plan.nodes.iter().filter(|n| n.phase == NodePhase::Pending).count(),
            "Computed rollout plan"
        );
        if let Some(previous) = self.plans.insert(plan.target.parent.clone(), plan.clone()) {
            debug!(
                previous_generation = previous.target.target_generation,
                halted = previous.halted,
                "Replaced rollout plan"
            );
        }
        Ok(plan)
    }

    /// Drive the parent's plan until every node is `Done` or the plan halts.
    ///
    /// A completed plan is removed from the table and returned. A halted plan
    /// is returned untouched.
    pub async fn execute(&self, parent: &ParentKey) -> Result<RolloutPlan> {
        loop {
            let plan = self.snapshot(parent).ok_or_else(|| Error::RolloutAborted {
                resource: parent.to_string(),
                reason: "no rollout plan".to_string(),
            })?;

            if plan.is_complete() {
                self.plans.remove(parent);
                info!(
                    parent = %parent,
                    generation = plan.target.target_generation,
                    "Rollout complete"
                );
                return Ok(plan);
            }
            if plan.halted {
                return Ok(plan);
            }

            let batch: Vec<String> = plan
                .nodes
                .iter()
                .filter(|n| n.phase == NodePhase::Pending)
                .take(self.config.max_concurrent_nodes.max(1))
                .map(|n| n.node.clone())
                .collect();
            if batch.is_empty() {
                return Ok(plan);
            }

            let target = &plan.target;
            let results = join_all(batch.iter().map(|node| self.roll_node(target, node))).await;
            if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                return Err(err);
            }
        }
    }

    async fn roll_node(&self, target: &RolloutTarget, node: &str) -> Result<()> {
        let mut cordoned = false;
        let Err(err) = self.drive_node(target, node, &mut cordoned).await else {
            return Ok(());
        };

        let phase = self
            .snapshot(&target.parent)
            .and_then(|p| p.phase(node))
            .unwrap_or(NodePhase::Pending);
        // A node that failed verification for good keeps its cordon until
        // someone looks; a retry starts again from Cordoning
        let keep_cordon = phase == NodePhase::Verifying && !err.is_retryable();
        let release = cordoned && !keep_cordon;

        match &err {
            Error::RolloutAborted { .. } => {
                if cordoned {
                    self.release(node).await;
                }
            }
            e if e.is_retryable() => {
                if release {
                    self.release(node).await;
                }
                warn!(node, phase = %phase, error = %e, "Node rollout step failed, will retry");
                self.transition(&target.parent, node, NodePhase::Pending, Some(e.to_string()));
            }
            e => {
                if release {
                    self.release(node).await;
                }
                warn!(node, phase = %phase, error = %e, "Node rollout failed, halting plan");
                self.transition(&target.parent, node, NodePhase::Failed, Some(e.to_string()));
                if let Some(mut plan) = self.plans.get_mut(&target.parent) {
                    plan.halted = true;
                    plan.failure = Some(e.to_string());
                }
            }
        }
        Err(err)
    }

    async fn drive_node(&self, target: &RolloutTarget, node: &str, cordoned: &mut bool) -> Result<()> {
        let drain = target.strategy == NodeUpdateStrategy::Drain;

        if drain {
            self.step(target, node, NodePhase::Cordoning).await?;
            self.drainer.cordon(node).await?;
            *cordoned = true;

            self.step(target, node, NodePhase::Draining).await?;
            let pods = self.drainer.pods_using_driver(node, &target.driver_name).await?;
            for pod in &pods {
                self.guard(target).await?;
                match self.drainer.evict(pod, self.config.eviction_timeout).await? {
                    EvictionOutcome::Acknowledged => debug!(node, pod = %pod, "Pod evicted"),
                    EvictionOutcome::TimedOut => {
                        return Err(Error::RolloutTimeout {
                            node: node.to_string(),
                            phase: NodePhase::Draining.to_string(),
                            timeout: self.config.eviction_timeout,
                        })
                    }
                }
            }
        }

        self.step(target, node, NodePhase::Updating).await?;
        self.plugins.replace_plugin_pod(node, &target.daemon_set).await?;

        self.step(target, node, NodePhase::Verifying).await?;
        self.wait_for_socket(target, node).await?;

        self.guard(target).await?;
        if drain {
            self.drainer.uncordon(node).await?;
            *cordoned = false;
        }
        self.transition(&target.parent, node, NodePhase::Done, None);
        Ok(())
    }

    async fn wait_for_socket(&self, target: &RolloutTarget, node: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.verify_timeout;
        loop {
            if self
                .plugins
                .plugin_socket_ready(node, &target.daemon_set, target.target_generation)
                .await?
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::RolloutTimeout {
                    node: node.to_string(),
                    phase: NodePhase::Verifying.to_string(),
                    timeout: self.config.verify_timeout,
                });
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.verify_interval) => {}
            }
            self.guard(target).await?;
        }
    }

    /// Guard, then move the node into `phase`
    async fn step(&self, target: &RolloutTarget, node: &str, phase: NodePhase) -> Result<()> {
        self.guard(target).await?;
        self.transition(&target.parent, node, phase, None);
        Ok(())
    }

    /// Abort unless the parent still exists at the planned generation
    async fn guard(&self, target: &RolloutTarget) -> Result<()> {
        let aborted = |reason: String| Error::RolloutAborted {
            resource: target.parent.to_string(),
            reason,
        };

        if self.shutdown.is_cancelled() {
            return Err(aborted("operator shutting down".to_string()));
        }
        if !self.plans.contains_key(&target.parent) {
            return Err(aborted("plan discarded".to_string()));
        }

        let reason = match self.store.get_parent(&target.parent).await? {
            None => "resource deleted".to_string(),
            Some(resource) if resource.is_deleting() => "resource deleted".to_string(),
            Some(resource) if resource.generation() != target.parent_generation => format!(
                "generation changed from {} to {}",
                target.parent_generation,
                resource.generation()
            ),
            Some(_) => return Ok(()),
        };
        self.abort(&target.parent, &reason);
        Err(aborted(reason))
    }

    fn transition(&self, parent: &ParentKey, node: &str, phase: NodePhase, message: Option<String>) {
        let Some(mut plan) = self.plans.get_mut(parent) else {
            return;
        };
        let Some(state) = plan.nodes.iter_mut().find(|n| n.node == node) else {
            return;
        };
        debug!(node, from = %state.phase, to = %phase, "Node phase transition");
        state.phase = phase;
        state.last_transition = Utc::now();
        state.message = message;
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(phase.as_str());
        }
    }

    async fn release(&self, node: &str) {
        if let Err(e) = self.drainer.uncordon(node).await {
            warn!(node, error = %e, "Failed to uncordon node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fixtures;
    use crate::domain::ports::{ObjectKind, ProvisionerKind};
    use crate::store::{MemoryObjectStore, NodeEvent, SimulatedNodes};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    struct Harness {
        store: Arc<MemoryObjectStore>,
        nodes: Arc<SimulatedNodes>,
        coordinator: RolloutCoordinator,
        target: RolloutTarget,
    }

    async fn harness(strategy: NodeUpdateStrategy, node_names: &[&str]) -> Harness {
        let store = MemoryObjectStore::new();
        store.put_parent(fixtures::csi_driver("storage", "nfs", "csi.example.com"));
        let daemon_set = fixtures::create_node_daemon_set(&store, "storage", "nfs").await;

        let nodes = SimulatedNodes::new(store.clone());
        for name in node_names {
            nodes.add_node(name, Default::default());
            nodes.add_pod(name, &format!("app-{}", name), Some("csi.example.com"));
            nodes.add_pod(name, &format!("other-{}", name), None);
            nodes.run_plugin(name, &daemon_set.identity, 1);
        }
        fixtures::bump_daemon_set(&store, &daemon_set.identity).await;

        let config = RolloutConfig {
            max_concurrent_nodes: 1,
            eviction_timeout: Duration::from_millis(50),
            verify_timeout: Duration::from_millis(50),
            verify_interval: Duration::from_millis(5),
        };
        let coordinator = RolloutCoordinator::new(
            store.clone(),
            nodes.clone(),
            nodes.clone(),
            config,
            CancellationToken::new(),
        );
        let target = RolloutTarget {
            parent: ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "nfs"),
            parent_generation: 1,
            daemon_set: daemon_set.identity.clone(),
            target_generation: 2,
            strategy,
            driver_name: "csi.example.com".into(),
            node_selector: None,
        };
        Harness {
            store,
            nodes,
            coordinator,
            target,
        }
    }

    #[tokio::test]
    async fn test_drain_halts_on_stuck_eviction() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-1", "node-2", "node-3"]).await;
        h.nodes.stick_eviction("node-2", "app-node-2");

        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        let err = h.coordinator.execute(&h.target.parent).await.unwrap_err();
        assert_matches!(err, Error::RolloutTimeout { ref node, ref phase, .. } if node == "node-2" && phase == "Draining");

        let plan = h.coordinator.snapshot(&h.target.parent).unwrap();
        assert!(plan.halted);
        assert_eq!(plan.phase("node-1"), Some(NodePhase::Done));
        assert_eq!(plan.phase("node-2"), Some(NodePhase::Failed));
        assert_eq!(plan.phase("node-3"), Some(NodePhase::Pending));

        // Failure while draining releases the node
        assert!(!h.nodes.is_cordoned("node-2"));
        assert_eq!(h.nodes.plugin_generation("node-3", &h.target.daemon_set), Some(1));

        let status = plan.to_status();
        assert!(status.halted);
        assert_eq!(status.nodes[1].phase, "Failed");

        // A halted plan is not resumed
        let events_before = h.nodes.events().len();
        let again = h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        assert!(again.halted);
        let plan = h.coordinator.execute(&h.target.parent).await.unwrap();
        assert!(plan.halted);
        assert_eq!(h.nodes.events().len(), events_before);

        // Reset starts over, skipping the node already updated
        h.coordinator.reset(&h.target.parent);
        let fresh = h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        assert_eq!(fresh.phase("node-1"), Some(NodePhase::Done));
        assert_eq!(fresh.phase("node-2"), Some(NodePhase::Pending));
    }

    #[tokio::test]
    async fn test_drain_orders_evictions_before_replacement() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-a", "node-b"]).await;
        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        let plan = h.coordinator.execute(&h.target.parent).await.unwrap();
        assert!(plan.is_complete());
        assert!(h.coordinator.snapshot(&h.target.parent).is_none());

        let events = h.nodes.events();
        for node in ["node-a", "node-b"] {
            let pos = |wanted: &NodeEvent| events.iter().position(|e| e == wanted).unwrap();
            let cordon = pos(&NodeEvent::Cordoned(node.into()));
            let evict = pos(&NodeEvent::Evicted {
                node: node.into(),
                pod: format!("app-{}", node),
            });
            let replace = pos(&NodeEvent::PluginReplaced(node.into()));
            let uncordon = pos(&NodeEvent::Uncordoned(node.into()));
            assert!(cordon < evict && evict < replace && replace < uncordon);

            // Pods not using the driver stay put
            assert!(!events.contains(&NodeEvent::Evicted {
                node: node.into(),
                pod: format!("other-{}", node),
            }));
        }

        // One node at a time
        let first_b = events.iter().position(|e| e.node() == "node-b").unwrap();
        let last_a = events.iter().rposition(|e| e.node() == "node-a").unwrap();
        assert!(last_a < first_b);
    }

    #[tokio::test]
    async fn test_rolling_skips_drain() {
        let h = harness(NodeUpdateStrategy::Rolling, &["node-1", "node-2"]).await;
        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        h.coordinator.execute(&h.target.parent).await.unwrap();

        let events = h.nodes.events();
        assert!(events
            .iter()
            .all(|e| matches!(e, NodeEvent::PluginReplaced(_))));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_verify_timeout_keeps_node_cordoned() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-1"]).await;
        h.nodes.never_ready("node-1");

        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        let err = h.coordinator.execute(&h.target.parent).await.unwrap_err();
        assert_matches!(err, Error::RolloutTimeout { ref phase, .. } if phase == "Verifying");
        assert!(h.nodes.is_cordoned("node-1"));
        let plan = h.coordinator.snapshot(&h.target.parent).unwrap();
        assert_eq!(plan.phase("node-1"), Some(NodePhase::Failed));
    }

    #[tokio::test]
    async fn test_retry_after_verify_error_releases_cordon() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-1"]).await;
        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        h.nodes.fail_socket_checks("node-1", 1);

        let err = h.coordinator.execute(&h.target.parent).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!h.nodes.is_cordoned("node-1"));
        let plan = h.coordinator.snapshot(&h.target.parent).unwrap();
        assert_eq!(plan.phase("node-1"), Some(NodePhase::Pending));
        assert!(!plan.halted);

        let plan = h.coordinator.execute(&h.target.parent).await.unwrap();
        assert!(plan.is_complete());
        assert!(!h.nodes.is_cordoned("node-1"));

        // Every cordon is matched by an uncordon before the next one
        let mut cordoned = false;
        for event in h.nodes.events() {
            match event {
                NodeEvent::Cordoned(_) => {
                    assert!(!cordoned, "cordoned twice");
                    cordoned = true;
                }
                NodeEvent::Uncordoned(_) => cordoned = false,
                _ => {}
            }
        }
        assert!(!cordoned);
    }

    #[tokio::test]
    async fn test_restore_halted_only_for_same_generation() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-1", "node-2"]).await;
        let persisted = RolloutStatus {
            target_generation: 2,
            strategy: "Drain".into(),
            halted: true,
            nodes: vec![
                NodeRolloutStatus {
                    node_name: "node-1".into(),
                    phase: "Done".into(),
                    last_transition_time: Utc::now(),
                },
                NodeRolloutStatus {
                    node_name: "node-2".into(),
                    phase: "Failed".into(),
                    last_transition_time: Utc::now(),
                },
            ],
        };

        let mut newer = h.target.clone();
        newer.target_generation = 3;
        assert!(!h.coordinator.restore_halted(&newer, &persisted, None));

        assert!(h
            .coordinator
            .restore_halted(&h.target, &persisted, Some("timed out".into())));
        let plan = h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        assert!(plan.halted);
        assert_eq!(plan.failure.as_deref(), Some("timed out"));
        assert_eq!(plan.phase("node-2"), Some(NodePhase::Failed));
        h.coordinator.execute(&h.target.parent).await.unwrap();
        assert!(h.nodes.events().is_empty());

        // An explicit reset is not undone by the persisted status
        h.coordinator.reset(&h.target.parent);
        assert!(!h.coordinator.restore_halted(&h.target, &persisted, None));
    }

    #[tokio::test]
    async fn test_parent_change_aborts_plan() {
        let h = harness(NodeUpdateStrategy::Drain, &["node-1"]).await;
        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();

        h.store.put_parent(fixtures::csi_driver("storage", "nfs", "csi.other.com"));
        let err = h.coordinator.execute(&h.target.parent).await.unwrap_err();
        assert_matches!(err, Error::RolloutAborted { .. });
        assert!(h.coordinator.snapshot(&h.target.parent).is_none());
        assert!(h.nodes.events().is_empty());
    }

    #[tokio::test]
    async fn test_parent_deletion_aborts_plan() {
        let h = harness(NodeUpdateStrategy::Rolling, &["node-1"]).await;
        h.coordinator.ensure_plan(h.target.clone()).await.unwrap();
        h.store.delete_parent(&h.target.parent);

        let err = h.coordinator.execute(&h.target.parent).await.unwrap_err();
        assert_matches!(err, Error::RolloutAborted { ref reason, .. } if reason == "resource deleted");
        assert_eq!(
            h.nodes.plugin_generation("node-1", &h.target.daemon_set),
            Some(1)
        );
        assert_eq!(h.target.daemon_set.kind, ObjectKind::DaemonSet);
    }
}
