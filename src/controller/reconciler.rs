//! Reconciler and Controller
//!
//! [`Reconciler`] runs one full pass for one provisioner resource:
//! synthesize, diff/apply, roll out node plugins, aggregate status.
//! [`Controller`] feeds it from the work queue with a fixed worker pool,
//! translating store events and periodic resyncs into queued keys.

use crate::controller::diff_apply::{ApplyReport, DiffApplyEngine};
use crate::controller::ledger::{FileLedgerBackend, GenerationLedger};
use crate::controller::metrics::OperatorMetrics;
use crate::controller::rollout::{RolloutCoordinator, RolloutPlan, RolloutTarget};
use crate::controller::status::{
    ConditionInput, StatusAggregator, StatusInput, CONDITION_RECONCILE_FAILED,
    CONDITION_ROLLOUT_DEGRADED, CONDITION_SPEC_VALID, CONDITION_STORAGE_CLASS_ADOPTED,
};
use crate::controller::synthesizer::DesiredStateSynthesizer;
use crate::controller::workqueue::WorkQueue;
use crate::controller::OperatorConfig;
use crate::crd::{ConditionStatus, ManagementState, StorageStatus};
use crate::domain::ports::{NodeDrainerRef, NodePluginsRef, ObjectStoreRef, ParentKey};
use crate::domain::resource::ProvisionerResource;
use crate::error::{Error, ErrorAction, Result};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Reconciler
// =============================================================================

/// What a successful pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Child creates, updates and deletes
    pub child_writes: usize,
    pub status_written: bool,
}

pub struct Reconciler {
    store: ObjectStoreRef,
    synthesizer: DesiredStateSynthesizer,
    engine: DiffApplyEngine,
    ledger: Arc<GenerationLedger>,
    rollouts: RolloutCoordinator,
    metrics: OperatorMetrics,
}

impl Reconciler {
    pub fn new(
        config: &OperatorConfig,
        store: ObjectStoreRef,
        drainer: NodeDrainerRef,
        plugins: NodePluginsRef,
        ledger: Arc<GenerationLedger>,
        metrics: OperatorMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        let engine = DiffApplyEngine::new(store.clone(), ledger.clone(), config.retry.clone())
            .with_metrics(metrics.clone());
        let rollouts = RolloutCoordinator::new(
            store.clone(),
            drainer,
            plugins,
            config.rollout.clone(),
            shutdown,
        )
        .with_metrics(metrics.clone());
        Self {
            store,
            synthesizer: DesiredStateSynthesizer::new(config.synthesizer.clone()),
            engine,
            ledger,
            rollouts,
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<GenerationLedger> {
        &self.ledger
    }

    pub fn rollouts(&self) -> &RolloutCoordinator {
        &self.rollouts
    }

    /// Run one full pass for `key`
    #[instrument(skip(self), fields(parent = %key))]
    pub async fn reconcile(&self, key: &ParentKey) -> Result<ReconcileOutcome> {
        let start = Instant::now();
        let result = self.reconcile_inner(key).await;
        let label = match &result {
            Ok(_) => "success",
            Err(e) if e.is_retryable() => "retry",
            Err(_) => "failed",
        };
        self.metrics
            .record_reconcile(key.kind.as_str(), label, start.elapsed());
        result
    }

    async fn reconcile_inner(&self, key: &ParentKey) -> Result<ReconcileOutcome> {
        let resource = match self.store.get_parent(key).await? {
            Some(resource) if !resource.is_deleting() => resource,
            _ => return self.collect_garbage(key).await,
        };

        let previous = resource.status();
        self.ledger.restore(
            key,
            &previous.children_generations,
            previous.rollout.is_some(),
        )?;

        match resource.management_state() {
            ManagementState::Unmanaged => {
                debug!("Resource is unmanaged, skipping");
                Ok(ReconcileOutcome::default())
            }
            ManagementState::Removed => self.reconcile_removed(key, &resource, &previous).await,
            ManagementState::Managed => self.reconcile_managed(key, &resource, &previous).await,
        }
    }

    /// Delete the children of a parent that no longer exists
    async fn collect_garbage(&self, key: &ParentKey) -> Result<ReconcileOutcome> {
        self.rollouts.abort(key, "resource deleted");
        if self.ledger.children_of(key).is_empty() {
            return Ok(ReconcileOutcome::default());
        }
        let report = self.engine.delete_children(key).await?;
        info!(deleted = report.writes(), "Collected children of deleted resource");
        Ok(ReconcileOutcome {
            child_writes: report.writes(),
            status_written: false,
        })
    }

    async fn reconcile_removed(
        &self,
        key: &ParentKey,
        resource: &ProvisionerResource,
        previous: &StorageStatus,
    ) -> Result<ReconcileOutcome> {
        self.rollouts.abort(key, "management state is Removed");
        let report = self.engine.delete_children(key).await?;
        if report.writes() > 0 {
            info!(deleted = report.writes(), "Removed children");
        }
        let status_written = self
            .write_status(key, resource.generation(), previous, Vec::new(), None)
            .await?;
        Ok(ReconcileOutcome {
            child_writes: report.writes(),
            status_written,
        })
    }

    async fn reconcile_managed(
        &self,
        key: &ParentKey,
        resource: &ProvisionerResource,
        previous: &StorageStatus,
    ) -> Result<ReconcileOutcome> {
        let generation = resource.generation();

        let desired = match self.synthesizer.desired_children(resource) {
            Ok(desired) => desired,
            Err(e @ Error::InvalidSpec { .. }) => {
                warn!(error = %e, "Spec rejected, existing children left as they are");
                let conditions = replace_condition(
                    previous,
                    ConditionInput::new(
                        CONDITION_SPEC_VALID,
                        ConditionStatus::False,
                        "InvalidSpec",
                        e.to_string(),
                    ),
                );
                let plan = self.rollouts.snapshot(key);
                self.write_status(key, previous.observed_generation, previous, conditions, plan.as_ref())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let gated = match resource {
            ProvisionerResource::CsiDriver(_) => vec![DesiredStateSynthesizer::node_identity(key)],
            _ => Vec::new(),
        };
        let report = match self.engine.reconcile(key, &desired, &gated).await {
            Ok(report) => report,
            Err(e @ Error::RetriesExhausted { .. }) => {
                let conditions = replace_condition(
                    previous,
                    ConditionInput::new(
                        CONDITION_RECONCILE_FAILED,
                        ConditionStatus::True,
                        "RetriesExhausted",
                        e.to_string(),
                    ),
                );
                let plan = self.rollouts.snapshot(key);
                self.write_status(key, previous.observed_generation, previous, conditions, plan.as_ref())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let (plan, rollout_error) = match resource {
            ProvisionerResource::CsiDriver(r) => {
                let target = RolloutTarget {
                    parent: key.clone(),
                    parent_generation: generation,
                    daemon_set: DesiredStateSynthesizer::node_identity(key),
                    target_generation: 0,
                    strategy: r.spec.effective_update_strategy(),
                    driver_name: r.spec.driver_name.clone(),
                    node_selector: r.spec.node_selector.clone(),
                };
                self.roll_out(target, previous).await?
            }
            _ => (None, None),
        };

        let conditions = managed_conditions(resource, &report, plan.as_ref());
        let status_written = self
            .write_status(key, generation, previous, conditions, plan.as_ref())
            .await?;

        if let Some(e) = rollout_error {
            return Err(e);
        }
        Ok(ReconcileOutcome {
            child_writes: report.writes(),
            status_written,
        })
    }

    /// Roll the node DaemonSet out when its applied generation is ahead of
    /// the observed one. Returns the plan to report and a rollout error to
    /// surface after the status write.
    ///
    /// A rollout that halted before a restart is picked up from `previous`
    /// and stays halted.
    async fn roll_out(
        &self,
        mut target: RolloutTarget,
        previous: &StorageStatus,
    ) -> Result<(Option<RolloutPlan>, Option<Error>)> {
        let settling = self
            .ledger
            .get(&target.daemon_set)
            .filter(|record| record.is_settling());
        let Some(record) = settling else {
            self.rollouts.reset(&target.parent);
            return Ok((None, None));
        };
        target.target_generation = record.applied_generation;

        if let Some(persisted) = &previous.rollout {
            let failure = previous
                .condition(CONDITION_ROLLOUT_DEGRADED)
                .filter(|c| c.status == ConditionStatus::True)
                .map(|c| c.message.clone());
            self.rollouts.restore_halted(&target, persisted, failure);
        }

        let parent = target.parent.clone();
        let daemon_set = target.daemon_set.clone();
        self.rollouts.ensure_plan(target).await?;
        match self.rollouts.execute(&parent).await {
            Ok(plan) if plan.is_complete() => {
                self.ledger
                    .mark_observed(&daemon_set, plan.target.target_generation)?;
                Ok((None, None))
            }
            Ok(plan) => Ok((Some(plan), None)),
            Err(e) => Ok((self.rollouts.snapshot(&parent), Some(e))),
        }
    }

    /// Compute the status and write it when it differs from `previous`
    async fn write_status(
        &self,
        key: &ParentKey,
        generation: i64,
        previous: &StorageStatus,
        conditions: Vec<ConditionInput>,
        plan: Option<&RolloutPlan>,
    ) -> Result<bool> {
        let records = self.ledger.children_of(key);
        let status = StatusAggregator::compute(StatusInput {
            generation,
            previous,
            records: &records,
            rollout: plan,
            conditions,
            now: Utc::now(),
        });
        if &status == previous {
            return Ok(false);
        }
        self.store.update_parent_status(key, &status).await?;
        debug!(
            observed_generation = status.observed_generation,
            children = status.children_generations.len(),
            "Status updated"
        );
        Ok(true)
    }
}

/// Conditions after a successful apply
fn managed_conditions(
    resource: &ProvisionerResource,
    report: &ApplyReport,
    plan: Option<&RolloutPlan>,
) -> Vec<ConditionInput> {
    let mut conditions = vec![ConditionInput::new(
        CONDITION_SPEC_VALID,
        ConditionStatus::True,
        "Valid",
        "",
    )];

    if let ProvisionerResource::CsiDriver(_) = resource {
        let halted = plan.filter(|p| p.halted);
        conditions.push(match halted {
            Some(plan) => ConditionInput::new(
                CONDITION_ROLLOUT_DEGRADED,
                ConditionStatus::True,
                "NodeRolloutFailed",
                plan.failure.clone().unwrap_or_default(),
            ),
            None => ConditionInput::new(
                CONDITION_ROLLOUT_DEGRADED,
                ConditionStatus::False,
                "AsExpected",
                "",
            ),
        });
    }

    conditions.push(ConditionInput::new(
        CONDITION_RECONCILE_FAILED,
        ConditionStatus::False,
        "Succeeded",
        "",
    ));

    if !report.adoption_conflicts.is_empty() {
        let names: Vec<String> = report
            .adoption_conflicts
            .iter()
            .map(|id| id.to_string())
            .collect();
        conditions.push(ConditionInput::new(
            CONDITION_STORAGE_CLASS_ADOPTED,
            ConditionStatus::True,
            "ExistingObject",
            format!("left untouched, not owned by this resource: {}", names.join(", ")),
        ));
    }
    conditions
}

/// Previous conditions with one of them replaced or added
fn replace_condition(previous: &StorageStatus, replacement: ConditionInput) -> Vec<ConditionInput> {
    let mut conditions: Vec<ConditionInput> = previous
        .conditions
        .iter()
        .map(|c| ConditionInput::new(c.type_.clone(), c.status, c.reason.clone(), c.message.clone()))
        .collect();
    match conditions.iter_mut().find(|c| c.type_ == replacement.type_) {
        Some(existing) => *existing = replacement,
        None => conditions.push(replacement),
    }
    conditions
}

// =============================================================================
// Controller
// =============================================================================

/// Worker pool driving the reconciler from store events
pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: ObjectStoreRef,
    ledger: Arc<GenerationLedger>,
    queue: Arc<WorkQueue<ParentKey>>,
    config: OperatorConfig,
    metrics: OperatorMetrics,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: OperatorConfig,
        store: ObjectStoreRef,
        drainer: NodeDrainerRef,
        plugins: NodePluginsRef,
        metrics: OperatorMetrics,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let ledger = match &config.ledger_path {
            Some(path) => GenerationLedger::open(Arc::new(FileLedgerBackend::new(path)))?,
            None => GenerationLedger::in_memory(),
        };
        let reconciler = Arc::new(Reconciler::new(
            &config,
            store.clone(),
            drainer,
            plugins,
            ledger.clone(),
            metrics.clone(),
            shutdown.clone(),
        ));
        let queue = WorkQueue::new(config.queue_base_delay, config.queue_max_delay);
        Ok(Self {
            reconciler,
            store,
            ledger,
            queue,
            config,
            metrics,
            shutdown,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ParentKey>> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let mut events = self.store.subscribe();
        self.resync().await;

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    self.queue.clone(),
                    self.reconciler.clone(),
                ))
            })
            .collect();
        info!(workers = workers.len(), "Controller started");

        let period = self.config.resync_interval;
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(key) = event.parent_key() {
                            self.queue.add(key.clone());
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Store events lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        error!("Store event stream closed");
                        break;
                    }
                },
                _ = resync.tick() => self.resync().await,
            }
            self.metrics.queue_depth.set(self.queue.len() as i64);
        }

        info!("Controller shutting down");
        self.queue.shutdown();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        Ok(())
    }

    /// Queue every known resource, including parents only the ledger
    /// remembers so their children are collected
    async fn resync(&self) {
        match self.store.list_parents().await {
            Ok(keys) => {
                debug!(count = keys.len(), "Resync");
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list resources for resync"),
        }
        for key in self.ledger.parents() {
            self.queue.add(key);
        }
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue<ParentKey>>, reconciler: Arc<Reconciler>) {
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(outcome) => {
                queue.forget(&key);
                if outcome.child_writes > 0 || outcome.status_written {
                    debug!(worker = id, parent = %key, ?outcome, "Reconciled");
                }
            }
            Err(e) => match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    let delay = queue.add_rate_limited(key.clone());
                    warn!(worker = id, parent = %key, error = %e, retry_in = ?delay, "Reconcile failed");
                }
                ErrorAction::RequeueAfter(delay) => {
                    queue.add_after(key.clone(), delay);
                    warn!(worker = id, parent = %key, error = %e, retry_in = ?delay, "Reconcile failed");
                }
                ErrorAction::NoRequeue => {
                    queue.forget(&key);
                    warn!(worker = id, parent = %key, error = %e, "Reconcile failed, waiting for a change");
                }
            },
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}
