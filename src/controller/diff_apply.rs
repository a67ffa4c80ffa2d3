//! Diff/Apply Engine
//!
//! Converges the observed child objects of one parent onto its desired set:
//! creates what is missing, updates owned objects that drifted, leaves foreign
//! objects alone, and deletes children the parent no longer wants. Every
//! write is recorded in the generation ledger.

use crate::controller::ledger::{ChildResourceRecord, GenerationLedger};
use crate::controller::metrics::OperatorMetrics;
use crate::domain::ports::{
    DesiredObject, ObjectIdentity, ObjectKind, ObjectStoreRef, ParentKey, StoredObject,
};
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential retry for conflicting and transient store writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per child operation, including the first
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

// =============================================================================
// Report
// =============================================================================

/// What the engine did with one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
    /// Present and not owned by the parent; left untouched
    Adopted,
    Deleted,
}

impl ApplyAction {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ApplyAction::Created | ApplyAction::Updated | ApplyAction::Deleted
        )
    }
}

/// Per-child result of a pass
#[derive(Debug, Clone, PartialEq)]
pub struct ChildOutcome {
    pub identity: ObjectIdentity,
    pub action: ApplyAction,
    /// Generation in the store after the pass; 0 for deleted and adopted children
    pub generation: i64,
}

/// Result of converging one parent's children
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<ChildOutcome>,
    /// Existing objects with a desired identity that the parent does not own
    pub adoption_conflicts: Vec<ObjectIdentity>,
    /// Ledger records of the parent after the pass
    pub records: Vec<ChildResourceRecord>,
}

impl ApplyReport {
    pub fn outcome(&self, identity: &ObjectIdentity) -> Option<&ChildOutcome> {
        self.outcomes.iter().find(|o| &o.identity == identity)
    }

    pub fn action(&self, identity: &ObjectIdentity) -> Option<ApplyAction> {
        self.outcome(identity).map(|o| o.action)
    }

    /// Number of store writes the pass performed
    pub fn writes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.action.is_write()).count()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct DiffApplyEngine {
    store: ObjectStoreRef,
    ledger: Arc<GenerationLedger>,
    retry: RetryPolicy,
    metrics: Option<OperatorMetrics>,
}

impl DiffApplyEngine {
    pub fn new(store: ObjectStoreRef, ledger: Arc<GenerationLedger>, retry: RetryPolicy) -> Self {
        Self {
            store,
            ledger,
            retry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OperatorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ledger(&self) -> &Arc<GenerationLedger> {
        &self.ledger
    }

    /// Converge the parent's children onto `desired`.
    ///
    /// DaemonSets listed in `rollout_gated` are rolled out node by node, so an
    /// update to one of them is not marked observed here.
    #[instrument(skip(self, desired, rollout_gated), fields(parent = %parent))]
    pub async fn reconcile(
        &self,
        parent: &ParentKey,
        desired: &[DesiredObject],
        rollout_gated: &[ObjectIdentity],
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for object in desired {
            let gated = rollout_gated.contains(&object.identity);
            let operation = format!("apply {}", object.identity);
            let (outcome, conflict) = self
                .with_retry(&operation, || self.apply_one(parent, object, gated))
                .await?;
            if conflict {
                report.adoption_conflicts.push(object.identity.clone());
            }
            report.outcomes.push(outcome);
        }

        let wanted: BTreeSet<&ObjectIdentity> = desired.iter().map(|d| &d.identity).collect();
        for record in self.ledger.children_of(parent) {
            if wanted.contains(&record.child) {
                continue;
            }
            let operation = format!("delete {}", record.child);
            let outcome = self
                .with_retry(&operation, || self.delete_one(parent, &record.child))
                .await?;
            report.outcomes.push(outcome);
        }

        report.records = self.ledger.children_of(parent);
        Ok(report)
    }

    /// Delete every child the ledger attributes to the parent
    pub async fn delete_children(&self, parent: &ParentKey) -> Result<ApplyReport> {
        self.reconcile(parent, &[], &[]).await
    }

    async fn apply_one(
        &self,
        parent: &ParentKey,
        desired: &DesiredObject,
        gated: bool,
    ) -> Result<(ChildOutcome, bool)> {
        let id = &desired.identity;
        let Some(observed) = self.store.get(id).await? else {
            self.ledger.mark_pending(parent, id)?;
            let created = self.store.create(desired).await?;
            self.count_write("create", id.kind);
            self.ledger.record(parent, id, created.generation)?;
            self.ledger.mark_observed(id, created.generation)?;
            info!(child = %id, generation = created.generation, "Created child");
            return Ok((outcome(id, ApplyAction::Created, created.generation), false));
        };

        if !observed.is_owned_by(parent) {
            warn!(
                child = %id,
                owner = ?observed.owner(),
                "Child exists and is not owned by this resource, leaving it untouched"
            );
            return Ok((outcome(id, ApplyAction::Adopted, 0), true));
        }

        // StorageClasses are immutable once created
        if id.kind == ObjectKind::StorageClass || !needs_update(desired, &observed)? {
            self.settle_unchanged(parent, &observed, gated)?;
            return Ok((outcome(id, ApplyAction::Unchanged, observed.generation), false));
        }

        let updated = self.store.update(desired, &observed.resource_version).await?;
        self.count_write("update", id.kind);
        self.ledger.record(parent, id, updated.generation)?;
        if !gated {
            self.ledger.mark_observed(id, updated.generation)?;
        }
        info!(
            child = %id,
            from = observed.generation,
            to = updated.generation,
            "Updated child"
        );
        Ok((outcome(id, ApplyAction::Updated, updated.generation), false))
    }

    /// Refresh the ledger from an object that needs no write
    fn settle_unchanged(&self, parent: &ParentKey, observed: &StoredObject, gated: bool) -> Result<()> {
        let id = &observed.identity;
        let previous = self.ledger.get(id);
        self.ledger.record(parent, id, observed.generation)?;
        let known = previous.map_or(false, |r| !r.is_pending());
        if !gated || !known {
            self.ledger.mark_observed(id, observed.generation)?;
        }
        Ok(())
    }

    async fn delete_one(&self, parent: &ParentKey, id: &ObjectIdentity) -> Result<ChildOutcome> {
        match self.store.get(id).await? {
            Some(observed) if observed.is_owned_by(parent) => {
                self.store.delete(id).await?;
                self.count_write("delete", id.kind);
                info!(child = %id, "Deleted child");
            }
            Some(_) => {
                warn!(child = %id, "Recorded child is no longer owned by this resource, forgetting it");
            }
            None => debug!(child = %id, "Recorded child already gone"),
        }
        self.ledger.forget(id)?;
        Ok(outcome(id, ApplyAction::Deleted, 0))
    }

    /// Run an operation, retrying transient errors with exponential backoff
    /// until the attempt budget is spent
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0u32;

        let result = backoff::future::retry(self.retry.backoff(), || {
            attempts += 1;
            let attempt = attempts;
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() && attempt < max_attempts {
                        debug!(operation, attempt, error = %e, "Retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await;

        match result {
            Err(e) if e.is_transient() => {
                warn!(operation, attempts, error = %e, "Retry budget exhausted");
                Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    last_error: e.to_string(),
                })
            }
            other => other,
        }
    }

    fn count_write(&self, verb: &str, kind: ObjectKind) {
        if let Some(metrics) = &self.metrics {
            metrics.record_write(verb, kind.as_str());
        }
    }
}

fn outcome(id: &ObjectIdentity, action: ApplyAction, generation: i64) -> ChildOutcome {
    ChildOutcome {
        identity: id.clone(),
        action,
        generation,
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Whether an owned object has drifted from its desired form
fn needs_update(desired: &DesiredObject, observed: &StoredObject) -> Result<bool> {
    if observed.last_applied() != desired.last_applied() {
        return Ok(true);
    }
    let labels_present = desired
        .labels
        .iter()
        .all(|(k, v)| observed.labels.get(k) == Some(v));
    if !labels_present {
        return Ok(true);
    }
    Ok(!json_subset(&desired.body.to_json()?, &observed.body.to_json()?))
}

/// Whether every field set in `desired` has the same value in `observed`.
/// Fields only present in `observed` (server defaults) are ignored.
pub fn json_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(h) => json_subset(v, h),
            None => v.is_null(),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| json_subset(w, h))
        }
        (Value::Number(w), Value::Number(h)) => w == h || w.as_f64() == h.as_f64(),
        (Value::String(w), Value::String(h)) => w == h || same_quantity(w, h),
        (Value::Null, Value::Null) => true,
        (w, h) => w == h,
    }
}

/// Whether two strings are the same resource quantity in different forms.
/// The API server stores quantities canonicalized (`1000m` reads back as `1`).
fn same_quantity(want: &str, have: &str) -> bool {
    match (parse_quantity(want), parse_quantity(have)) {
        (Some(w), Some(h)) => (w - h).abs() <= f64::EPSILON * w.abs().max(h.abs()).max(1.0) * 4.0,
        _ => false,
    }
}

/// Parse a quantity such as `250m`, `1.5Gi` or `1e3` into its value
fn parse_quantity(s: &str) -> Option<f64> {
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if !number.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    let scale = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..].parse().ok()?;
            10f64.powi(power)
        }
        _ => return None,
    };
    Some(value * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ObjectBody, ProvisionerKind, StorageClassBody};
    use crate::store::MemoryObjectStore;
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use serde_json::json;

    fn parent() -> ParentKey {
        ParentKey::new(ProvisionerKind::EfsProvisioner, "storage", "efs")
    }

    fn deployment(replicas: i32) -> DesiredObject {
        let id = ObjectIdentity::new(ObjectKind::Deployment, "storage", "efs-efs-provisioner");
        let body = ObjectBody::Deployment(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        });
        DesiredObject::owned(&parent(), id, body).unwrap()
    }

    fn storage_class(name: &str) -> DesiredObject {
        let id = ObjectIdentity::cluster_scoped(ObjectKind::StorageClass, name);
        let body = ObjectBody::StorageClass(StorageClassBody {
            provisioner: "openshift.io/aws-efs".into(),
            ..Default::default()
        });
        DesiredObject::owned(&parent(), id, body).unwrap()
    }

    fn engine(store: &Arc<MemoryObjectStore>) -> DiffApplyEngine {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        };
        DiffApplyEngine::new(store.clone(), GenerationLedger::in_memory(), policy)
    }

    #[tokio::test]
    async fn test_create_then_unchanged() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        let desired = vec![deployment(1), storage_class("efs")];

        let first = engine.reconcile(&parent(), &desired, &[]).await.unwrap();
        assert_eq!(first.writes(), 2);
        assert_eq!(first.records.len(), 2);

        let writes_before = store.write_count();
        let second = engine.reconcile(&parent(), &desired, &[]).await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(store.write_count(), writes_before);
        assert!(second
            .outcomes
            .iter()
            .all(|o| o.action == ApplyAction::Unchanged));
    }

    #[tokio::test]
    async fn test_update_records_new_generation() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        engine.reconcile(&parent(), &[deployment(1)], &[]).await.unwrap();

        let report = engine.reconcile(&parent(), &[deployment(2)], &[]).await.unwrap();
        let id = deployment(2).identity;
        assert_eq!(report.action(&id), Some(ApplyAction::Updated));
        let record = engine.ledger().get(&id).unwrap();
        assert_eq!(record.applied_generation, 2);
        assert_eq!(record.observed_generation, 2);
    }

    #[tokio::test]
    async fn test_gated_update_stays_unobserved() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        let id = deployment(1).identity;
        engine.reconcile(&parent(), &[deployment(1)], &[id.clone()]).await.unwrap();
        assert_eq!(engine.ledger().observed(&id), Some(1));

        engine.reconcile(&parent(), &[deployment(3)], &[id.clone()]).await.unwrap();
        assert_eq!(engine.ledger().observed(&id), Some(1));
        assert!(engine.ledger().get(&id).unwrap().is_settling());
    }

    #[tokio::test]
    async fn test_unowned_storage_class_is_adopted_untouched() {
        let store = MemoryObjectStore::new();
        let existing = store.insert_unmanaged(
            ObjectIdentity::cluster_scoped(ObjectKind::StorageClass, "efs"),
            ObjectBody::StorageClass(StorageClassBody {
                provisioner: "example.com/other".into(),
                ..Default::default()
            }),
        );
        let engine = engine(&store);

        let report = engine
            .reconcile(&parent(), &[storage_class("efs")], &[])
            .await
            .unwrap();
        assert_eq!(report.action(&existing.identity), Some(ApplyAction::Adopted));
        assert_eq!(report.adoption_conflicts, vec![existing.identity.clone()]);
        assert_eq!(store.object(&existing.identity), Some(existing.clone()));
        assert_eq!(store.write_count(), 0);
        assert!(engine.ledger().get(&existing.identity).is_none());
    }

    #[tokio::test]
    async fn test_stale_children_are_deleted_then_forgotten() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        let desired = vec![deployment(1), storage_class("efs")];
        engine.reconcile(&parent(), &desired, &[]).await.unwrap();

        let report = engine.reconcile(&parent(), &desired[..1], &[]).await.unwrap();
        let sc = storage_class("efs").identity;
        assert_eq!(report.action(&sc), Some(ApplyAction::Deleted));
        assert!(store.object(&sc).is_none());
        assert!(engine.ledger().get(&sc).is_none());

        let report = engine.delete_children(&parent()).await.unwrap();
        assert_eq!(report.writes(), 1);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        engine.reconcile(&parent(), &[deployment(1)], &[]).await.unwrap();

        store.fail_next_updates_with_conflict(2);
        let report = engine.reconcile(&parent(), &[deployment(2)], &[]).await.unwrap();
        assert_eq!(report.writes(), 1);
    }

    #[tokio::test]
    async fn test_outage_exhausts_retry_budget() {
        let store = MemoryObjectStore::new();
        let engine = engine(&store);
        store.fail_next_calls(10);

        let err = engine
            .reconcile(&parent(), &[deployment(1)], &[])
            .await
            .unwrap_err();
        assert_matches!(err, Error::RetriesExhausted { attempts: 3, .. });
    }

    #[test]
    fn test_json_subset_ignores_server_defaults() {
        let desired = json!({"replicas": 1, "template": {"spec": {"containers": [{"name": "a"}]}}});
        let observed = json!({
            "replicas": 1,
            "revisionHistoryLimit": 10,
            "template": {"spec": {"containers": [{"name": "a", "imagePullPolicy": "Always"}]}}
        });
        assert!(json_subset(&desired, &observed));

        let drifted = json!({"replicas": 2, "template": {"spec": {"containers": [{"name": "a"}]}}});
        assert!(!json_subset(&desired, &drifted));

        let extra_container = json!({
            "replicas": 1,
            "template": {"spec": {"containers": [{"name": "a"}, {"name": "b"}]}}
        });
        assert!(!json_subset(&desired, &extra_container));
    }

    #[test]
    fn test_json_subset_accepts_canonical_quantities() {
        let desired = json!({"resources": {
            "limits": {"cpu": "1000m", "memory": "1Gi"},
            "requests": {"cpu": "0.5", "memory": "128Mi", "storage": "1e3"}
        }});
        let canonical = json!({"resources": {
            "limits": {"cpu": "1", "memory": "1Gi"},
            "requests": {"cpu": "500m", "memory": "134217728", "storage": "1k"}
        }});
        assert!(json_subset(&desired, &canonical));

        let changed = json!({"resources": {
            "limits": {"cpu": "2", "memory": "1Gi"},
            "requests": {"cpu": "500m", "memory": "128Mi", "storage": "1k"}
        }});
        assert!(!json_subset(&desired, &changed));

        // Only strings that both read as quantities are normalized
        assert!(!json_subset(&json!({"image": "driver:1"}), &json!({"image": "driver:1.0"})));
        assert!(!json_subset(&json!({"policy": "Always"}), &json!({"policy": "always"})));
        assert_eq!(parse_quantity("250m"), Some(0.25));
        assert_eq!(parse_quantity("2Ki"), Some(2048.0));
        assert_eq!(parse_quantity("v1"), None);
        assert_eq!(parse_quantity("1Xi"), None);
    }
}
