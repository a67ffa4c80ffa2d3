//! Status Aggregator
//!
//! Folds ledger records, the rollout snapshot and the outcome of a pass into
//! the status written on the parent. Pure: equal inputs give equal statuses,
//! which keeps repeated passes from writing.

use crate::controller::ledger::ChildResourceRecord;
use crate::controller::rollout::RolloutPlan;
use crate::crd::{ConditionStatus, StatusCondition, StorageStatus};
use chrono::{DateTime, Utc};

/// The spec could be turned into children
pub const CONDITION_SPEC_VALID: &str = "SpecValid";
/// A node rollout is halted on a failed node
pub const CONDITION_ROLLOUT_DEGRADED: &str = "RolloutDegraded";
/// The last pass ran out of retries
pub const CONDITION_RECONCILE_FAILED: &str = "ReconcileFailed";
/// A StorageClass (or other child) already existed and was left untouched
pub const CONDITION_STORAGE_CLASS_ADOPTED: &str = "StorageClassAdopted";

/// Desired state of one condition, without its transition time
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionInput {
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl ConditionInput {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Everything a status is computed from
#[derive(Debug, Clone)]
pub struct StatusInput<'a> {
    /// Generation of the parent spec this pass acted on
    pub generation: i64,
    pub previous: &'a StorageStatus,
    pub records: &'a [ChildResourceRecord],
    pub rollout: Option<&'a RolloutPlan>,
    pub conditions: Vec<ConditionInput>,
    pub now: DateTime<Utc>,
}

pub struct StatusAggregator;

impl StatusAggregator {
    pub fn compute(input: StatusInput<'_>) -> StorageStatus {
        let settled = Self::is_settled(&input);
        let observed_generation = if settled {
            input.previous.observed_generation.max(input.generation)
        } else {
            input.previous.observed_generation
        };

        let mut children_generations: Vec<_> =
            input.records.iter().map(ChildResourceRecord::to_history).collect();
        children_generations.sort();

        let conditions = input
            .conditions
            .into_iter()
            .map(|c| {
                let last_transition_time = input
                    .previous
                    .condition(&c.type_)
                    .filter(|prev| prev.status == c.status)
                    .map_or(input.now, |prev| prev.last_transition_time);
                StatusCondition {
                    type_: c.type_,
                    status: c.status,
                    reason: c.reason,
                    message: c.message,
                    last_transition_time,
                }
            })
            .collect();

        StorageStatus {
            observed_generation,
            children_generations,
            conditions,
            rollout: input.rollout.map(RolloutPlan::to_status),
        }
    }

    /// No pending record, every child accepted at its applied generation and
    /// no rollout left to run
    fn is_settled(input: &StatusInput<'_>) -> bool {
        let children_settled = input
            .records
            .iter()
            .all(|r| !r.is_pending() && r.observed_generation >= r.applied_generation);
        let rollout_settled = input.rollout.map_or(true, RolloutPlan::is_complete);
        children_settled && rollout_settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ObjectIdentity, ObjectKind, ParentKey, ProvisionerKind};
    use chrono::Duration;

    fn parent() -> ParentKey {
        ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "nfs")
    }

    fn record(kind: ObjectKind, name: &str, applied: i64, observed: i64) -> ChildResourceRecord {
        ChildResourceRecord {
            child: ObjectIdentity::new(kind, "storage", name),
            parent: parent(),
            applied_generation: applied,
            observed_generation: observed,
        }
    }

    fn input<'a>(
        generation: i64,
        previous: &'a StorageStatus,
        records: &'a [ChildResourceRecord],
    ) -> StatusInput<'a> {
        StatusInput {
            generation,
            previous,
            records,
            rollout: None,
            conditions: vec![],
            now: Utc::now(),
        }
    }

    #[test]
    fn test_observed_generation_waits_for_children() {
        let previous = StorageStatus {
            observed_generation: 3,
            ..Default::default()
        };
        let records = vec![
            record(ObjectKind::DaemonSet, "nfs-csi-node", 5, 4),
            record(ObjectKind::Deployment, "nfs-csi-controller", 2, 2),
        ];
        let status = StatusAggregator::compute(input(4, &previous, &records));
        assert_eq!(status.observed_generation, 3);

        let records = vec![
            record(ObjectKind::DaemonSet, "nfs-csi-node", 5, 5),
            record(ObjectKind::Deployment, "nfs-csi-controller", 2, 2),
        ];
        let status = StatusAggregator::compute(input(4, &previous, &records));
        assert_eq!(status.observed_generation, 4);
    }

    #[test]
    fn test_observed_generation_never_decreases() {
        let previous = StorageStatus {
            observed_generation: 7,
            ..Default::default()
        };
        let status = StatusAggregator::compute(input(5, &previous, &[]));
        assert_eq!(status.observed_generation, 7);

        let mut last = 0;
        let mut prev = StorageStatus::default();
        for (generation, settled) in [(1, true), (2, false), (3, true), (2, true), (4, false)] {
            let records = vec![record(
                ObjectKind::DaemonSet,
                "nfs-csi-node",
                generation,
                if settled { generation } else { generation - 1 },
            )];
            prev = StatusAggregator::compute(input(generation, &prev, &records));
            assert!(prev.observed_generation >= last);
            last = prev.observed_generation;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_pending_record_blocks_progress() {
        let previous = StorageStatus::default();
        let records = vec![record(ObjectKind::StorageClass, "gold", 0, 0)];
        let status = StatusAggregator::compute(input(1, &previous, &records));
        assert_eq!(status.observed_generation, 0);
    }

    #[test]
    fn test_children_sorted_by_identity() {
        let previous = StorageStatus::default();
        let records = vec![
            record(ObjectKind::StorageClass, "gold", 1, 1),
            record(ObjectKind::DaemonSet, "b", 1, 1),
            record(ObjectKind::DaemonSet, "a", 2, 2),
        ];
        let status = StatusAggregator::compute(input(1, &previous, &records));
        let names: Vec<_> = status
            .children_generations
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "gold"]);
        assert_eq!(status.children_generations[2].group, "storage.k8s.io");
        assert!(status.children_generations[2].namespace.is_empty());
    }

    #[test]
    fn test_condition_transition_time_is_stable() {
        let earlier = Utc::now() - Duration::minutes(10);
        let previous = StorageStatus {
            conditions: vec![StatusCondition {
                type_: CONDITION_SPEC_VALID.into(),
                status: ConditionStatus::True,
                reason: "Valid".into(),
                message: String::new(),
                last_transition_time: earlier,
            }],
            ..Default::default()
        };

        let mut same = input(1, &previous, &[]);
        same.conditions = vec![ConditionInput::new(
            CONDITION_SPEC_VALID,
            ConditionStatus::True,
            "Valid",
            "",
        )];
        let status = StatusAggregator::compute(same.clone());
        assert_eq!(status.conditions[0].last_transition_time, earlier);
        assert_eq!(StatusAggregator::compute(same), status);

        let mut flipped = input(1, &previous, &[]);
        flipped.conditions = vec![ConditionInput::new(
            CONDITION_SPEC_VALID,
            ConditionStatus::False,
            "InvalidSpec",
            "driverName is empty",
        )];
        let now = flipped.now;
        let status = StatusAggregator::compute(flipped);
        assert_eq!(status.conditions[0].last_transition_time, now);
    }
}
