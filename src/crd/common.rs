//! Shared CRD types
//!
//! The status shape every provisioner kind inlines, the generic operator
//! settings some kinds embed, and schema helpers for embedded core types.

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of every provisioner resource
pub const API_GROUP: &str = "storage.openshift.io";

/// API version of every provisioner resource
pub const API_VERSION: &str = "v1alpha1";

// =============================================================================
// Schema Helpers
// =============================================================================

/// Schema for embedded core objects (pod templates, selectors, secret refs).
///
/// The full upstream schema is large and versioned independently, so the CRD
/// only declares an object and lets the API server keep unknown fields.
pub fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}

// =============================================================================
// Operator Spec
// =============================================================================

/// Whether and how the operator manages a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ManagementState {
    /// Children are reconciled continuously
    #[default]
    Managed,
    /// The operator leaves everything as it is
    Unmanaged,
    /// Children are deleted and kept deleted
    Removed,
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Removed => write!(f, "Removed"),
        }
    }
}

/// Generic operator settings inlined into some provisioner specs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// Management state of the resource
    #[serde(default)]
    pub management_state: ManagementState,

    /// Image override for the managed workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_spec: Option<String>,

    /// Desired version, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Generation of one child object the operator created or updated
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerationHistory {
    /// API group of the child ("" for core, "apps", "storage.k8s.io")
    #[serde(default)]
    pub group: String,
    /// Resource kind of the child
    pub resource: String,
    /// Namespace of the child ("" when cluster scoped)
    #[serde(default)]
    pub namespace: String,
    /// Name of the child
    pub name: String,
    /// Generation the store reported after the last apply
    pub last_generation: i64,
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single observation about the resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Condition type (SpecValid, RolloutDegraded, ReconcileFailed, StorageClassAdopted)
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Per-node progress of a node plugin rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRolloutStatus {
    pub node_name: String,
    pub phase: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Rollout progress of the node DaemonSet, present while a rollout is active or halted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    /// DaemonSet generation being rolled out
    pub target_generation: i64,
    /// Effective node update strategy
    pub strategy: String,
    /// Whether the rollout stopped on a failed node
    #[serde(default)]
    pub halted: bool,
    #[serde(default)]
    pub nodes: Vec<NodeRolloutStatus>,
}

/// Common storage operator status inlined in every provisioner status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    /// Last generation of this object that the operator has acted on
    #[serde(default)]
    pub observed_generation: i64,

    /// Generations of API objects that the operator has created or updated.
    /// Persisted here so that generations survive operator restarts.
    #[serde(default)]
    pub children_generations: Vec<GenerationHistory>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutStatus>,
}

impl StorageStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&StatusCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
