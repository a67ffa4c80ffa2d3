//! CSIDriverDeployment CRD
//!
//! Describes a CSI driver the operator runs as a node DaemonSet plus an
//! optional controller Deployment. Sidecars (driver registrar, liveness probe,
//! provisioner, attacher) are added by the operator.

use super::common::{raw_object_schema, StorageStatus};
use k8s_openapi::api::core::v1::{NodeSelector, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// CSIDriverDeployment CRD
// =============================================================================

/// CSIDriverDeployment runs a CSI driver on a set of nodes.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "CSIDriverDeployment",
    root = "CsiDriverDeployment",
    plural = "csidriverdeployments",
    shortname = "csidd",
    status = "CsiDriverDeploymentStatus",
    printcolumn = r#"{"name": "Driver", "type": "string", "jsonPath": ".spec.driverName"}"#,
    printcolumn = r#"{"name": "Observed", "type": "integer", "jsonPath": ".status.observedGeneration"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CsiDriverDeploymentSpec {
    /// Name of the CSI driver
    pub driver_name: String,

    /// Template of pods that run on every node. It must contain a container
    /// with the driver and all volumes it needs (Secrets, ConfigMaps).
    #[schemars(schema_with = "raw_object_schema")]
    pub node_template: PodTemplateSpec,

    /// Nodes that run the node driver. All nodes are used when absent or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub node_selector: Option<NodeSelector>,

    /// Template of pods that run the controller parts. Absent when the driver
    /// needs neither attacher nor provisioner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub controller_template: Option<PodTemplateSpec>,

    /// Path to the CSI socket in the *first* container of each template
    pub driver_socket: String,

    /// How node pods are replaced when the node template changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_update_strategy: Option<NodeUpdateStrategy>,

    /// The driver survives a momentary loss of its socket, so node pods may be
    /// replaced without draining when no strategy is given
    #[serde(default)]
    pub tolerate_socket_loss: bool,
}

/// Node plugin replacement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum NodeUpdateStrategy {
    /// Delete and replace the node pod without draining
    Rolling,
    /// Cordon and drain pods using the driver before replacing the node pod
    Drain,
}

impl std::fmt::Display for NodeUpdateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeUpdateStrategy::Rolling => write!(f, "Rolling"),
            NodeUpdateStrategy::Drain => write!(f, "Drain"),
        }
    }
}

impl CsiDriverDeploymentSpec {
    /// Strategy actually used for node rollouts.
    ///
    /// Rolling is only chosen implicitly when the driver declares that it
    /// tolerates socket loss.
    pub fn effective_update_strategy(&self) -> NodeUpdateStrategy {
        match self.node_update_strategy {
            Some(strategy) => strategy,
            None if self.tolerate_socket_loss => NodeUpdateStrategy::Rolling,
            None => NodeUpdateStrategy::Drain,
        }
    }
}

/// Status of the CSIDriverDeployment
pub type CsiDriverDeploymentStatus = StorageStatus;
