//! Single-workload provisioner CRDs
//!
//! EFS, Manila and CephFS provisioners, the snapshot controller and local
//! storage providers. Each is reconciled into one provisioner workload and,
//! where it names one, a StorageClass.

use super::common::{raw_object_schema, OperatorSpec, StorageStatus};
use k8s_openapi::api::core::v1::{NodeSelector, SecretReference};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// EFS Provisioner
// =============================================================================

/// EFSProvisioner runs a dynamic provisioner on top of an existing EFS.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "EFSProvisioner",
    root = "EfsProvisioner",
    plural = "efsprovisioners",
    status = "EfsProvisionerStatus",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    printcolumn = r#"{"name": "FSID", "type": "string", "jsonPath": ".spec.fsid"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct EfsProvisionerSpec {
    /// Image with the EFS provisioner, overrides the operator default.
    /// It should be empty in the usual case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_image: Option<String>,

    /// Name of the storage class to create. An existing class is not updated.
    pub storage_class_name: String,

    /// Location of AWS credentials, overrides the cluster credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub aws_secrets: Option<SecretReference>,

    /// ID of the EFS used as base of dynamically provisioned PVs
    pub fsid: String,

    /// Subdirectory of the EFS used as base of all PVs; root when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,

    /// Group that can write to the EFS, added as a supplemental group
    #[serde(default)]
    pub supplemental_group: i64,
}

pub type EfsProvisionerStatus = StorageStatus;

// =============================================================================
// Manila Provisioner
// =============================================================================

/// ManilaProvisioner runs the OpenStack Manila share provisioner.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "ManilaProvisioner",
    plural = "manilaprovisioners",
    status = "ManilaProvisionerStatus",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManilaProvisionerSpec {
    /// Image with the Manila provisioner, overrides the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_image: Option<String>,

    /// Name of the storage class to create. An existing class is not updated.
    pub storage_class_name: String,

    /// Location of OpenStack credentials
    #[schemars(schema_with = "raw_object_schema")]
    pub open_stack_secrets: SecretReference,
}

pub type ManilaProvisionerStatus = StorageStatus;

// =============================================================================
// CephFS Provisioner
// =============================================================================

/// CephFSProvisioner runs the CephFS dynamic provisioner.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "CephFSProvisioner",
    root = "CephFsProvisioner",
    plural = "cephfsprovisioners",
    status = "CephFsProvisionerStatus",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephFsProvisionerSpec {
    #[serde(flatten)]
    pub operator: OperatorSpec,

    /// Name of the storage class to create. An existing class is not updated.
    pub storage_class_name: String,

    /// CephFS admin credentials, a Secret with "username" and "password" keys
    #[serde(rename = "cephFSSecrets")]
    #[schemars(schema_with = "raw_object_schema")]
    pub ceph_fs_secrets: SecretReference,

    /// Name of the Ceph cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Ceph monitor addresses, with ports when necessary
    pub monitors: Vec<String>,

    /// Subdirectory of the Ceph volume used as base of all PVs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,

    /// Namespace for PV secrets; the PVC namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_secrets_namespace: Option<String>,

    /// Whether quota is enforced on created PVs
    #[serde(default)]
    pub enable_quota: bool,
}

pub type CephFsProvisionerStatus = StorageStatus;

// =============================================================================
// Snapshot Controller
// =============================================================================

/// SnapshotController runs the external snapshot controller and provisioner.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "SnapshotController",
    plural = "snapshotcontrollers",
    status = "SnapshotControllerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotControllerSpec {
    #[serde(flatten)]
    pub operator: OperatorSpec,

    /// User group allowed to create, restore and delete snapshots. Access
    /// rules for the group are left to the cluster administrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

pub type SnapshotControllerStatus = StorageStatus;

// =============================================================================
// Local Storage Provider
// =============================================================================

/// LocalStorageProvider defines local devices on a set of nodes grouped by a
/// node selector. Each provider runs its own local provisioner DaemonSet.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.openshift.io",
    version = "v1alpha1",
    kind = "LocalStorageProvider",
    plural = "localstorageproviders",
    status = "LocalProviderStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageProviderSpec {
    #[serde(flatten)]
    pub operator: OperatorSpec,

    /// Nodes whose local storage is managed; all nodes when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub node_selector: Option<NodeSelector>,

    /// Storage classes and their devices on the matched nodes
    pub storage_class_devices: Vec<StorageClassDevices>,
}

/// Devices that belong to one storage class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDevices {
    /// Storage class the listed devices belong to
    pub storage_class_name: String,

    /// Kernel device names without "/dev", e.g. "sda"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_names: Vec<String>,

    /// Names under /dev/disk/by-id without the prefix
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_stable_names: Vec<String>,
}

pub type LocalProviderStatus = StorageStatus;
