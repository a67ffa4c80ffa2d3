//! Domain Ports - Core trait definitions for the storage operator
//!
//! These traits define the boundaries between the reconciliation engine and
//! the cluster. Adapters implement them against Kubernetes or in memory.

use crate::crd::StorageStatus;
use crate::domain::resource::ProvisionerResource;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec};
use k8s_openapi::api::core::v1::NodeSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// =============================================================================
// Ownership Markers
// =============================================================================

/// Label marking every object this operator manages
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGER_NAME: &str = "storage-provisioner-operator";

/// Kind of the owning provisioner resource
pub const LABEL_OWNER_KIND: &str = "storage.openshift.io/owner-kind";

/// Namespace of the owning provisioner resource
pub const LABEL_OWNER_NAMESPACE: &str = "storage.openshift.io/owner-namespace";

/// Name of the owning provisioner resource
pub const LABEL_OWNER_NAME: &str = "storage.openshift.io/owner-name";

/// Serialized body of the last spec the operator applied
pub const ANNOTATION_LAST_APPLIED: &str = "storage.openshift.io/last-applied-spec";

// =============================================================================
// Kinds
// =============================================================================

/// Kinds of provisioner resources the operator reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProvisionerKind {
    EfsProvisioner,
    ManilaProvisioner,
    CephFsProvisioner,
    SnapshotController,
    LocalStorageProvider,
    CsiDriverDeployment,
}

impl ProvisionerKind {
    /// All kinds, in the order they are listed during resync
    pub const ALL: [ProvisionerKind; 6] = [
        ProvisionerKind::CsiDriverDeployment,
        ProvisionerKind::EfsProvisioner,
        ProvisionerKind::ManilaProvisioner,
        ProvisionerKind::CephFsProvisioner,
        ProvisionerKind::SnapshotController,
        ProvisionerKind::LocalStorageProvider,
    ];

    /// API kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerKind::EfsProvisioner => "EFSProvisioner",
            ProvisionerKind::ManilaProvisioner => "ManilaProvisioner",
            ProvisionerKind::CephFsProvisioner => "CephFSProvisioner",
            ProvisionerKind::SnapshotController => "SnapshotController",
            ProvisionerKind::LocalStorageProvider => "LocalStorageProvider",
            ProvisionerKind::CsiDriverDeployment => "CSIDriverDeployment",
        }
    }

    /// Short name used in child object names
    pub fn short_name(&self) -> &'static str {
        match self {
            ProvisionerKind::EfsProvisioner => "efs",
            ProvisionerKind::ManilaProvisioner => "manila",
            ProvisionerKind::CephFsProvisioner => "cephfs",
            ProvisionerKind::SnapshotController => "snapshot",
            ProvisionerKind::LocalStorageProvider => "local",
            ProvisionerKind::CsiDriverDeployment => "csi",
        }
    }

    /// Parse an API kind name
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kinds of child objects the operator synthesizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    DaemonSet,
    Deployment,
    StorageClass,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StorageClass => "StorageClass",
        }
    }

    /// API group of the kind
    pub fn group(&self) -> &'static str {
        match self {
            ObjectKind::DaemonSet | ObjectKind::Deployment => "apps",
            ObjectKind::StorageClass => "storage.k8s.io",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::StorageClass)
    }

    /// Parse a kind name as recorded in status
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "DaemonSet" => Some(ObjectKind::DaemonSet),
            "Deployment" => Some(ObjectKind::Deployment),
            "StorageClass" => Some(ObjectKind::StorageClass),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Identities
// =============================================================================

/// Identity of a provisioner resource, the unit of reconciliation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentKey {
    pub kind: ProvisionerKind,
    pub namespace: String,
    pub name: String,
}

impl ParentKey {
    pub fn new(kind: ProvisionerKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of a child object derived from this parent
    pub fn child_name(&self, suffix: &str) -> String {
        format!("{}-{}-{}", self.name, self.kind.short_name(), suffix)
    }

    /// Labels that mark an object as owned by this parent
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
            (LABEL_OWNER_KIND.to_string(), self.kind.as_str().to_string()),
            (LABEL_OWNER_NAMESPACE.to_string(), self.namespace.clone()),
            (LABEL_OWNER_NAME.to_string(), self.name.clone()),
        ])
    }

    /// Recover the owning parent from ownership labels
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGER_NAME) {
            return None;
        }
        Some(Self {
            kind: ProvisionerKind::from_kind(labels.get(LABEL_OWNER_KIND)?)?,
            namespace: labels.get(LABEL_OWNER_NAMESPACE)?.clone(),
            name: labels.get(LABEL_OWNER_NAME)?.clone(),
        })
    }
}

impl std::fmt::Display for ParentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity of a child object in the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub kind: ObjectKind,
    /// Empty for cluster-scoped kinds
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.is_namespaced() {
            namespace.into()
        } else {
            String::new()
        };
        Self {
            kind,
            namespace,
            name: name.into(),
        }
    }

    pub fn cluster_scoped(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::new(kind, "", name)
    }
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

// =============================================================================
// Object Bodies
// =============================================================================

/// StorageClass fields the operator sets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassBody {
    pub provisioner: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_binding_mode: Option<String>,
}

/// Desired or observed body of a child object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    DaemonSet(DaemonSetSpec),
    Deployment(DeploymentSpec),
    StorageClass(StorageClassBody),
}

impl ObjectBody {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectBody::DaemonSet(_) => ObjectKind::DaemonSet,
            ObjectBody::Deployment(_) => ObjectKind::Deployment,
            ObjectBody::StorageClass(_) => ObjectKind::StorageClass,
        }
    }

    /// JSON form used for comparison and the last-applied annotation
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            ObjectBody::DaemonSet(spec) => serde_json::to_value(spec)?,
            ObjectBody::Deployment(spec) => serde_json::to_value(spec)?,
            ObjectBody::StorageClass(body) => serde_json::to_value(body)?,
        };
        Ok(value)
    }
}

/// A child object as the operator wants it to exist
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObject {
    pub identity: ObjectIdentity,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub body: ObjectBody,
}

impl DesiredObject {
    /// Build a desired object carrying the parent's ownership markers
    pub fn owned(parent: &ParentKey, identity: ObjectIdentity, body: ObjectBody) -> Result<Self> {
        let last_applied = serde_json::to_string(&body.to_json()?)?;
        Ok(Self {
            identity,
            labels: parent.owner_labels(),
            annotations: BTreeMap::from([(ANNOTATION_LAST_APPLIED.to_string(), last_applied)]),
            body,
        })
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_LAST_APPLIED).map(String::as_str)
    }
}

/// A child object as the store holds it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub identity: ObjectIdentity,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Optimistic concurrency token
    pub resource_version: String,
    pub generation: i64,
    pub body: ObjectBody,
}

impl StoredObject {
    /// Whether the object carries this parent's ownership markers
    pub fn is_owned_by(&self, parent: &ParentKey) -> bool {
        ParentKey::from_labels(&self.labels).as_ref() == Some(parent)
    }

    /// The parent recorded in the ownership markers, if any
    pub fn owner(&self) -> Option<ParentKey> {
        ParentKey::from_labels(&self.labels)
    }

    pub fn last_applied(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_LAST_APPLIED).map(String::as_str)
    }
}

// =============================================================================
// Store Events
// =============================================================================

/// Change notifications published by an object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A provisioner resource was created or updated
    ParentChanged(ParentKey),
    /// A provisioner resource was deleted
    ParentDeleted(ParentKey),
    /// A child object changed; `owner` is read from its ownership labels
    ChildChanged {
        child: ObjectIdentity,
        owner: Option<ParentKey>,
    },
}

impl StoreEvent {
    /// Parent key to reconcile in response to this event
    pub fn parent_key(&self) -> Option<&ParentKey> {
        match self {
            StoreEvent::ParentChanged(key) | StoreEvent::ParentDeleted(key) => Some(key),
            StoreEvent::ChildChanged { owner, .. } => owner.as_ref(),
        }
    }
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Typed CRUD + watch over provisioner resources and their children
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a provisioner resource
    async fn get_parent(&self, key: &ParentKey) -> Result<Option<ProvisionerResource>>;

    /// List every provisioner resource, used for periodic resync
    async fn list_parents(&self) -> Result<Vec<ParentKey>>;

    /// Write the status subresource of a provisioner resource
    async fn update_parent_status(&self, key: &ParentKey, status: &StorageStatus) -> Result<()>;

    /// Fetch a child object
    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredObject>>;

    /// Create a child object; fails with `ResourceExists` when present
    async fn create(&self, object: &DesiredObject) -> Result<StoredObject>;

    /// Replace a child object; fails with `Conflict` when `resource_version`
    /// no longer matches
    async fn update(&self, object: &DesiredObject, resource_version: &str) -> Result<StoredObject>;

    /// Delete a child object; deleting a missing object succeeds
    async fn delete(&self, id: &ObjectIdentity) -> Result<()>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

// =============================================================================
// Node Ports
// =============================================================================

/// Reference to a pod
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of evicting a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The pod is gone and its volumes are released
    Acknowledged,
    /// The pod was still present when the timeout expired
    TimedOut,
}

/// Node drain operations, used only by the Drain strategy
#[async_trait]
pub trait NodeDrainer: Send + Sync {
    /// Mark a node unschedulable
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Mark a node schedulable again
    async fn uncordon(&self, node: &str) -> Result<()>;

    /// Non-daemon pods on the node holding a volume served by `driver`
    async fn pods_using_driver(&self, node: &str, driver: &str) -> Result<Vec<PodRef>>;

    /// Evict a pod and wait for it to release its volumes
    async fn evict(&self, pod: &PodRef, timeout: Duration) -> Result<EvictionOutcome>;
}

/// Node plugin pod operations
#[async_trait]
pub trait NodePlugins: Send + Sync {
    /// Nodes matched by a selector; all nodes when the selector is absent
    async fn list_nodes(&self, selector: Option<&NodeSelector>) -> Result<Vec<String>>;

    /// Delete the DaemonSet's pod on the node so it is recreated from the
    /// current template
    async fn replace_plugin_pod(&self, node: &str, daemon_set: &ObjectIdentity) -> Result<()>;

    /// Whether the DaemonSet's pod on the node runs `generation` and its
    /// driver socket accepts connections
    async fn plugin_socket_ready(
        &self,
        node: &str,
        daemon_set: &ObjectIdentity,
        generation: i64,
    ) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type NodeDrainerRef = Arc<dyn NodeDrainer>;
pub type NodePluginsRef = Arc<dyn NodePlugins>;
