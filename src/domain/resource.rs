//! Provisioner resources as one reconcilable type

use crate::crd::{
    CephFsProvisioner, CsiDriverDeployment, EfsProvisioner, LocalStorageProvider,
    ManagementState, ManilaProvisioner, SnapshotController, StorageStatus,
};
use crate::domain::ports::{ParentKey, ProvisionerKind};
use crate::error::Result;
use kube::api::ObjectMeta;
use kube::ResourceExt;

/// One of the six provisioner custom resources
#[derive(Debug, Clone)]
pub enum ProvisionerResource {
    Efs(EfsProvisioner),
    Manila(ManilaProvisioner),
    CephFs(CephFsProvisioner),
    Snapshot(SnapshotController),
    LocalStorage(LocalStorageProvider),
    CsiDriver(CsiDriverDeployment),
}

macro_rules! each_resource {
    ($value:expr, $r:ident => $body:expr) => {
        match $value {
            ProvisionerResource::Efs($r) => $body,
            ProvisionerResource::Manila($r) => $body,
            ProvisionerResource::CephFs($r) => $body,
            ProvisionerResource::Snapshot($r) => $body,
            ProvisionerResource::LocalStorage($r) => $body,
            ProvisionerResource::CsiDriver($r) => $body,
        }
    };
}

impl ProvisionerResource {
    pub fn kind(&self) -> ProvisionerKind {
        match self {
            ProvisionerResource::Efs(_) => ProvisionerKind::EfsProvisioner,
            ProvisionerResource::Manila(_) => ProvisionerKind::ManilaProvisioner,
            ProvisionerResource::CephFs(_) => ProvisionerKind::CephFsProvisioner,
            ProvisionerResource::Snapshot(_) => ProvisionerKind::SnapshotController,
            ProvisionerResource::LocalStorage(_) => ProvisionerKind::LocalStorageProvider,
            ProvisionerResource::CsiDriver(_) => ProvisionerKind::CsiDriverDeployment,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        each_resource!(self, r => &r.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        each_resource!(self, r => &mut r.metadata)
    }

    /// Reconciliation key of this resource
    pub fn key(&self) -> ParentKey {
        let (namespace, name) =
            each_resource!(self, r => (r.namespace().unwrap_or_default(), r.name_any()));
        ParentKey::new(self.kind(), namespace, name)
    }

    /// Spec generation assigned by the store
    pub fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    /// Current status, empty when never written
    pub fn status(&self) -> StorageStatus {
        each_resource!(self, r => r.status.clone().unwrap_or_default())
    }

    pub fn set_status(&mut self, status: StorageStatus) {
        each_resource!(self, r => r.status = Some(status))
    }

    /// Management state; kinds without an operator spec are always managed
    pub fn management_state(&self) -> ManagementState {
        match self {
            ProvisionerResource::CephFs(r) => r.spec.operator.management_state,
            ProvisionerResource::Snapshot(r) => r.spec.operator.management_state,
            ProvisionerResource::LocalStorage(r) => r.spec.operator.management_state,
            _ => ManagementState::Managed,
        }
    }

    /// Serialized spec, used to detect spec changes
    pub fn spec_json(&self) -> Result<serde_json::Value> {
        Ok(each_resource!(self, r => serde_json::to_value(&r.spec)?))
    }

    /// Whether the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

impl From<CsiDriverDeployment> for ProvisionerResource {
    fn from(r: CsiDriverDeployment) -> Self {
        ProvisionerResource::CsiDriver(r)
    }
}

impl From<EfsProvisioner> for ProvisionerResource {
    fn from(r: EfsProvisioner) -> Self {
        ProvisionerResource::Efs(r)
    }
}

impl From<ManilaProvisioner> for ProvisionerResource {
    fn from(r: ManilaProvisioner) -> Self {
        ProvisionerResource::Manila(r)
    }
}

impl From<CephFsProvisioner> for ProvisionerResource {
    fn from(r: CephFsProvisioner) -> Self {
        ProvisionerResource::CephFs(r)
    }
}

impl From<SnapshotController> for ProvisionerResource {
    fn from(r: SnapshotController) -> Self {
        ProvisionerResource::Snapshot(r)
    }
}

impl From<LocalStorageProvider> for ProvisionerResource {
    fn from(r: LocalStorageProvider) -> Self {
        ProvisionerResource::LocalStorage(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CsiDriverDeploymentSpec, SnapshotControllerSpec};

    #[test]
    fn test_key_and_generation() {
        let mut driver = CsiDriverDeployment::new(
            "nfs",
            CsiDriverDeploymentSpec {
                driver_name: "nfs.csi.k8s.io".into(),
                node_template: Default::default(),
                node_selector: None,
                controller_template: None,
                driver_socket: "/csi/csi.sock".into(),
                node_update_strategy: None,
                tolerate_socket_loss: false,
            },
        );
        driver.metadata.namespace = Some("storage".into());
        driver.metadata.generation = Some(3);

        let resource = ProvisionerResource::from(driver);
        assert_eq!(
            resource.key(),
            ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "nfs")
        );
        assert_eq!(resource.generation(), 3);
        assert_eq!(resource.status(), StorageStatus::default());
    }

    #[test]
    fn test_management_state() {
        let mut spec = SnapshotControllerSpec {
            operator: Default::default(),
            group: None,
        };
        spec.operator.management_state = ManagementState::Removed;
        let resource = ProvisionerResource::from(SnapshotController::new("snap", spec));
        assert_eq!(resource.management_state(), ManagementState::Removed);
    }
}
