//! Custom Resource Definitions for the storage provisioner operator
//!
//! This module contains all CRD types:
//! - CSIDriverDeployment: CSI driver node DaemonSet and controller Deployment
//! - EFSProvisioner, ManilaProvisioner, CephFSProvisioner: file provisioners
//! - SnapshotController: external snapshot controller
//! - LocalStorageProvider: local device provisioner per node group

pub mod common;
pub mod csi_driver;
pub mod provisioners;

pub use common::*;
pub use csi_driver::*;
pub use provisioners::*;

use kube::CustomResourceExt;

/// Every CRD served by the operator, in a stable order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        CsiDriverDeployment::crd(),
        EfsProvisioner::crd(),
        ManilaProvisioner::crd(),
        CephFsProvisioner::crd(),
        SnapshotController::crd(),
        LocalStorageProvider::crd(),
    ]
}
