//! Test fixtures shared by the controller tests

use crate::controller::synthesizer::DesiredStateSynthesizer;
use crate::crd::{CsiDriverDeployment, CsiDriverDeploymentSpec};
use crate::domain::ports::{
    DesiredObject, ObjectBody, ObjectIdentity, ObjectStore, ParentKey, ProvisionerKind,
    StoredObject,
};
use crate::store::MemoryObjectStore;
use k8s_openapi::api::apps::v1::DaemonSetSpec;

pub fn csi_driver(namespace: &str, name: &str, driver: &str) -> CsiDriverDeployment {
    let spec: CsiDriverDeploymentSpec = serde_json::from_value(serde_json::json!({
        "driverName": driver,
        "driverSocket": "/csi/csi.sock",
        "nodeTemplate": {
            "spec": {"containers": [{"name": "driver", "image": "example.com/driver:v1"}]}
        }
    }))
    .unwrap();
    let mut resource = CsiDriverDeployment::new(name, spec);
    resource.metadata.namespace = Some(namespace.to_string());
    resource
}

/// Create an owned, empty node DaemonSet at generation 1
pub async fn create_node_daemon_set(
    store: &MemoryObjectStore,
    namespace: &str,
    name: &str,
) -> StoredObject {
    let parent = ParentKey::new(ProvisionerKind::CsiDriverDeployment, namespace, name);
    let desired = DesiredObject::owned(
        &parent,
        DesiredStateSynthesizer::node_identity(&parent),
        ObjectBody::DaemonSet(DaemonSetSpec::default()),
    )
    .unwrap();
    store.create(&desired).await.unwrap()
}

/// Change a stored DaemonSet so its generation advances
pub async fn bump_daemon_set(store: &MemoryObjectStore, id: &ObjectIdentity) -> StoredObject {
    let current = store.object(id).unwrap();
    let ObjectBody::DaemonSet(mut spec) = current.body.clone() else {
        panic!("{} is not a DaemonSet", id);
    };
    spec.min_ready_seconds = Some(spec.min_ready_seconds.unwrap_or(0) + 1);
    let parent = current.owner().unwrap();
    let desired = DesiredObject::owned(&parent, id.clone(), ObjectBody::DaemonSet(spec)).unwrap();
    store.update(&desired, &current.resource_version).await.unwrap()
}
