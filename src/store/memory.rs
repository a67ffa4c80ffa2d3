//! In-memory object store
//!
//! Backs standalone mode and the tests. Tracks every write so idempotence can
//! be asserted, and can inject write conflicts and outages.

use crate::crd::{
    CephFsProvisioner, CsiDriverDeployment, EfsProvisioner, LocalStorageProvider,
    ManilaProvisioner, SnapshotController, StorageStatus,
};
use crate::domain::ports::{
    DesiredObject, ObjectBody, ObjectIdentity, ObjectStore, ParentKey, ProvisionerKind,
    StoreEvent, StoredObject,
};
use crate::domain::resource::ProvisionerResource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 1024;

/// Writes performed against the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub status_updates: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.deletes + self.status_updates
    }
}

pub struct MemoryObjectStore {
    parents: RwLock<BTreeMap<ParentKey, ProvisionerResource>>,
    objects: RwLock<BTreeMap<ObjectIdentity, StoredObject>>,
    events: broadcast::Sender<StoreEvent>,
    resource_version: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    status_updates: AtomicU64,
    conflicts_to_inject: AtomicU32,
    failures_to_inject: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            parents: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(BTreeMap::new()),
            events,
            resource_version: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            status_updates: AtomicU64::new(0),
            conflicts_to_inject: AtomicU32::new(0),
            failures_to_inject: AtomicU32::new(0),
        })
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Fail if an outage is being injected
    fn check_available(&self) -> Result<()> {
        if take_one(&self.failures_to_inject) {
            return Err(Error::TransientStore("injected outage".to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Parents
    // =========================================================================

    /// Create or replace a provisioner resource. The generation advances when
    /// the spec changes; status is kept.
    pub fn put_parent(&self, resource: impl Into<ProvisionerResource>) -> ProvisionerResource {
        let mut resource = resource.into();
        let key = resource.key();
        let mut parents = self.parents.write();

        let generation = match parents.get(&key) {
            Some(existing) => {
                resource.set_status(existing.status());
                let unchanged = matches!(
                    (existing.spec_json(), resource.spec_json()),
                    (Ok(a), Ok(b)) if a == b
                );
                if unchanged {
                    existing.generation()
                } else {
                    existing.generation() + 1
                }
            }
            None => 1,
        };
        let meta = resource.meta_mut();
        meta.generation = Some(generation);
        meta.resource_version = Some(self.next_version());

        parents.insert(key.clone(), resource.clone());
        drop(parents);
        debug!(parent = %key, generation, "Stored parent");
        self.publish(StoreEvent::ParentChanged(key));
        resource
    }

    pub fn delete_parent(&self, key: &ParentKey) -> Option<ProvisionerResource> {
        let removed = self.parents.write().remove(key);
        if removed.is_some() {
            self.publish(StoreEvent::ParentDeleted(key.clone()));
        }
        removed
    }

    pub fn parent(&self, key: &ParentKey) -> Option<ProvisionerResource> {
        self.parents.read().get(key).cloned()
    }

    /// Load provisioner resources from a multi-document YAML manifest
    pub fn load_manifests(&self, yaml: &str) -> Result<usize> {
        let mut loaded = 0;
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_json::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .and_then(ProvisionerKind::from_kind)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "unsupported manifest kind: {}",
                        value.get("kind").unwrap_or(&serde_json::Value::Null)
                    ))
                })?;
            let resource: ProvisionerResource = match kind {
                ProvisionerKind::CsiDriverDeployment => {
                    serde_json::from_value::<CsiDriverDeployment>(value)?.into()
                }
                ProvisionerKind::EfsProvisioner => {
                    serde_json::from_value::<EfsProvisioner>(value)?.into()
                }
                ProvisionerKind::ManilaProvisioner => {
                    serde_json::from_value::<ManilaProvisioner>(value)?.into()
                }
                ProvisionerKind::CephFsProvisioner => {
                    serde_json::from_value::<CephFsProvisioner>(value)?.into()
                }
                ProvisionerKind::SnapshotController => {
                    serde_json::from_value::<SnapshotController>(value)?.into()
                }
                ProvisionerKind::LocalStorageProvider => {
                    serde_json::from_value::<LocalStorageProvider>(value)?.into()
                }
            };
            let stored = self.put_parent(resource);
            info!(parent = %stored.key(), "Loaded manifest");
            loaded += 1;
        }
        Ok(loaded)
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Insert an object not created by the operator, without counting a write
    pub fn insert_unmanaged(&self, identity: ObjectIdentity, body: ObjectBody) -> StoredObject {
        let object = StoredObject {
            identity: identity.clone(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            resource_version: self.next_version(),
            generation: 1,
            body,
        };
        self.objects.write().insert(identity, object.clone());
        object
    }

    pub fn object(&self, id: &ObjectIdentity) -> Option<StoredObject> {
        self.objects.read().get(id).cloned()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.read().values().cloned().collect()
    }

    // =========================================================================
    // Write Accounting and Fault Injection
    // =========================================================================

    pub fn write_counts(&self) -> WriteCounts {
        WriteCounts {
            creates: self.creates.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            status_updates: self.status_updates.load(Ordering::SeqCst),
        }
    }

    /// Total writes of every kind
    pub fn write_count(&self) -> u64 {
        self.write_counts().total()
    }

    /// Make the next `n` child updates fail with a conflict
    pub fn fail_next_updates_with_conflict(&self, n: u32) {
        self.conflicts_to_inject.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` store calls fail as unavailable
    pub fn fail_next_calls(&self, n: u32) {
        self.failures_to_inject.store(n, Ordering::SeqCst);
    }
}

/// Decrement a counter if positive; true when it was
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_parent(&self, key: &ParentKey) -> Result<Option<ProvisionerResource>> {
        self.check_available()?;
        Ok(self.parent(key))
    }

    async fn list_parents(&self) -> Result<Vec<ParentKey>> {
        self.check_available()?;
        Ok(self.parents.read().keys().cloned().collect())
    }

    async fn update_parent_status(&self, key: &ParentKey, status: &StorageStatus) -> Result<()> {
        self.check_available()?;
        let mut parents = self.parents.write();
        let resource = parents.get_mut(key).ok_or_else(|| Error::ResourceNotFound {
            kind: key.kind.to_string(),
            name: format!("{}/{}", key.namespace, key.name),
        })?;
        resource.set_status(status.clone());
        resource.meta_mut().resource_version = Some(self.next_version());
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredObject>> {
        self.check_available()?;
        Ok(self.object(id))
    }

    async fn create(&self, object: &DesiredObject) -> Result<StoredObject> {
        self.check_available()?;
        let id = &object.identity;
        let mut objects = self.objects.write();
        if objects.contains_key(id) {
            return Err(Error::ResourceExists {
                kind: id.kind.to_string(),
                name: id.name.clone(),
            });
        }
        let stored = StoredObject {
            identity: id.clone(),
            labels: object.labels.clone(),
            annotations: object.annotations.clone(),
            resource_version: self.next_version(),
            generation: 1,
            body: object.body.clone(),
        };
        objects.insert(id.clone(), stored.clone());
        drop(objects);

        self.creates.fetch_add(1, Ordering::SeqCst);
        self.publish(StoreEvent::ChildChanged {
            child: id.clone(),
            owner: stored.owner(),
        });
        Ok(stored)
    }

    async fn update(&self, object: &DesiredObject, resource_version: &str) -> Result<StoredObject> {
        self.check_available()?;
        let id = &object.identity;
        let conflict = || Error::Conflict {
            kind: id.kind.to_string(),
            name: id.name.clone(),
        };
        if take_one(&self.conflicts_to_inject) {
            return Err(conflict());
        }

        let mut objects = self.objects.write();
        let existing = objects.get_mut(id).ok_or_else(|| Error::ResourceNotFound {
            kind: id.kind.to_string(),
            name: id.name.clone(),
        })?;
        if existing.resource_version != resource_version {
            return Err(conflict());
        }
        if existing.body != object.body {
            existing.generation += 1;
        }
        existing.labels = object.labels.clone();
        existing.annotations = object.annotations.clone();
        existing.body = object.body.clone();
        existing.resource_version = self.next_version();
        let stored = existing.clone();
        drop(objects);

        self.updates.fetch_add(1, Ordering::SeqCst);
        self.publish(StoreEvent::ChildChanged {
            child: id.clone(),
            owner: stored.owner(),
        });
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectIdentity) -> Result<()> {
        self.check_available()?;
        let removed = self.objects.write().remove(id);
        if let Some(removed) = removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.publish(StoreEvent::ChildChanged {
                child: id.clone(),
                owner: removed.owner(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fixtures;
    use crate::domain::ports::ObjectKind;
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::DeploymentSpec;

    fn deployment(replicas: i32) -> DesiredObject {
        let parent = ParentKey::new(ProvisionerKind::SnapshotController, "storage", "snap");
        DesiredObject::owned(
            &parent,
            ObjectIdentity::new(ObjectKind::Deployment, "storage", "snap-snapshot-controller"),
            ObjectBody::Deployment(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_generation_follows_spec_changes() {
        let store = MemoryObjectStore::new();
        let first = store.put_parent(fixtures::csi_driver("storage", "nfs", "csi.example.com"));
        assert_eq!(first.generation(), 1);

        let same = store.put_parent(fixtures::csi_driver("storage", "nfs", "csi.example.com"));
        assert_eq!(same.generation(), 1);

        let changed = store.put_parent(fixtures::csi_driver("storage", "nfs", "csi.other.com"));
        assert_eq!(changed.generation(), 2);
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = MemoryObjectStore::new();
        let created = store.create(&deployment(1)).await.unwrap();
        assert_eq!(created.generation, 1);

        let err = store.create(&deployment(1)).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });

        let updated = store
            .update(&deployment(2), &created.resource_version)
            .await
            .unwrap();
        assert_eq!(updated.generation, 2);

        let err = store
            .update(&deployment(3), &created.resource_version)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict { .. });

        // Metadata-only updates keep the generation
        let relabeled = store
            .update(&deployment(2), &updated.resource_version)
            .await
            .unwrap();
        assert_eq!(relabeled.generation, 2);
        assert_eq!(store.write_counts().updates, 2);
    }

    #[tokio::test]
    async fn test_events_and_outages() {
        let store = MemoryObjectStore::new();
        let mut events = store.subscribe();
        let created = store.create(&deployment(1)).await.unwrap();
        assert_matches!(
            events.recv().await.unwrap(),
            StoreEvent::ChildChanged { owner: Some(_), .. }
        );

        store.fail_next_calls(1);
        assert_matches!(
            store.get(&created.identity).await,
            Err(Error::TransientStore(_))
        );
        assert!(store.get(&created.identity).await.unwrap().is_some());

        store.delete(&created.identity).await.unwrap();
        store.delete(&created.identity).await.unwrap();
        assert_eq!(store.write_counts().deletes, 1);
    }

    #[test]
    fn test_load_manifests() {
        let store = MemoryObjectStore::new();
        let yaml = r#"
apiVersion: storage.openshift.io/v1alpha1
kind: CSIDriverDeployment
metadata:
  name: nfs
  namespace: storage
spec:
  driverName: csi.example.com
  driverSocket: /csi/csi.sock
  nodeTemplate:
    spec:
      containers:
        - name: driver
          image: example.com/driver:v1
---
apiVersion: storage.openshift.io/v1alpha1
kind: SnapshotController
metadata:
  name: snap
  namespace: storage
spec: {}
"#;
        assert_eq!(store.load_manifests(yaml).unwrap(), 2);
        let key = ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "nfs");
        assert_eq!(store.parent(&key).unwrap().generation(), 1);

        let err = store.load_manifests("kind: ConfigMap\n").unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
