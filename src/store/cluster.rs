//! Kubernetes object store
//!
//! Implements [`ObjectStore`] against the API server. Writes go through typed
//! `Api` handles; watchers for the provisioner kinds and for owned children
//! are forwarded into one broadcast channel.

use crate::crd::{
    CephFsProvisioner, CsiDriverDeployment, EfsProvisioner, LocalStorageProvider,
    ManilaProvisioner, SnapshotController, StorageStatus,
};
use crate::domain::ports::{
    DesiredObject, ObjectBody, ObjectIdentity, ObjectKind, ObjectStore, ParentKey,
    ProvisionerKind, StorageClassBody, StoreEvent, StoredObject, LABEL_MANAGED_BY, MANAGER_NAME,
};
use crate::domain::resource::ProvisionerResource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Bounds shared by the provisioner custom resources
trait ParentResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + Into<ProvisionerResource>
    + 'static
{
}

impl<T> ParentResource for T where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + Into<ProvisionerResource>
        + 'static
{
}

/// Run `$body` with `$T` bound to the custom resource type of `$kind`
macro_rules! with_parent_type {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            ProvisionerKind::CsiDriverDeployment => {
                type $T = CsiDriverDeployment;
                $body
            }
            ProvisionerKind::EfsProvisioner => {
                type $T = EfsProvisioner;
                $body
            }
            ProvisionerKind::ManilaProvisioner => {
                type $T = ManilaProvisioner;
                $body
            }
            ProvisionerKind::CephFsProvisioner => {
                type $T = CephFsProvisioner;
                $body
            }
            ProvisionerKind::SnapshotController => {
                type $T = SnapshotController;
                $body
            }
            ProvisionerKind::LocalStorageProvider => {
                type $T = LocalStorageProvider;
                $body
            }
        }
    };
}

pub struct KubeObjectStore {
    client: Client,
    /// Restricts listing and watching of provisioner resources
    namespace: Option<String>,
    events: broadcast::Sender<StoreEvent>,
}

impl KubeObjectStore {
    pub fn new(client: Client, namespace: Option<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            client,
            namespace,
            events,
        })
    }

    fn scoped<K: ParentResource>(&self) -> Api<K> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn get_parent_as<K: ParentResource>(&self, key: &ParentKey) -> Result<Option<ProvisionerResource>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let resource = api
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, key.kind.as_str(), &key.name))?;
        Ok(resource.map(Into::into))
    }

    async fn list_parents_as<K: ParentResource>(&self, kind: ProvisionerKind) -> Result<Vec<ParentKey>> {
        let list = self
            .scoped::<K>()
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, kind.as_str(), "*"))?;
        Ok(list
            .items
            .into_iter()
            .map(|r| Into::<ProvisionerResource>::into(r).key())
            .collect())
    }

    async fn patch_status_as<K: ParentResource>(&self, key: &ParentKey, status: &StorageStatus) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, key.kind.as_str(), &key.name))?;
        Ok(())
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Spawn watchers for every provisioner kind and every owned child kind
    pub fn start_watchers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in ProvisionerKind::ALL {
            let handle = with_parent_type!(kind, T => self.spawn_parent_watcher::<T>(shutdown.clone()));
            handles.push(handle);
        }

        let owned = watcher::Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME));
        handles.push(self.spawn_child_watcher::<DaemonSet>(owned.clone(), shutdown.clone()));
        handles.push(self.spawn_child_watcher::<Deployment>(owned.clone(), shutdown.clone()));
        handles.push(self.spawn_child_watcher::<StorageClass>(owned, shutdown));
        info!(watchers = handles.len(), "Started watchers");
        handles
    }

    fn spawn_parent_watcher<K: ParentResource>(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let api = self.scoped::<K>();
        let events = self.events.clone();
        tokio::spawn(forward(
            K::kind(&()).to_string(),
            api,
            watcher::Config::default(),
            events,
            shutdown,
            |resource: &K, deleted| {
                let key = Into::<ProvisionerResource>::into(resource.clone()).key();
                Some(if deleted {
                    StoreEvent::ParentDeleted(key)
                } else {
                    StoreEvent::ParentChanged(key)
                })
            },
        ))
    }

    fn spawn_child_watcher<K>(&self, config: watcher::Config, shutdown: CancellationToken) -> JoinHandle<()>
    where
        K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
        K: ChildResource,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let to_event = |object: &K, _deleted: bool| {
            Some(StoreEvent::ChildChanged {
                child: ObjectIdentity::new(
                    K::OBJECT_KIND,
                    object.namespace().unwrap_or_default(),
                    object.name_any(),
                ),
                owner: ParentKey::from_labels(object.labels()),
            })
        };
        tokio::spawn(forward(
            K::OBJECT_KIND.to_string(),
            api,
            config,
            self.events.clone(),
            shutdown,
            to_event,
        ))
    }
}

/// Forward watch events into the store's broadcast channel until shutdown
async fn forward<K, F>(
    kind: String,
    api: Api<K>,
    config: watcher::Config,
    events: broadcast::Sender<StoreEvent>,
    shutdown: CancellationToken,
    to_event: F,
) where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    F: Fn(&K, bool) -> Option<StoreEvent> + Send + 'static,
{
    let stream = watcher::watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(Event::Applied(object))) => publish(&events, to_event(&object, false)),
                Some(Ok(Event::Deleted(object))) => publish(&events, to_event(&object, true)),
                Some(Ok(Event::Restarted(objects))) => {
                    debug!(%kind, count = objects.len(), "Watch restarted");
                    for object in &objects {
                        publish(&events, to_event(object, false));
                    }
                }
                Some(Err(e)) => warn!(%kind, error = %e, "Watch error, will retry"),
                None => break,
            },
        }
    }
    debug!(%kind, "Watcher stopped");
}

fn publish(events: &broadcast::Sender<StoreEvent>, event: Option<StoreEvent>) {
    if let Some(event) = event {
        // No subscribers is fine
        let _ = events.send(event);
    }
}

// =============================================================================
// Child Conversions
// =============================================================================

/// Conversion between a Kubernetes object and the store's child model
trait ChildResource: Sized {
    const OBJECT_KIND: ObjectKind;

    fn api(client: Client, id: &ObjectIdentity) -> Api<Self>;

    fn from_desired(object: &DesiredObject) -> Result<Self>;

    fn into_stored(self) -> Result<StoredObject>;
}

fn desired_meta(object: &DesiredObject) -> ObjectMeta {
    let id = &object.identity;
    ObjectMeta {
        name: Some(id.name.clone()),
        namespace: id.kind.is_namespaced().then(|| id.namespace.clone()),
        labels: Some(object.labels.clone()),
        annotations: Some(object.annotations.clone()),
        ..Default::default()
    }
}

fn stored(kind: ObjectKind, meta: ObjectMeta, body: ObjectBody) -> StoredObject {
    StoredObject {
        identity: ObjectIdentity::new(
            kind,
            meta.namespace.unwrap_or_default(),
            meta.name.unwrap_or_default(),
        ),
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        resource_version: meta.resource_version.unwrap_or_default(),
        generation: meta.generation.unwrap_or(1),
        body,
    }
}

fn body_mismatch(object: &DesiredObject, expected: ObjectKind) -> Error {
    Error::Internal(format!(
        "{} carries a {} body, expected {}",
        object.identity,
        object.body.kind(),
        expected
    ))
}

impl ChildResource for DaemonSet {
    const OBJECT_KIND: ObjectKind = ObjectKind::DaemonSet;

    fn api(client: Client, id: &ObjectIdentity) -> Api<Self> {
        Api::namespaced(client, &id.namespace)
    }

    fn from_desired(object: &DesiredObject) -> Result<Self> {
        let ObjectBody::DaemonSet(spec) = &object.body else {
            return Err(body_mismatch(object, Self::OBJECT_KIND));
        };
        Ok(DaemonSet {
            metadata: desired_meta(object),
            spec: Some(spec.clone()),
            status: None,
        })
    }

    fn into_stored(self) -> Result<StoredObject> {
        let body = ObjectBody::DaemonSet(self.spec.unwrap_or_default());
        Ok(stored(Self::OBJECT_KIND, self.metadata, body))
    }
}

impl ChildResource for Deployment {
    const OBJECT_KIND: ObjectKind = ObjectKind::Deployment;

    fn api(client: Client, id: &ObjectIdentity) -> Api<Self> {
        Api::namespaced(client, &id.namespace)
    }

    fn from_desired(object: &DesiredObject) -> Result<Self> {
        let ObjectBody::Deployment(spec) = &object.body else {
            return Err(body_mismatch(object, Self::OBJECT_KIND));
        };
        Ok(Deployment {
            metadata: desired_meta(object),
            spec: Some(spec.clone()),
            status: None,
        })
    }

    fn into_stored(self) -> Result<StoredObject> {
        let body = ObjectBody::Deployment(self.spec.unwrap_or_default());
        Ok(stored(Self::OBJECT_KIND, self.metadata, body))
    }
}

impl ChildResource for StorageClass {
    const OBJECT_KIND: ObjectKind = ObjectKind::StorageClass;

    fn api(client: Client, _id: &ObjectIdentity) -> Api<Self> {
        Api::all(client)
    }

    fn from_desired(object: &DesiredObject) -> Result<Self> {
        let ObjectBody::StorageClass(body) = &object.body else {
            return Err(body_mismatch(object, Self::OBJECT_KIND));
        };
        Ok(StorageClass {
            metadata: desired_meta(object),
            provisioner: body.provisioner.clone(),
            parameters: (!body.parameters.is_empty()).then(|| body.parameters.clone()),
            reclaim_policy: body.reclaim_policy.clone(),
            volume_binding_mode: body.volume_binding_mode.clone(),
            ..Default::default()
        })
    }

    fn into_stored(self) -> Result<StoredObject> {
        let body = ObjectBody::StorageClass(StorageClassBody {
            provisioner: self.provisioner,
            parameters: self.parameters.unwrap_or_default(),
            reclaim_policy: self.reclaim_policy,
            volume_binding_mode: self.volume_binding_mode,
        });
        Ok(stored(Self::OBJECT_KIND, self.metadata, body))
    }
}

/// Run `$body` with `$T` bound to the Kubernetes type of a child kind
macro_rules! with_child_type {
    ($kind:expr, $T:ident => $body:expr) => {
        match $kind {
            ObjectKind::DaemonSet => {
                type $T = DaemonSet;
                $body
            }
            ObjectKind::Deployment => {
                type $T = Deployment;
                $body
            }
            ObjectKind::StorageClass => {
                type $T = StorageClass;
                $body
            }
        }
    };
}

impl KubeObjectStore {
    async fn get_child<K>(&self, id: &ObjectIdentity) -> Result<Option<StoredObject>>
    where
        K: ChildResource + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
    {
        let api = K::api(self.client.clone(), id);
        let object = api
            .get_opt(&id.name)
            .await
            .map_err(|e| Error::from_kube(e, id.kind.as_str(), &id.name))?;
        object.map(K::into_stored).transpose()
    }

    async fn create_child<K>(&self, object: &DesiredObject) -> Result<StoredObject>
    where
        K: ChildResource + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let id = &object.identity;
        let api = K::api(self.client.clone(), id);
        let created = api
            .create(&PostParams::default(), &K::from_desired(object)?)
            .await
            .map_err(|e| Error::from_kube(e, id.kind.as_str(), &id.name))?;
        created.into_stored()
    }

    async fn replace_child<K>(&self, object: &DesiredObject, resource_version: &str) -> Result<StoredObject>
    where
        K: ChildResource + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let id = &object.identity;
        let api = K::api(self.client.clone(), id);
        let mut replacement = K::from_desired(object)?;
        replacement.meta_mut().resource_version = Some(resource_version.to_string());
        let replaced = api
            .replace(&id.name, &PostParams::default(), &replacement)
            .await
            .map_err(|e| Error::from_kube(e, id.kind.as_str(), &id.name))?;
        replaced.into_stored()
    }

    async fn delete_child<K>(&self, id: &ObjectIdentity) -> Result<()>
    where
        K: ChildResource + Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
    {
        let api = K::api(self.client.clone(), id);
        match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(e, id.kind.as_str(), &id.name)),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_parent(&self, key: &ParentKey) -> Result<Option<ProvisionerResource>> {
        with_parent_type!(key.kind, T => self.get_parent_as::<T>(key).await)
    }

    async fn list_parents(&self) -> Result<Vec<ParentKey>> {
        let mut keys = Vec::new();
        for kind in ProvisionerKind::ALL {
            keys.extend(with_parent_type!(kind, T => self.list_parents_as::<T>(kind).await)?);
        }
        Ok(keys)
    }

    async fn update_parent_status(&self, key: &ParentKey, status: &StorageStatus) -> Result<()> {
        with_parent_type!(key.kind, T => self.patch_status_as::<T>(key, status).await)
    }

    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredObject>> {
        with_child_type!(id.kind, T => self.get_child::<T>(id).await)
    }

    async fn create(&self, object: &DesiredObject) -> Result<StoredObject> {
        with_child_type!(object.identity.kind, T => self.create_child::<T>(object).await)
    }

    async fn update(&self, object: &DesiredObject, resource_version: &str) -> Result<StoredObject> {
        with_child_type!(object.identity.kind, T => self.replace_child::<T>(object, resource_version).await)
    }

    async fn delete(&self, id: &ObjectIdentity) -> Result<()> {
        with_child_type!(id.kind, T => self.delete_child::<T>(id).await)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
