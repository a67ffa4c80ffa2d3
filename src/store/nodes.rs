//! Kubernetes node runtime
//!
//! Cordons and drains nodes through the core API and the eviction
//! subresource, and replaces node plugin pods by deleting them so the
//! DaemonSet controller recreates them from the current template.

use crate::controller::selector::node_matches;
use crate::domain::ports::{EvictionOutcome, NodeDrainer, NodePlugins, ObjectIdentity, PodRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeSelector, PersistentVolume, PersistentVolumeClaim, Pod,
};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Label the DaemonSet controller stamps with the template generation
const POD_TEMPLATE_GENERATION: &str = "pod-template-generation";

/// How often a pending eviction is checked
const EVICTION_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct KubeNodeRuntime {
    client: Client,
}

impl KubeNodeRuntime {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self { client })
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn node_error(node: &str, err: kube::Error) -> Error {
        match Error::from_kube(err, "Node", node) {
            Error::Kube(e) => Error::NodeOperation {
                node: node.to_string(),
                reason: e.to_string(),
            },
            other => other,
        }
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Self::node_error(node, e))?;
        Ok(())
    }

    async fn pods_on_node(&self, api: &Api<Pod>, node: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let pods = api.list(&params).await.map_err(|e| Self::node_error(node, e))?;
        Ok(pods.items)
    }

    /// CSI driver serving a claim, through its bound volume
    async fn claim_driver(&self, namespace: &str, claim: &str) -> Result<Option<String>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let Some(pvc) = claims
            .get_opt(claim)
            .await
            .map_err(|e| Error::from_kube(e, "PersistentVolumeClaim", claim))?
        else {
            return Ok(None);
        };
        let Some(volume) = pvc.spec.and_then(|s| s.volume_name) else {
            return Ok(None);
        };
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let pv = volumes
            .get_opt(&volume)
            .await
            .map_err(|e| Error::from_kube(e, "PersistentVolume", &volume))?;
        Ok(pv
            .and_then(|pv| pv.spec)
            .and_then(|spec| spec.csi)
            .map(|csi| csi.driver))
    }
}

fn owned_by_daemon_set(pod: &Pod, name: Option<&str>) -> bool {
    pod.owner_references().iter().any(|owner| {
        owner.kind == "DaemonSet" && name.map_or(true, |n| owner.name == n)
    })
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn template_generation(pod: &Pod) -> Option<i64> {
    pod.labels()
        .get(POD_TEMPLATE_GENERATION)
        .and_then(|g| g.parse().ok())
}

#[async_trait]
impl NodeDrainer for KubeNodeRuntime {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, true).await?;
        info!(node, "Cordoned node");
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false).await?;
        info!(node, "Uncordoned node");
        Ok(())
    }

    async fn pods_using_driver(&self, node: &str, driver: &str) -> Result<Vec<PodRef>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut drivers: HashMap<(String, String), Option<String>> = HashMap::new();
        let mut matched = Vec::new();

        for pod in self.pods_on_node(&api, node).await? {
            if owned_by_daemon_set(&pod, None) || is_finished(&pod) {
                continue;
            }
            let namespace = pod.namespace().unwrap_or_default();
            let volumes = pod
                .spec
                .as_ref()
                .and_then(|s| s.volumes.clone())
                .unwrap_or_default();

            let mut uses_driver = false;
            for volume in volumes {
                if volume.csi.as_ref().map_or(false, |csi| csi.driver == driver) {
                    uses_driver = true;
                    break;
                }
                let Some(claim) = volume.persistent_volume_claim else {
                    continue;
                };
                let key = (namespace.clone(), claim.claim_name);
                if !drivers.contains_key(&key) {
                    let found = self.claim_driver(&key.0, &key.1).await?;
                    drivers.insert(key.clone(), found);
                }
                if drivers.get(&key).and_then(|d| d.as_deref()) == Some(driver) {
                    uses_driver = true;
                    break;
                }
            }
            if uses_driver {
                matched.push(PodRef::new(namespace, pod.name_any()));
            }
        }
        debug!(node, driver, pods = matched.len(), "Pods using driver");
        Ok(matched)
    }

    async fn evict(&self, pod: &PodRef, timeout: Duration) -> Result<EvictionOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let Some(original) = api
            .get_opt(&pod.name)
            .await
            .map_err(|e| Error::from_kube(e, "Pod", &pod.name))?
        else {
            return Ok(EvictionOutcome::Acknowledged);
        };
        let uid = original.uid();
        let deadline = Instant::now() + timeout;
        let mut requested = false;

        loop {
            if !requested {
                match api.evict(&pod.name, &EvictParams::default()).await {
                    Ok(_) => requested = true,
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {
                        return Ok(EvictionOutcome::Acknowledged)
                    }
                    // Blocked by a disruption budget, try again
                    Err(kube::Error::Api(resp)) if resp.code == 429 => {
                        debug!(pod = %pod, "Eviction blocked by disruption budget");
                    }
                    Err(e) => return Err(Error::from_kube(e, "Pod", &pod.name)),
                }
            }

            if requested {
                let current = api
                    .get_opt(&pod.name)
                    .await
                    .map_err(|e| Error::from_kube(e, "Pod", &pod.name))?;
                // Gone, or replaced by a new pod of the same name
                if current.map_or(true, |p| p.uid() != uid) {
                    return Ok(EvictionOutcome::Acknowledged);
                }
            }

            if Instant::now() >= deadline {
                warn!(pod = %pod, ?timeout, "Eviction did not complete in time");
                return Ok(EvictionOutcome::TimedOut);
            }
            tokio::time::sleep(EVICTION_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl NodePlugins for KubeNodeRuntime {
    async fn list_nodes(&self, selector: Option<&NodeSelector>) -> Result<Vec<String>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "Node", "*"))?;
        Ok(nodes
            .items
            .iter()
            .filter(|n| node_matches(selector, &n.name_any(), n.labels()))
            .map(|n| n.name_any())
            .collect())
    }

    async fn replace_plugin_pod(&self, node: &str, daemon_set: &ObjectIdentity) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &daemon_set.namespace);
        for pod in self.pods_on_node(&api, node).await? {
            if !owned_by_daemon_set(&pod, Some(&daemon_set.name)) {
                continue;
            }
            let name = pod.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(node, pod = %name, "Deleted plugin pod"),
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(Error::from_kube(e, "Pod", &name)),
            }
        }
        Ok(())
    }

    async fn plugin_socket_ready(
        &self,
        node: &str,
        daemon_set: &ObjectIdentity,
        generation: i64,
    ) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &daemon_set.namespace);
        let ready = self
            .pods_on_node(&api, node)
            .await?
            .iter()
            .filter(|pod| owned_by_daemon_set(pod, Some(&daemon_set.name)))
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .any(|pod| template_generation(pod).map_or(false, |g| g >= generation) && is_ready(pod));
        Ok(ready)
    }
}
