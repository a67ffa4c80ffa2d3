//! Simulated nodes
//!
//! In-memory node runtime for standalone mode and the rollout tests. Node
//! plugin pods pick up the current DaemonSet generation from the memory
//! store when replaced. Every node operation is appended to an event log.

use crate::controller::selector::node_matches;
use crate::domain::ports::{
    EvictionOutcome, NodeDrainer, NodePlugins, ObjectIdentity, PodRef,
};
use crate::error::{Error, Result};
use crate::store::memory::MemoryObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::NodeSelector;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Namespace of simulated workload pods
const POD_NAMESPACE: &str = "default";

/// Node operation performed against the simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Cordoned(String),
    Uncordoned(String),
    Evicted { node: String, pod: String },
    EvictionTimedOut { node: String, pod: String },
    PluginReplaced(String),
}

impl NodeEvent {
    pub fn node(&self) -> &str {
        match self {
            NodeEvent::Cordoned(node)
            | NodeEvent::Uncordoned(node)
            | NodeEvent::PluginReplaced(node)
            | NodeEvent::Evicted { node, .. }
            | NodeEvent::EvictionTimedOut { node, .. } => node,
        }
    }
}

#[derive(Debug, Default)]
struct SimNode {
    labels: BTreeMap<String, String>,
    cordoned: bool,
    /// Pod name -> driver of the volume it uses
    pods: BTreeMap<String, Option<String>>,
    /// Plugin generation per DaemonSet
    plugins: HashMap<ObjectIdentity, i64>,
    stuck_pods: HashSet<String>,
    never_ready: bool,
    /// Socket checks left to fail with a transient error
    failing_socket_checks: u32,
}

pub struct SimulatedNodes {
    store: Arc<MemoryObjectStore>,
    nodes: RwLock<BTreeMap<String, SimNode>>,
    events: Mutex<Vec<NodeEvent>>,
}

impl SimulatedNodes {
    pub fn new(store: Arc<MemoryObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            nodes: RwLock::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn add_node(&self, name: &str, labels: BTreeMap<String, String>) {
        self.nodes.write().insert(
            name.to_string(),
            SimNode {
                labels,
                ..Default::default()
            },
        );
    }

    /// Schedule a workload pod, optionally holding a volume of `driver`
    pub fn add_pod(&self, node: &str, pod: &str, driver: Option<&str>) {
        if let Some(n) = self.nodes.write().get_mut(node) {
            n.pods.insert(pod.to_string(), driver.map(str::to_string));
        }
    }

    /// Pretend a plugin pod of `daemon_set` runs `generation` on the node
    pub fn run_plugin(&self, node: &str, daemon_set: &ObjectIdentity, generation: i64) {
        if let Some(n) = self.nodes.write().get_mut(node) {
            n.plugins.insert(daemon_set.clone(), generation);
        }
    }

    /// Make evictions of the pod never complete
    pub fn stick_eviction(&self, node: &str, pod: &str) {
        if let Some(n) = self.nodes.write().get_mut(node) {
            n.stuck_pods.insert(pod.to_string());
        }
    }

    /// Make the node's plugin socket never become ready
    pub fn never_ready(&self, node: &str) {
        if let Some(n) = self.nodes.write().get_mut(node) {
            n.never_ready = true;
        }
    }

    /// Make the next `count` socket checks on the node fail transiently
    pub fn fail_socket_checks(&self, node: &str, count: u32) {
        if let Some(n) = self.nodes.write().get_mut(node) {
            n.failing_socket_checks = count;
        }
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.nodes.read().get(node).map_or(false, |n| n.cordoned)
    }

    pub fn plugin_generation(&self, node: &str, daemon_set: &ObjectIdentity) -> Option<i64> {
        self.nodes
            .read()
            .get(node)
            .and_then(|n| n.plugins.get(daemon_set).copied())
    }

    pub fn pods(&self, node: &str) -> Vec<String> {
        self.nodes
            .read()
            .get(node)
            .map(|n| n.pods.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<NodeEvent> {
        self.events.lock().clone()
    }

    fn log(&self, event: NodeEvent) {
        self.events.lock().push(event);
    }

    fn set_cordoned(&self, node: &str, cordoned: bool) -> Result<()> {
        let mut nodes = self.nodes.write();
        let n = nodes.get_mut(node).ok_or_else(|| unknown_node(node))?;
        n.cordoned = cordoned;
        Ok(())
    }
}

fn unknown_node(node: &str) -> Error {
    Error::NodeOperation {
        node: node.to_string(),
        reason: "node does not exist".to_string(),
    }
}

#[async_trait]
impl NodeDrainer for SimulatedNodes {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.set_cordoned(node, true)?;
        self.log(NodeEvent::Cordoned(node.to_string()));
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_cordoned(node, false)?;
        self.log(NodeEvent::Uncordoned(node.to_string()));
        Ok(())
    }

    async fn pods_using_driver(&self, node: &str, driver: &str) -> Result<Vec<PodRef>> {
        let nodes = self.nodes.read();
        let n = nodes.get(node).ok_or_else(|| unknown_node(node))?;
        Ok(n.pods
            .iter()
            .filter(|(_, d)| d.as_deref() == Some(driver))
            .map(|(name, _)| PodRef::new(POD_NAMESPACE, name.clone()))
            .collect())
    }

    async fn evict(&self, pod: &PodRef, timeout: Duration) -> Result<EvictionOutcome> {
        let (node, stuck) = {
            let nodes = self.nodes.read();
            let Some((node, n)) = nodes.iter().find(|(_, n)| n.pods.contains_key(&pod.name)) else {
                return Ok(EvictionOutcome::Acknowledged);
            };
            (node.clone(), n.stuck_pods.contains(&pod.name))
        };

        if stuck {
            tokio::time::sleep(timeout).await;
            self.log(NodeEvent::EvictionTimedOut {
                node,
                pod: pod.name.clone(),
            });
            return Ok(EvictionOutcome::TimedOut);
        }

        if let Some(n) = self.nodes.write().get_mut(&node) {
            n.pods.remove(&pod.name);
        }
        self.log(NodeEvent::Evicted {
            node,
            pod: pod.name.clone(),
        });
        Ok(EvictionOutcome::Acknowledged)
    }
}

#[async_trait]
impl NodePlugins for SimulatedNodes {
    async fn list_nodes(&self, selector: Option<&NodeSelector>) -> Result<Vec<String>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|(name, n)| node_matches(selector, name, &n.labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn replace_plugin_pod(&self, node: &str, daemon_set: &ObjectIdentity) -> Result<()> {
        let generation = self
            .store
            .object(daemon_set)
            .map(|o| o.generation)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: daemon_set.kind.to_string(),
                name: daemon_set.name.clone(),
            })?;
        {
            let mut nodes = self.nodes.write();
            let n = nodes.get_mut(node).ok_or_else(|| unknown_node(node))?;
            n.plugins.insert(daemon_set.clone(), generation);
        }
        self.log(NodeEvent::PluginReplaced(node.to_string()));
        Ok(())
    }

    async fn plugin_socket_ready(
        &self,
        node: &str,
        daemon_set: &ObjectIdentity,
        generation: i64,
    ) -> Result<bool> {
        let mut nodes = self.nodes.write();
        let n = nodes.get_mut(node).ok_or_else(|| unknown_node(node))?;
        if n.failing_socket_checks > 0 {
            n.failing_socket_checks -= 1;
            return Err(Error::TransientStore(format!(
                "plugin socket check on {} failed",
                node
            )));
        }
        Ok(!n.never_ready && n.plugins.get(daemon_set).map_or(false, |g| *g >= generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ObjectKind;
    use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm};

    #[tokio::test]
    async fn test_list_nodes_honors_selector() {
        let nodes = SimulatedNodes::new(MemoryObjectStore::new());
        nodes.add_node("a", BTreeMap::from([("csi".to_string(), "yes".to_string())]));
        nodes.add_node("b", BTreeMap::new());

        let selector = NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "csi".into(),
                    operator: "Exists".into(),
                    values: None,
                }]),
                match_fields: None,
            }],
        };
        assert_eq!(nodes.list_nodes(Some(&selector)).await.unwrap(), vec!["a"]);
        assert_eq!(nodes.list_nodes(None).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_evict_and_socket_readiness() {
        let nodes = SimulatedNodes::new(MemoryObjectStore::new());
        nodes.add_node("a", BTreeMap::new());
        nodes.add_pod("a", "app", Some("csi.example.com"));

        let pods = nodes.pods_using_driver("a", "csi.example.com").await.unwrap();
        assert_eq!(pods, vec![PodRef::new(POD_NAMESPACE, "app")]);
        let outcome = nodes.evict(&pods[0], Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, EvictionOutcome::Acknowledged);
        assert!(nodes.pods("a").is_empty());

        let ds = ObjectIdentity::new(ObjectKind::DaemonSet, "storage", "nfs-csi-node");
        assert!(!nodes.plugin_socket_ready("a", &ds, 1).await.unwrap());
        nodes.run_plugin("a", &ds, 2);
        assert!(nodes.plugin_socket_ready("a", &ds, 2).await.unwrap());

        // The DaemonSet does not exist in the store
        assert!(nodes.replace_plugin_pod("a", &ds).await.is_err());
    }
}
