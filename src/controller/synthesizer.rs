//! Desired State Synthesizer
//!
//! Turns a CSIDriverDeployment spec into the full specs of its children: a
//! node DaemonSet and, when a controller template is given, a controller
//! Deployment. Operator-owned sidecars and volumes carry a reserved name
//! prefix and are stripped before being injected again, so synthesizing an
//! already synthesized template is a no-op.
//!
//! Synthesis is a pure function of its inputs and the synthesizer's image
//! configuration.

use crate::controller::provisioners::{self, ProvisionerImages};
use crate::controller::selector;
use crate::crd::CsiDriverDeploymentSpec;
use crate::domain::ports::{DesiredObject, ObjectBody, ObjectIdentity, ObjectKind, ParentKey};
use crate::domain::resource::ProvisionerResource;
use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{
    DaemonSetSpec, DaemonSetUpdateStrategy, DeploymentSpec,
};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Name prefix of every container and volume the operator injects
pub const RESERVED_PREFIX: &str = "csi-operator-";

/// Pod label selecting the pods of one synthesized workload
pub const LABEL_WORKLOAD: &str = "storage.openshift.io/workload";

pub const REGISTRAR_CONTAINER: &str = "csi-operator-driver-registrar";
pub const LIVENESS_PROBE_CONTAINER: &str = "csi-operator-liveness-probe";
pub const PROVISIONER_CONTAINER: &str = "csi-operator-provisioner";
pub const ATTACHER_CONTAINER: &str = "csi-operator-attacher";

const PLUGIN_DIR_VOLUME: &str = "csi-operator-plugin-dir";
const REGISTRATION_DIR_VOLUME: &str = "csi-operator-registration-dir";
const SOCKET_DIR_VOLUME: &str = "csi-operator-socket-dir";

/// Where sidecars see the driver socket directory
const SIDECAR_SOCKET_DIR: &str = "/csi";
const SIDECAR_REGISTRATION_DIR: &str = "/registration";

// =============================================================================
// Configuration
// =============================================================================

/// Images of the injected sidecars
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarImages {
    pub driver_registrar: String,
    pub liveness_probe: String,
    pub provisioner: String,
    pub attacher: String,
}

impl Default for SidecarImages {
    fn default() -> Self {
        Self {
            driver_registrar: "quay.io/k8scsi/driver-registrar:v0.4.1".to_string(),
            liveness_probe: "quay.io/k8scsi/livenessprobe:v0.4.1".to_string(),
            provisioner: "quay.io/k8scsi/csi-provisioner:v0.4.1".to_string(),
            attacher: "quay.io/k8scsi/csi-attacher:v0.4.1".to_string(),
        }
    }
}

/// Configuration for the synthesizer
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizerConfig {
    pub sidecars: SidecarImages,
    pub provisioner_images: ProvisionerImages,
    /// Kubelet root directory on the host
    pub kubelet_dir: String,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            sidecars: SidecarImages::default(),
            provisioner_images: ProvisionerImages::default(),
            kubelet_dir: "/var/lib/kubelet".to_string(),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// Derived children of a CSIDriverDeployment
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedChildren {
    pub node: DaemonSetSpec,
    pub controller: Option<DeploymentSpec>,
}

/// Socket location split into directory and file name
struct SocketPath {
    dir: String,
    file: String,
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Pure mapping from provisioner specs to desired child objects
#[derive(Debug, Clone, Default)]
pub struct DesiredStateSynthesizer {
    config: SynthesizerConfig,
}

impl DesiredStateSynthesizer {
    pub fn new(config: SynthesizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    /// Identity of the node DaemonSet of a CSIDriverDeployment
    pub fn node_identity(parent: &ParentKey) -> ObjectIdentity {
        ObjectIdentity::new(ObjectKind::DaemonSet, &parent.namespace, parent.child_name("node"))
    }

    /// Identity of the controller Deployment of a CSIDriverDeployment
    pub fn controller_identity(parent: &ParentKey) -> ObjectIdentity {
        ObjectIdentity::new(
            ObjectKind::Deployment,
            &parent.namespace,
            parent.child_name("controller"),
        )
    }

    /// Every child object the resource should have
    pub fn desired_children(&self, resource: &ProvisionerResource) -> Result<Vec<DesiredObject>> {
        let key = resource.key();
        let children = match resource {
            ProvisionerResource::CsiDriver(r) => {
                let synthesized = self.synthesize(&key, &r.spec)?;
                let mut children = vec![DesiredObject::owned(
                    &key,
                    Self::node_identity(&key),
                    ObjectBody::DaemonSet(synthesized.node),
                )?];
                if let Some(controller) = synthesized.controller {
                    children.push(DesiredObject::owned(
                        &key,
                        Self::controller_identity(&key),
                        ObjectBody::Deployment(controller),
                    )?);
                }
                children
            }
            ProvisionerResource::Efs(r) => {
                provisioners::efs_children(&key, &r.spec, &self.config.provisioner_images)?
            }
            ProvisionerResource::Manila(r) => {
                provisioners::manila_children(&key, &r.spec, &self.config.provisioner_images)?
            }
            ProvisionerResource::CephFs(r) => {
                provisioners::cephfs_children(&key, &r.spec, &self.config.provisioner_images)?
            }
            ProvisionerResource::Snapshot(r) => {
                provisioners::snapshot_children(&key, &r.spec, &self.config.provisioner_images)?
            }
            ProvisionerResource::LocalStorage(r) => {
                provisioners::local_storage_children(&key, &r.spec, &self.config.provisioner_images)?
            }
        };

        debug!(parent = %key, count = children.len(), "Synthesized desired children");
        Ok(children)
    }

    /// Synthesize the node DaemonSet and optional controller Deployment
    pub fn synthesize(
        &self,
        parent: &ParentKey,
        spec: &CsiDriverDeploymentSpec,
    ) -> Result<SynthesizedChildren> {
        if spec.driver_name.trim().is_empty() {
            return Err(invalid(parent, "driverName must not be empty"));
        }
        let socket = parse_socket(parent, &spec.driver_socket)?;

        let node = self.node_daemon_set(parent, spec, &socket)?;
        let controller = spec
            .controller_template
            .as_ref()
            .map(|template| self.controller_deployment(parent, spec, template, &socket))
            .transpose()?;

        Ok(SynthesizedChildren { node, controller })
    }

    fn node_daemon_set(
        &self,
        parent: &ParentKey,
        spec: &CsiDriverDeploymentSpec,
        socket: &SocketPath,
    ) -> Result<DaemonSetSpec> {
        let workload = parent.child_name("node");
        let plugin_dir = format!(
            "{}/plugins/{}/",
            self.config.kubelet_dir.trim_end_matches('/'),
            spec.driver_name
        );
        let registration_dir = format!(
            "{}/plugins_registry/",
            self.config.kubelet_dir.trim_end_matches('/')
        );

        let mut template = spec.node_template.clone();
        let pod = template
            .spec
            .as_mut()
            .ok_or_else(|| invalid(parent, "nodeTemplate has no pod spec"))?;
        strip_reserved(pod);

        let driver = pod
            .containers
            .first_mut()
            .ok_or_else(|| invalid(parent, "nodeTemplate has no driver container"))?;
        mount_socket_dir(driver, PLUGIN_DIR_VOLUME, &socket.dir);

        let sidecar_socket = format!("{}/{}", SIDECAR_SOCKET_DIR, socket.file);
        pod.containers.push(Container {
            name: REGISTRAR_CONTAINER.to_string(),
            image: Some(self.config.sidecars.driver_registrar.clone()),
            args: Some(vec![
                "--v=5".to_string(),
                format!("--csi-address={}", sidecar_socket),
                format!("--kubelet-registration-path={}{}", plugin_dir, socket.file),
            ]),
            env: Some(vec![EnvVar {
                name: "KUBE_NODE_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                mount(PLUGIN_DIR_VOLUME, SIDECAR_SOCKET_DIR),
                mount(REGISTRATION_DIR_VOLUME, SIDECAR_REGISTRATION_DIR),
            ]),
            ..Default::default()
        });
        pod.containers.push(Container {
            name: LIVENESS_PROBE_CONTAINER.to_string(),
            image: Some(self.config.sidecars.liveness_probe.clone()),
            args: Some(vec![format!("--csi-address={}", sidecar_socket)]),
            volume_mounts: Some(vec![mount(PLUGIN_DIR_VOLUME, SIDECAR_SOCKET_DIR)]),
            ..Default::default()
        });

        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        volumes.push(host_path_volume(PLUGIN_DIR_VOLUME, &plugin_dir, "DirectoryOrCreate"));
        volumes.push(host_path_volume(REGISTRATION_DIR_VOLUME, &registration_dir, "Directory"));

        if let Some(required) = selector::node_affinity(spec.node_selector.as_ref())
            .and_then(|a| a.node_affinity)
            .and_then(|na| na.required_during_scheduling_ignored_during_execution)
        {
            pod.affinity
                .get_or_insert_with(Default::default)
                .node_affinity
                .get_or_insert_with(Default::default)
                .required_during_scheduling_ignored_during_execution = Some(required);
        }

        label_template(&mut template, &workload);

        Ok(DaemonSetSpec {
            selector: workload_selector(&workload),
            template,
            // Node pods are only replaced by the rollout coordinator
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            ..Default::default()
        })
    }

    fn controller_deployment(
        &self,
        parent: &ParentKey,
        spec: &CsiDriverDeploymentSpec,
        template: &PodTemplateSpec,
        socket: &SocketPath,
    ) -> Result<DeploymentSpec> {
        let workload = parent.child_name("controller");

        let mut template = template.clone();
        let pod = template
            .spec
            .as_mut()
            .ok_or_else(|| invalid(parent, "controllerTemplate has no pod spec"))?;
        strip_reserved(pod);

        let driver = pod
            .containers
            .first_mut()
            .ok_or_else(|| invalid(parent, "controllerTemplate has no driver container"))?;
        mount_socket_dir(driver, SOCKET_DIR_VOLUME, &socket.dir);

        let sidecar_socket = format!("{}/{}", SIDECAR_SOCKET_DIR, socket.file);
        pod.containers.push(Container {
            name: PROVISIONER_CONTAINER.to_string(),
            image: Some(self.config.sidecars.provisioner.clone()),
            args: Some(vec![
                "--v=5".to_string(),
                format!("--provisioner={}", spec.driver_name),
                format!("--csi-address={}", sidecar_socket),
            ]),
            volume_mounts: Some(vec![mount(SOCKET_DIR_VOLUME, SIDECAR_SOCKET_DIR)]),
            ..Default::default()
        });
        pod.containers.push(Container {
            name: ATTACHER_CONTAINER.to_string(),
            image: Some(self.config.sidecars.attacher.clone()),
            args: Some(vec![
                "--v=5".to_string(),
                format!("--csi-address={}", sidecar_socket),
            ]),
            volume_mounts: Some(vec![mount(SOCKET_DIR_VOLUME, SIDECAR_SOCKET_DIR)]),
            ..Default::default()
        });
        pod.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: SOCKET_DIR_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });

        label_template(&mut template, &workload);

        Ok(DeploymentSpec {
            replicas: Some(1),
            selector: workload_selector(&workload),
            template,
            ..Default::default()
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn invalid(parent: &ParentKey, reason: impl Into<String>) -> Error {
    Error::InvalidSpec {
        resource: parent.to_string(),
        reason: reason.into(),
    }
}

fn parse_socket(parent: &ParentKey, driver_socket: &str) -> Result<SocketPath> {
    if driver_socket.trim().is_empty() {
        return Err(invalid(parent, "driverSocket must not be empty"));
    }
    let path = Path::new(driver_socket);
    if !path.is_absolute() {
        return Err(invalid(parent, "driverSocket must be an absolute path"));
    }
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .ok_or_else(|| invalid(parent, "driverSocket must name a socket file"))?;
    let dir = path
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .filter(|d| d != "/")
        .ok_or_else(|| invalid(parent, "driverSocket must live in a directory below /"))?;
    Ok(SocketPath { dir, file })
}

/// Remove everything a previous synthesis injected
fn strip_reserved(pod: &mut PodSpec) {
    pod.containers.retain(|c| !c.name.starts_with(RESERVED_PREFIX));
    for container in &mut pod.containers {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| !m.name.starts_with(RESERVED_PREFIX));
        }
    }
    if let Some(volumes) = pod.volumes.as_mut() {
        volumes.retain(|v| !v.name.starts_with(RESERVED_PREFIX));
    }
}

/// Mount the socket directory into the driver container, replacing any
/// mount the template already has at that path
fn mount_socket_dir(driver: &mut Container, volume: &str, dir: &str) {
    let mounts = driver.volume_mounts.get_or_insert_with(Vec::new);
    mounts.retain(|m| m.mount_path.trim_end_matches('/') != dir.trim_end_matches('/'));
    mounts.push(mount(volume, dir));
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

pub(crate) fn workload_selector(workload: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            LABEL_WORKLOAD.to_string(),
            workload.to_string(),
        )])),
        ..Default::default()
    }
}

pub(crate) fn label_template(template: &mut PodTemplateSpec, workload: &str) {
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_WORKLOAD.to_string(), workload.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ProvisionerKind;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};

    fn parent() -> ParentKey {
        ParentKey::new(ProvisionerKind::CsiDriverDeployment, "storage", "example")
    }

    fn template(containers: &[&str]) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        image: Some(format!("{}:latest", name)),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }

    fn spec() -> CsiDriverDeploymentSpec {
        CsiDriverDeploymentSpec {
            driver_name: "csi.example.com".into(),
            node_template: template(&["driver"]),
            node_selector: None,
            controller_template: None,
            driver_socket: "/csi/csi.sock".into(),
            node_update_strategy: None,
            tolerate_socket_loss: false,
        }
    }

    fn container_names(pod: &PodSpec) -> Vec<String> {
        pod.containers.iter().map(|c| c.name.clone()).collect()
    }

    #[test]
    fn test_daemon_set_only_without_controller_template() {
        let synth = DesiredStateSynthesizer::default();
        let out = synth.synthesize(&parent(), &spec()).unwrap();
        assert!(out.controller.is_none());

        let pod = out.node.template.spec.as_ref().unwrap();
        assert_eq!(
            container_names(pod),
            vec!["driver", REGISTRAR_CONTAINER, LIVENESS_PROBE_CONTAINER]
        );

        let driver_mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(driver_mounts.len(), 1);
        assert_eq!(driver_mounts[0].mount_path, "/csi");

        let plugin_volume = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == driver_mounts[0].name)
            .unwrap();
        assert_eq!(
            plugin_volume.host_path.as_ref().unwrap().path,
            "/var/lib/kubelet/plugins/csi.example.com/"
        );
        assert_eq!(
            out.node.update_strategy.as_ref().unwrap().type_.as_deref(),
            Some("OnDelete")
        );
    }

    #[test]
    fn test_user_mount_at_socket_dir_is_replaced() {
        let synth = DesiredStateSynthesizer::default();
        let mut s = spec();
        s.node_template.spec.as_mut().unwrap().containers[0].volume_mounts = Some(vec![
            mount("user-socket", "/csi/"),
            mount("config", "/etc/driver"),
        ]);
        s.controller_template = Some(s.node_template.clone());
        let out = synth.synthesize(&parent(), &s).unwrap();

        let node_mounts = out.node.template.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        let paths: Vec<_> = node_mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(paths, vec!["/etc/driver", "/csi"]);
        assert_eq!(node_mounts[1].name, PLUGIN_DIR_VOLUME);

        let controller = out.controller.unwrap();
        let controller_mounts = controller.template.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();
        assert_eq!(controller_mounts.len(), 2);
        assert_eq!(controller_mounts[1].name, SOCKET_DIR_VOLUME);
    }

    #[test]
    fn test_resynthesis_does_not_duplicate_sidecars() {
        let synth = DesiredStateSynthesizer::default();
        let first = synth.synthesize(&parent(), &spec()).unwrap();

        let mut again = spec();
        again.node_template = first.node.template.clone();
        let second = synth.synthesize(&parent(), &again).unwrap();

        assert_eq!(first.node, second.node);
        let pod = second.node.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 3);
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_sidecars_found_by_prefix_not_position() {
        let synth = DesiredStateSynthesizer::default();
        let mut s = spec();
        // A stale sidecar placed before a user sidecar
        s.node_template = template(&["driver", LIVENESS_PROBE_CONTAINER, "metrics"]);
        let out = synth.synthesize(&parent(), &s).unwrap();
        let pod = out.node.template.spec.as_ref().unwrap();
        assert_eq!(
            container_names(pod),
            vec!["driver", "metrics", REGISTRAR_CONTAINER, LIVENESS_PROBE_CONTAINER]
        );
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let synth = DesiredStateSynthesizer::default();
        let a = serde_json::to_string(&synth.synthesize(&parent(), &spec()).unwrap().node).unwrap();
        let b = serde_json::to_string(&synth.synthesize(&parent(), &spec()).unwrap().node).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_input_template_is_not_mutated() {
        let synth = DesiredStateSynthesizer::default();
        let s = spec();
        let before = s.node_template.clone();
        synth.synthesize(&parent(), &s).unwrap();
        assert_eq!(s.node_template, before);
    }

    #[test]
    fn test_controller_deployment_sidecars() {
        let synth = DesiredStateSynthesizer::default();
        let mut s = spec();
        s.controller_template = Some(template(&["controller"]));
        let out = synth.synthesize(&parent(), &s).unwrap();

        let controller = out.controller.unwrap();
        assert_eq!(controller.replicas, Some(1));
        let pod = controller.template.spec.as_ref().unwrap();
        assert_eq!(
            container_names(pod),
            vec!["controller", PROVISIONER_CONTAINER, ATTACHER_CONTAINER]
        );
        assert!(pod.containers[1]
            .args
            .as_ref()
            .unwrap()
            .contains(&"--provisioner=csi.example.com".to_string()));
    }

    #[test]
    fn test_invalid_specs() {
        let synth = DesiredStateSynthesizer::default();

        let mut s = spec();
        s.driver_name = String::new();
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));

        let mut s = spec();
        s.driver_socket = String::new();
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));

        let mut s = spec();
        s.driver_socket = "csi.sock".into();
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));

        let mut s = spec();
        s.node_template = template(&[]);
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));

        // Only operator sidecars left means no driver container
        let mut s = spec();
        s.node_template = template(&[REGISTRAR_CONTAINER]);
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));

        let mut s = spec();
        s.controller_template = Some(template(&[]));
        assert_matches!(synth.synthesize(&parent(), &s), Err(Error::InvalidSpec { .. }));
    }

    #[test]
    fn test_node_selector_becomes_required_affinity() {
        let synth = DesiredStateSynthesizer::default();
        let mut s = spec();
        s.node_selector = Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: "storage".into(),
                    operator: "Exists".into(),
                    values: None,
                }]),
                match_fields: None,
            }],
        });
        let out = synth.synthesize(&parent(), &s).unwrap();
        let affinity = out.node.template.spec.unwrap().affinity.unwrap();
        assert_eq!(
            affinity
                .node_affinity
                .unwrap()
                .required_during_scheduling_ignored_during_execution,
            s.node_selector
        );
    }

    #[test]
    fn test_desired_children_carry_ownership() {
        use crate::crd::CsiDriverDeployment;
        let synth = DesiredStateSynthesizer::default();
        let mut driver = CsiDriverDeployment::new("example", spec());
        driver.metadata.namespace = Some("storage".into());
        let children = synth
            .desired_children(&ProvisionerResource::from(driver))
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].identity, DesiredStateSynthesizer::node_identity(&parent()));
        assert_eq!(children[0].labels, parent().owner_labels());
        assert!(children[0].last_applied().is_some());
    }
}
