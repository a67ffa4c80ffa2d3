//! Reduced single-workload synthesis
//!
//! EFS, Manila and CephFS provisioners each get one provisioner Deployment and
//! a StorageClass, the snapshot controller gets one Deployment, and a local
//! storage provider gets a DaemonSet plus one StorageClass per device group.

use crate::controller::selector;
use crate::controller::synthesizer::{invalid, label_template, workload_selector};
use crate::crd::{
    CephFsProvisionerSpec, EfsProvisionerSpec, LocalStorageProviderSpec, ManilaProvisionerSpec,
    SnapshotControllerSpec,
};
use crate::domain::ports::{
    DesiredObject, ObjectBody, ObjectIdentity, ObjectKind, ParentKey, StorageClassBody,
};
use crate::error::Result;
use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, EnvVarSource, HostPathVolumeSource, PodSecurityContext,
    PodSpec, PodTemplateSpec, SecretEnvSource, SecretKeySelector, SecretReference,
    SecurityContext, Volume, VolumeMount,
};
use std::collections::BTreeMap;

/// Provisioner names the StorageClasses point at
pub const EFS_PROVISIONER: &str = "openshift.io/aws-efs";
pub const MANILA_PROVISIONER: &str = "manila-provisioner";
pub const CEPHFS_PROVISIONER: &str = "ceph.com/cephfs";
pub const LOCAL_NO_PROVISIONER: &str = "kubernetes.io/no-provisioner";

/// Default images of the single-workload provisioners
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerImages {
    pub efs: String,
    pub manila: String,
    pub cephfs: String,
    pub snapshot_controller: String,
    pub snapshot_provisioner: String,
    pub local_provisioner: String,
}

impl Default for ProvisionerImages {
    fn default() -> Self {
        Self {
            efs: "quay.io/external_storage/efs-provisioner:latest".to_string(),
            manila: "quay.io/external_storage/manila-provisioner:latest".to_string(),
            cephfs: "quay.io/external_storage/cephfs-provisioner:latest".to_string(),
            snapshot_controller: "quay.io/external_storage/snapshot-controller:latest".to_string(),
            snapshot_provisioner: "quay.io/external_storage/snapshot-provisioner:latest"
                .to_string(),
            local_provisioner: "quay.io/external_storage/local-volume-provisioner:v2.1.0"
                .to_string(),
        }
    }
}

// =============================================================================
// EFS
// =============================================================================

pub fn efs_children(
    parent: &ParentKey,
    spec: &EfsProvisionerSpec,
    images: &ProvisionerImages,
) -> Result<Vec<DesiredObject>> {
    require(parent, &spec.storage_class_name, "storageClassName")?;
    require(parent, &spec.fsid, "fsid")?;

    let mut env = vec![
        env_value("FILE_SYSTEM_ID", &spec.fsid),
        env_value("PROVISIONER_NAME", EFS_PROVISIONER),
    ];
    if let Some(base_path) = &spec.base_path {
        env.push(env_value("BASE_PATH", base_path));
    }

    let mut container = Container {
        name: "efs-provisioner".to_string(),
        image: Some(pick_image(spec.provisioner_image.as_deref(), &images.efs)),
        env: Some(env),
        ..Default::default()
    };
    if let Some(secret) = &spec.aws_secrets {
        container.env_from = Some(vec![secret_env(secret)]);
    }

    let mut pod = PodSpec {
        containers: vec![container],
        ..Default::default()
    };
    if spec.supplemental_group != 0 {
        pod.security_context = Some(PodSecurityContext {
            supplemental_groups: Some(vec![spec.supplemental_group]),
            ..Default::default()
        });
    }

    Ok(vec![
        deployment(parent, pod)?,
        storage_class(
            parent,
            &spec.storage_class_name,
            StorageClassBody {
                provisioner: EFS_PROVISIONER.to_string(),
                ..Default::default()
            },
        )?,
    ])
}

// =============================================================================
// Manila
// =============================================================================

pub fn manila_children(
    parent: &ParentKey,
    spec: &ManilaProvisionerSpec,
    images: &ProvisionerImages,
) -> Result<Vec<DesiredObject>> {
    require(parent, &spec.storage_class_name, "storageClassName")?;
    let secret_name = secret_name(parent, &spec.open_stack_secrets, "openStackSecrets")?;
    let secret_namespace = secret_namespace(parent, &spec.open_stack_secrets);

    let pod = PodSpec {
        containers: vec![Container {
            name: "manila-provisioner".to_string(),
            image: Some(pick_image(spec.provisioner_image.as_deref(), &images.manila)),
            args: Some(vec![format!("--provisioner={}", MANILA_PROVISIONER)]),
            env_from: Some(vec![secret_env(&spec.open_stack_secrets)]),
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(vec![
        deployment(parent, pod)?,
        storage_class(
            parent,
            &spec.storage_class_name,
            StorageClassBody {
                provisioner: MANILA_PROVISIONER.to_string(),
                parameters: BTreeMap::from([
                    ("osSecretName".to_string(), secret_name),
                    ("osSecretNamespace".to_string(), secret_namespace),
                ]),
                ..Default::default()
            },
        )?,
    ])
}

// =============================================================================
// CephFS
// =============================================================================

pub fn cephfs_children(
    parent: &ParentKey,
    spec: &CephFsProvisionerSpec,
    images: &ProvisionerImages,
) -> Result<Vec<DesiredObject>> {
    require(parent, &spec.storage_class_name, "storageClassName")?;
    if spec.monitors.iter().all(|m| m.trim().is_empty()) {
        return Err(invalid(parent, "monitors must list at least one Ceph monitor"));
    }
    let secret_name = secret_name(parent, &spec.ceph_fs_secrets, "cephFSSecrets")?;
    let secret_namespace = secret_namespace(parent, &spec.ceph_fs_secrets);

    let image = pick_image(spec.operator.image_pull_spec.as_deref(), &images.cephfs);
    let mut args = vec![
        format!("-provisioner={}", CEPHFS_PROVISIONER),
        "-disable-ceph-namespace-isolation=false".to_string(),
        // Deterministic names are always on
        "-deterministic-names=true".to_string(),
    ];
    if !spec.enable_quota {
        args.push("-enable-quota=false".to_string());
    }
    if let Some(ns) = &spec.created_secrets_namespace {
        args.push(format!("-secret-namespace={}", ns));
    }

    let pod = PodSpec {
        containers: vec![Container {
            name: "cephfs-provisioner".to_string(),
            image: Some(image),
            args: Some(args),
            env: Some(vec![
                env_secret_key("CEPH_ADMIN_ID", &secret_name, "username"),
                env_secret_key("CEPH_ADMIN_SECRET", &secret_name, "password"),
            ]),
            ..Default::default()
        }],
        ..Default::default()
    };

    let mut parameters = BTreeMap::from([
        ("monitors".to_string(), spec.monitors.join(",")),
        ("adminId".to_string(), "admin".to_string()),
        ("adminSecretName".to_string(), secret_name),
        ("adminSecretNamespace".to_string(), secret_namespace),
    ]);
    if let Some(cluster) = &spec.cluster_name {
        parameters.insert("cluster".to_string(), cluster.clone());
    }
    if let Some(base_path) = &spec.base_path {
        parameters.insert("claimRoot".to_string(), base_path.clone());
    }

    Ok(vec![
        deployment(parent, pod)?,
        storage_class(
            parent,
            &spec.storage_class_name,
            StorageClassBody {
                provisioner: CEPHFS_PROVISIONER.to_string(),
                parameters,
                ..Default::default()
            },
        )?,
    ])
}

// =============================================================================
// Snapshot Controller
// =============================================================================

pub fn snapshot_children(
    parent: &ParentKey,
    spec: &SnapshotControllerSpec,
    images: &ProvisionerImages,
) -> Result<Vec<DesiredObject>> {
    let controller_image =
        pick_image(spec.operator.image_pull_spec.as_deref(), &images.snapshot_controller);
    let pod = PodSpec {
        containers: vec![
            Container {
                name: "snapshot-controller".to_string(),
                image: Some(controller_image),
                ..Default::default()
            },
            Container {
                name: "snapshot-provisioner".to_string(),
                image: Some(images.snapshot_provisioner.clone()),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    Ok(vec![deployment(parent, pod)?])
}

// =============================================================================
// Local Storage
// =============================================================================

pub fn local_storage_children(
    parent: &ParentKey,
    spec: &LocalStorageProviderSpec,
    images: &ProvisionerImages,
) -> Result<Vec<DesiredObject>> {
    if spec.storage_class_devices.is_empty() {
        return Err(invalid(parent, "storageClassDevices must not be empty"));
    }
    for group in &spec.storage_class_devices {
        require(parent, &group.storage_class_name, "storageClassDevices[].storageClassName")?;
        if group.device_names.is_empty() && group.device_stable_names.is_empty() {
            return Err(invalid(
                parent,
                format!(
                    "storage class {} needs deviceNames or deviceStableNames",
                    group.storage_class_name
                ),
            ));
        }
    }

    let device_map = serde_json::to_string(&spec.storage_class_devices)?;
    let workload = parent.child_name("provisioner");
    let mut template = PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "local-provisioner".to_string(),
                image: Some(pick_image(
                    spec.operator.image_pull_spec.as_deref(),
                    &images.local_provisioner,
                )),
                env: Some(vec![
                    env_value("STORAGE_CLASS_DEVICES", &device_map),
                    EnvVar {
                        name: "MY_NODE_NAME".to_string(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                                field_path: "spec.nodeName".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "dev".to_string(),
                    mount_path: "/dev".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "dev".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/dev".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]),
            affinity: selector::node_affinity(spec.node_selector.as_ref()),
            ..Default::default()
        }),
    };
    label_template(&mut template, &workload);

    let daemon_set = DaemonSetSpec {
        selector: workload_selector(&workload),
        template,
        ..Default::default()
    };

    let mut children = vec![DesiredObject::owned(
        parent,
        ObjectIdentity::new(ObjectKind::DaemonSet, &parent.namespace, workload),
        ObjectBody::DaemonSet(daemon_set),
    )?];
    for group in &spec.storage_class_devices {
        children.push(storage_class(
            parent,
            &group.storage_class_name,
            StorageClassBody {
                provisioner: LOCAL_NO_PROVISIONER.to_string(),
                volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
                ..Default::default()
            },
        )?);
    }
    Ok(children)
}

// =============================================================================
// Helpers
// =============================================================================

fn require(parent: &ParentKey, value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(parent, format!("{} must not be empty", field)));
    }
    Ok(())
}

fn pick_image(override_image: Option<&str>, default: &str) -> String {
    override_image
        .filter(|i| !i.trim().is_empty())
        .unwrap_or(default)
        .to_string()
}

fn secret_name(parent: &ParentKey, secret: &SecretReference, field: &str) -> Result<String> {
    secret
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| invalid(parent, format!("{}.name must not be empty", field)))
}

fn secret_namespace(parent: &ParentKey, secret: &SecretReference) -> String {
    secret
        .namespace
        .clone()
        .unwrap_or_else(|| parent.namespace.clone())
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_secret_key(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(secret: &SecretReference) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: secret.name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment(parent: &ParentKey, pod: PodSpec) -> Result<DesiredObject> {
    let workload = parent.child_name("provisioner");
    let mut template = PodTemplateSpec {
        metadata: None,
        spec: Some(pod),
    };
    label_template(&mut template, &workload);

    DesiredObject::owned(
        parent,
        ObjectIdentity::new(ObjectKind::Deployment, &parent.namespace, workload.clone()),
        ObjectBody::Deployment(DeploymentSpec {
            replicas: Some(1),
            selector: workload_selector(&workload),
            // Two provisioners must never run against the same backend
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template,
            ..Default::default()
        }),
    )
}

fn storage_class(parent: &ParentKey, name: &str, body: StorageClassBody) -> Result<DesiredObject> {
    DesiredObject::owned(
        parent,
        ObjectIdentity::cluster_scoped(ObjectKind::StorageClass, name),
        ObjectBody::StorageClass(body),
    )
}
