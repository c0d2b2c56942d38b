// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Default workload templates for mount pods, daemonsets, secrets and jobs.

use crate::domain::config::DriverConfig;
use crate::domain::resource::{
    mount_container_image, pod_edition, secret_name, ANNOTATION_MOUNT_PATH, LABEL_CONFIG_HASH, LABEL_RESOURCE_TYPE, LABEL_UNIQUE_ID,
    LABEL_UPGRADE_UUID, MOUNT_CONTAINER_NAME, RESOURCE_TYPE_MOUNT,
};
use crate::domain::setting::{Edition, MountSetting};
use crate::domain::template::{MountIdentity, MountTemplates};
use crate::domain::upgrade::UpgradeAction;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvFromSource, EnvVar, ExecAction, HostPathVolumeSource,
    NodeAffinity, Pod, PodSpec, PodTemplateSpec, Probe, Secret, SecretEnvSource, SecurityContext, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const COMMUNITY_BINARY: &str = "/usr/local/bin/juicefs";
pub const ENTERPRISE_BINARY: &str = "/usr/bin/juicefs";
pub const ENTERPRISE_MOUNT_HELPER: &str = "/usr/local/juicefs/mount/jfsmount";
pub const VERSION_MARKER: &str = "juicefs.version";

pub struct DefaultMountTemplates {
    namespace: String,
    mount_image: String,
    cache_clean_image: String,
    mount_base_path: PathBuf,
    fd_base_path: PathBuf,
    pod_fd_path: PathBuf,
}

impl DefaultMountTemplates {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            mount_image: config.mount_image.clone(),
            cache_clean_image: config.cache_clean_image.clone(),
            mount_base_path: config.mount_base_path.clone(),
            fd_base_path: config.fd_base_path.clone(),
            pod_fd_path: config.pod_fd_path.clone(),
        }
    }

    fn meta(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn identity_labels(identity: &MountIdentity) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_RESOURCE_TYPE.to_string(), RESOURCE_TYPE_MOUNT.to_string()),
            (LABEL_UNIQUE_ID.to_string(), identity.unique_id.clone()),
            (LABEL_CONFIG_HASH.to_string(), identity.config_hash.clone()),
        ])
    }

    fn mount_command(setting: &MountSetting, mount_path: &str) -> String {
        let options = if setting.options.is_empty() {
            String::new()
        } else {
            format!(" -o {}", setting.options.join(","))
        };
        match setting.edition {
            Edition::Community => format!(
                "exec {COMMUNITY_BINARY} mount ${{metaurl}} {mount_path}{options}"
            ),
            Edition::Enterprise => format!("exec /sbin/mount.juicefs {} {mount_path}{options}", setting.name),
        }
    }

    fn host_path(name: &str, path: impl Into<String>, type_: &str) -> Volume {
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.into(),
                type_: Some(type_.to_string()),
            }),
            ..Default::default()
        }
    }

    fn fd_dir(&self, upgrade_uuid: &str) -> String {
        self.fd_base_path.join(upgrade_uuid).to_string_lossy().into_owned()
    }

    fn mount_pod_spec(&self, identity: &MountIdentity, setting: &MountSetting) -> PodSpec {
        let mount_path = identity.mount_path.as_str();
        let image = if setting.image.is_empty() {
            self.mount_image.clone()
        } else {
            setting.image.clone()
        };
        let env: Vec<EnvVar> = setting
            .envs
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let mut volumes = vec![Self::host_path(
            "jfs-dir",
            self.mount_base_path.to_string_lossy(),
            "DirectoryOrCreate",
        )];
        let mut mounts = vec![VolumeMount {
            name: "jfs-dir".to_string(),
            mount_path: self.mount_base_path.to_string_lossy().into_owned(),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        }];
        if !identity.upgrade_uuid.is_empty() {
            volumes.push(Self::host_path("jfs-fd", self.fd_dir(&identity.upgrade_uuid), "DirectoryOrCreate"));
            mounts.push(VolumeMount {
                name: "jfs-fd".to_string(),
                mount_path: self.pod_fd_path.to_string_lossy().into_owned(),
                ..Default::default()
            });
        }
        for (i, dir) in setting.cache_dirs.iter().enumerate() {
            let name = format!("cachedir-{i}");
            volumes.push(Self::host_path(&name, dir.clone(), "DirectoryOrCreate"));
            mounts.push(VolumeMount {
                name,
                mount_path: dir.clone(),
                ..Default::default()
            });
        }

        PodSpec {
            containers: vec![Container {
                name: MOUNT_CONTAINER_NAME.to_string(),
                image: Some(image),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    Self::mount_command(setting, mount_path),
                ]),
                env: Some(env),
                env_from: Some(vec![EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: secret_name(&identity.name),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                readiness_probe: Some(Probe {
                    exec: Some(ExecAction {
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            format!("[ \"$(stat -c %i {mount_path})\" = \"1\" ]"),
                        ]),
                    }),
                    period_seconds: Some(1),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Always".to_string()),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }
}

impl MountTemplates for DefaultMountTemplates {
    fn mount_pod(&self, identity: &MountIdentity, setting: &MountSetting, node: &str) -> Pod {
        let mut labels = Self::identity_labels(identity);
        if !identity.upgrade_uuid.is_empty() {
            labels.insert(LABEL_UPGRADE_UUID.to_string(), identity.upgrade_uuid.clone());
        }
        let mut meta = self.meta(&identity.name, labels);
        meta.annotations = Some(BTreeMap::from([(
            ANNOTATION_MOUNT_PATH.to_string(),
            identity.mount_path.clone(),
        )]));
        let mut spec = self.mount_pod_spec(identity, setting);
        spec.node_name = Some(node.to_string());
        Pod {
            metadata: meta,
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn daemon_set(
        &self,
        identity: &MountIdentity,
        setting: &MountSetting,
        node_affinity: Option<&NodeAffinity>,
    ) -> DaemonSet {
        let mut labels = Self::identity_labels(identity);
        if !identity.upgrade_uuid.is_empty() {
            // replicas on every node share one uuid; each node serves its own fd directory
            labels.insert(LABEL_UPGRADE_UUID.to_string(), identity.upgrade_uuid.clone());
        }
        let selector = BTreeMap::from([
            (LABEL_RESOURCE_TYPE.to_string(), RESOURCE_TYPE_MOUNT.to_string()),
            (LABEL_UNIQUE_ID.to_string(), identity.unique_id.clone()),
        ]);
        let mut meta = self.meta(&identity.name, labels.clone());
        meta.annotations = Some(BTreeMap::from([(
            ANNOTATION_MOUNT_PATH.to_string(),
            identity.mount_path.clone(),
        )]));
        let mut spec = self.mount_pod_spec(identity, setting);
        spec.affinity = node_affinity.map(|a| Affinity {
            node_affinity: Some(a.clone()),
            ..Default::default()
        });
        DaemonSet {
            metadata: meta,
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(BTreeMap::from([(
                            ANNOTATION_MOUNT_PATH.to_string(),
                            identity.mount_path.clone(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn secret(&self, name: &str, setting: &MountSetting) -> Secret {
        let mut data = setting.secrets.clone();
        if setting.edition == Edition::Community {
            data.insert("metaurl".to_string(), setting.source.clone());
        }
        Secret {
            metadata: self.meta(
                name,
                BTreeMap::from([(LABEL_RESOURCE_TYPE.to_string(), RESOURCE_TYPE_MOUNT.to_string())]),
            ),
            string_data: Some(data),
            ..Default::default()
        }
    }

    fn canary_job(&self, name: &str, target: &Pod, node: &str, upgrade_uuid: &str, action: UpgradeAction) -> Job {
        let fd = self.pod_fd_path.to_string_lossy().into_owned();
        let edition = pod_edition(target);
        let binary = match edition {
            Edition::Community => COMMUNITY_BINARY,
            Edition::Enterprise => ENTERPRISE_BINARY,
        };
        let mut script = format!("{binary} version > {fd}/{VERSION_MARKER}");
        if action == UpgradeAction::InPlace {
            script.push_str(&format!(" && cp {binary} {fd}/juicefs"));
            if edition == Edition::Enterprise {
                script.push_str(&format!(" && cp {ENTERPRISE_MOUNT_HELPER} {fd}/jfsmount"));
            }
        }
        let image = mount_container_image(target).unwrap_or_else(|| self.mount_image.clone());

        Job {
            metadata: self.meta(
                name,
                BTreeMap::from([(LABEL_RESOURCE_TYPE.to_string(), "juicefs-canary".to_string())]),
            ),
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(300),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        node_name: Some(node.to_string()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "jfs-canary".to_string(),
                            image: Some(image),
                            command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "jfs-fd".to_string(),
                                mount_path: fd,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Self::host_path("jfs-fd", self.fd_dir(upgrade_uuid), "DirectoryOrCreate")]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn clean_cache_job(&self, name: &str, setting: &MountSetting, node: &str) -> Job {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        let mut targets = Vec::new();
        for (i, dir) in setting.cache_dirs.iter().enumerate() {
            let volume = format!("cachedir-{i}");
            let in_pod = format!("/var/jfsCache-{i}");
            volumes.push(Self::host_path(&volume, dir.clone(), "Directory"));
            mounts.push(VolumeMount {
                name: volume,
                mount_path: in_pod.clone(),
                ..Default::default()
            });
            targets.push(format!("{in_pod}/{}/raw", setting.name));
        }

        Job {
            metadata: self.meta(
                name,
                BTreeMap::from([(LABEL_RESOURCE_TYPE.to_string(), "juicefs-clean-cache".to_string())]),
            ),
            spec: Some(JobSpec {
                backoff_limit: Some(1),
                ttl_seconds_after_finished: Some(300),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        node_name: Some(node.to_string()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "jfs-clean-cache".to_string(),
                            image: Some(self.cache_clean_image.clone()),
                            command: Some(vec![
                                "sh".to_string(),
                                "-c".to_string(),
                                format!("rm -rf {}", targets.join(" ")),
                            ]),
                            volume_mounts: Some(mounts),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
