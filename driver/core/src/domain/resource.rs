// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Resource Conventions
//!
//! Labels, annotations and naming rules shared by every mount resource kind,
//! plus predicates over pod objects (readiness, completion, deletion).

use crate::domain::setting::Edition;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LABEL_RESOURCE_TYPE: &str = "app.kubernetes.io/name";
pub const RESOURCE_TYPE_MOUNT: &str = "juicefs-mount";
pub const LABEL_UNIQUE_ID: &str = "volume-id";
pub const LABEL_CONFIG_HASH: &str = "juicefs-hash";
pub const LABEL_UPGRADE_UUID: &str = "juicefs-upgrade-uuid";

pub const ANNOTATION_MOUNT_PATH: &str = "juicefs.com/mount-path";
pub const ANNOTATION_UPGRADE_PROCESS: &str = "juicefs.com/upgrade-process";

pub const MOUNT_CONTAINER_NAME: &str = "jfs-mount";

const MAX_NAME_LEN: usize = 63;

/// The three resource kinds a mount can be hosted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Mounted in the calling process, no cluster object.
    Process,
    /// Dedicated or shared mount pod.
    Pod,
    /// Node-wide daemonset.
    DaemonSet,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Process => write!(f, "process"),
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::DaemonSet => write!(f, "daemonset"),
        }
    }
}

/// Where a successful mount ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub mount_path: String,
}

/// Lowercase, replace anything outside `[a-z0-9-]`, trim to 63 characters.
pub fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_matches('-').to_string()
}

pub fn mount_pod_name(node: &str, identity: &str) -> String {
    sanitize_name(&format!("juicefs-{node}-{identity}"))
}

pub fn daemon_set_name(identity: &str) -> String {
    // keep the suffix intact when the identity is long
    let suffix = "-mount-ds";
    let mut head = sanitize_name(&format!("juicefs-{identity}"));
    head.truncate(MAX_NAME_LEN - suffix.len());
    format!("{}{suffix}", head.trim_end_matches('-'))
}

pub fn secret_name(resource: &str) -> String {
    let suffix = "-secret";
    let mut head = resource.to_string();
    head.truncate(MAX_NAME_LEN - suffix.len());
    format!("{}{suffix}", head.trim_end_matches('-'))
}

pub fn canary_job_name(identity: &str, node: &str) -> String {
    sanitize_name(&format!("{identity}-{node}-canary"))
}

pub fn clean_cache_job_name(identity: &str) -> String {
    sanitize_name(&format!("juicefs-clean-cache-{identity}"))
}

pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn is_being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

fn condition_true(pod: &Pod, kind: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == kind && c.status == "True"))
        .unwrap_or(false)
}

/// Containers-ready and pod-ready conditions are both true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    condition_true(pod, "ContainersReady") && condition_true(pod, "Ready")
}

/// The pod has terminated (succeeded or failed), or every container exited.
pub fn is_pod_complete(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if matches!(status.phase.as_deref(), Some("Succeeded") | Some("Failed")) {
        return true;
    }
    match status.container_statuses.as_ref() {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|cs| {
            cs.state
                .as_ref()
                .map(|s| s.terminated.is_some())
                .unwrap_or(false)
        }),
        _ => false,
    }
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

pub fn has_mount_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().any(|c| c.name == MOUNT_CONTAINER_NAME))
        .unwrap_or(false)
}

/// A pre-stop hook that unmounts would tear the mount down while a
/// replacement takes it over.
pub fn has_umount_pre_stop(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == MOUNT_CONTAINER_NAME))
        .and_then(|c| c.lifecycle.as_ref())
        .and_then(|l| l.pre_stop.as_ref())
        .and_then(|h| h.exec.as_ref())
        .and_then(|e| e.command.as_ref())
        .map(|cmd| cmd.iter().any(|part| part.contains("umount")))
        .unwrap_or(false)
}

/// Command line of the mount container, joined.
pub fn mount_container_command(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == MOUNT_CONTAINER_NAME))
        .map(|c| {
            c.command
                .iter()
                .flatten()
                .chain(c.args.iter().flatten())
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

pub fn mount_container_image(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == MOUNT_CONTAINER_NAME))
        .and_then(|c| c.image.clone())
}

/// Community mount commands read the metadata URL from the `metaurl`
/// variable; enterprise ones take a volume name.
pub fn pod_edition(pod: &Pod) -> Edition {
    if mount_container_command(pod).contains("metaurl") {
        Edition::Community
    } else {
        Edition::Enterprise
    }
}

/// Name of the workload that owns this mount pod, for lock keying: the
/// daemonset when the pod is a daemon replica, the pod itself otherwise.
pub fn owning_resource_name(pod: &Pod) -> String {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.kind == "DaemonSet")
        .map(|o| o.name.clone())
        .unwrap_or_else(|| pod.metadata.name.clone().unwrap_or_default())
}

/// `Some(true)` once a job completed, `Some(false)` once it failed, `None`
/// while it is still running.
pub fn job_outcome(job: &Job) -> Option<bool> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .filter(|c| c.status == "True")
        .find_map(|c| match c.type_.as_str() {
            "Complete" => Some(true),
            "Failed" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with_conditions(conds: &[(&str, &str)]) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(
                    conds
                        .iter()
                        .map(|(t, s)| PodCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_ready_requires_both_conditions() {
        assert!(is_pod_ready(&pod_with_conditions(&[("ContainersReady", "True"), ("Ready", "True")])));
        assert!(!is_pod_ready(&pod_with_conditions(&[("ContainersReady", "True"), ("Ready", "False")])));
        assert!(!is_pod_ready(&pod_with_conditions(&[("Ready", "True")])));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test]
    fn test_names() {
        assert_eq!(mount_pod_name("Node_A", "pvc-1"), "juicefs-node-a-pvc-1");
        assert_eq!(daemon_set_name("myfs"), "juicefs-myfs-mount-ds");
        assert_eq!(secret_name("juicefs-node-a-pvc-1"), "juicefs-node-a-pvc-1-secret");
        assert_eq!(canary_job_name("pvc-1", "node-a"), "pvc-1-node-a-canary");

        let long = "x".repeat(100);
        assert!(mount_pod_name("n", &long).len() <= 63);
        let ds = daemon_set_name(&long);
        assert!(ds.len() <= 63);
        assert!(ds.ends_with("-mount-ds"));
        assert!(secret_name(&mount_pod_name("n", &long)).ends_with("-secret"));
    }

    #[test]
    fn test_pod_complete() {
        let mut pod = Pod::default();
        assert!(!is_pod_complete(&pod));
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        assert!(is_pod_complete(&pod));
    }
}
