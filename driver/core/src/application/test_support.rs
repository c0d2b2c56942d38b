// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fixtures shared by the application unit tests.

use crate::application::mount_context::MountContext;
use crate::domain::config::{DriverConfig, Timings};
use crate::domain::template::{MountIdentity, MountTemplates};
use crate::domain::setting::MountSetting;
use crate::infrastructure::memory_store::{InMemoryClusterStore, RecordingExecutor};
use crate::infrastructure::templates::DefaultMountTemplates;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{Node, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::path::Path;
use std::sync::Arc;

pub const NODE: &str = "node-a";

pub fn config(dir: &Path) -> DriverConfig {
    DriverConfig {
        node_name: NODE.to_string(),
        mount_base_path: dir.join("mnt"),
        fd_base_path: dir.join("fd"),
        upgrade_socket: dir.join("upgrade.sock"),
        timings: Timings::fast(),
        ..Default::default()
    }
}

pub struct Fixture {
    pub store: Arc<InMemoryClusterStore>,
    pub executor: Arc<RecordingExecutor>,
    pub ctx: Arc<MountContext>,
}

pub fn fixture(config: DriverConfig) -> Fixture {
    let store = Arc::new(InMemoryClusterStore::new());
    let executor = Arc::new(RecordingExecutor::new());
    store.nodes.insert(Node {
        metadata: ObjectMeta {
            name: Some(config.node_name.clone()),
            ..Default::default()
        },
        ..Default::default()
    });
    let ctx = Arc::new(MountContext::new(Arc::new(config), store.clone(), executor.clone()));
    Fixture { store, executor, ctx }
}

pub fn mark_ready(pod: &mut Pod) {
    let condition = |kind: &str| PodCondition {
        type_: kind.to_string(),
        status: "True".to_string(),
        ..Default::default()
    };
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![condition("ContainersReady"), condition("Ready")]),
        ..Default::default()
    });
}

pub fn mark_complete(job: &mut Job) {
    job.status = Some(JobStatus {
        conditions: Some(vec![JobCondition {
            type_: "Complete".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

/// A ready community mount pod on this node.
pub fn ready_mount_pod(config: &DriverConfig, name: &str, uuid: &str, mount_path: &Path) -> Pod {
    let identity = MountIdentity {
        name: name.to_string(),
        unique_id: "pv-1".to_string(),
        config_hash: "hash-1".to_string(),
        upgrade_uuid: uuid.to_string(),
        mount_path: mount_path.to_string_lossy().into_owned(),
    };
    let setting = MountSetting {
        name: "myfs".to_string(),
        source: "redis://meta".to_string(),
        ..Default::default()
    };
    let mut pod = DefaultMountTemplates::new(config).mount_pod(&identity, &setting, &config.node_name);
    mark_ready(&mut pod);
    pod
}
