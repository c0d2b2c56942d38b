// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the mount resource lifecycle
//!
//! These tests verify:
//! 1. Reference counting and garbage collection of shared mount pods
//! 2. Rebuild on configuration change keeps every reference
//! 3. Concurrent mounts of one volume converge on one pod
//! 4. Daemonset mounts, and the rollback plus shared-pod fallback when the
//!    daemonset cannot run on this node
//! 5. Distinct volumes converge on one shared pod or daemonset without a
//!    rebuild
//! 6. Process mounts through the selector

use juicefs_csi_core::application::{MountContext, MountManagers, MountSelector};
use juicefs_csi_core::domain::config::{DriverConfig, Timings};
use juicefs_csi_core::domain::mount_config::MountMode;
use juicefs_csi_core::domain::reference::{count_references, references_target};
use juicefs_csi_core::domain::resource::{
    daemon_set_name, label, mount_pod_name, secret_name, ResourceKind, LABEL_CONFIG_HASH, LABEL_UPGRADE_UUID,
};
use juicefs_csi_core::domain::setting::MountSetting;
use juicefs_csi_core::infrastructure::{InMemoryClusterStore, RecordingExecutor, RecordingMounter};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

const NODE: &str = "node-a";

struct Harness {
    store: Arc<InMemoryClusterStore>,
    mounter: Arc<RecordingMounter>,
    ctx: Arc<MountContext>,
    selector: MountSelector,
    _dir: tempfile::TempDir,
}

fn mark_ready(pod: &mut Pod) {
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

/// What the daemonset controller would schedule on this node.
fn replica_of(ds: &DaemonSet) -> Pod {
    let template = ds.spec.as_ref().map(|s| s.template.clone()).unwrap_or_default();
    let mut metadata = template.metadata.unwrap_or_default();
    metadata.name = Some(format!("{}-{NODE}", ds.metadata.name.as_deref().unwrap_or_default()));
    let mut spec = template.spec.unwrap_or_default();
    spec.node_name = Some(NODE.to_string());
    let mut pod = Pod {
        metadata,
        spec: Some(spec),
        ..Default::default()
    };
    mark_ready(&mut pod);
    pod
}

fn harness(by_process: bool, node_labels: BTreeMap<String, String>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DriverConfig {
        node_name: NODE.to_string(),
        by_process,
        mount_base_path: dir.path().join("mnt"),
        fd_base_path: dir.path().join("fd"),
        timings: Timings::fast(),
        ..Default::default()
    };

    let store = Arc::new(InMemoryClusterStore::new());
    store.nodes.insert(Node {
        metadata: ObjectMeta {
            name: Some(NODE.to_string()),
            labels: Some(node_labels),
            ..Default::default()
        },
        ..Default::default()
    });
    store.pods.set_create_hook(mark_ready);
    let replicas = store.clone();
    store.daemon_sets.set_create_hook(move |ds| replicas.pods.insert(replica_of(ds)));

    let mounter = Arc::new(RecordingMounter::new());
    let ctx = Arc::new(MountContext::new(
        Arc::new(config),
        store.clone(),
        Arc::new(RecordingExecutor::new()),
    ));
    let selector = MountSelector::new(ctx.clone(), MountManagers::standard(&ctx, mounter.clone()));
    Harness {
        store,
        mounter,
        ctx,
        selector,
        _dir: dir,
    }
}

fn setting(target: &str, mode: Option<MountMode>) -> MountSetting {
    volume_setting("pvc-1", target, mode)
}

/// A consumer of volume `pv` on filesystem "myfs".
fn volume_setting(pv: &str, target: &str, mode: Option<MountMode>) -> MountSetting {
    MountSetting {
        name: "myfs".into(),
        source: "redis://meta:6379/1".into(),
        volume_id: pv.into(),
        unique_id: pv.into(),
        target_path: target.into(),
        mount_mode: mode,
        ..Default::default()
    }
}

fn references(pod: &Pod) -> usize {
    count_references(pod.metadata.annotations.as_ref())
}

fn template_label(ds: &DaemonSet, key: &str) -> Option<String> {
    ds.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| label(m, key))
        .map(String::from)
}

#[tokio::test]
async fn test_shared_pod_is_collected_after_last_unmount() {
    let h = harness(false, BTreeMap::new());
    let a = setting("/var/lib/kubelet/pods/a/volumes/myfs", Some(MountMode::SharedPod));
    let b = setting("/var/lib/kubelet/pods/b/volumes/myfs", Some(MountMode::SharedPod));
    let name = mount_pod_name(NODE, "myfs");

    let first = h.selector.mount(&a).await.expect("mount a");
    let second = h.selector.mount(&b).await.expect("mount b");
    assert_eq!(first.kind, ResourceKind::Pod);
    assert_eq!(first.name, name);
    assert_eq!(second.name, name);
    assert_eq!(h.store.pods.names(), vec![name.clone()]);

    let pod = h.store.pods.snapshot(&name).expect("mount pod");
    assert_eq!(references(&pod), 2);
    let uuid = label(&pod.metadata, LABEL_UPGRADE_UUID).expect("uuid").to_string();
    assert!(h.ctx.broker.instance(&uuid).is_some(), "fd socket served for the pod");

    h.selector.unmount(&a.target_path).await.expect("unmount a");
    let pod = h.store.pods.snapshot(&name).expect("still referenced");
    assert_eq!(references(&pod), 1);
    assert!(references_target(pod.metadata.annotations.as_ref(), &b.target_path));

    h.selector.unmount(&b.target_path).await.expect("unmount b");
    assert!(h.store.pods.names().is_empty());
    assert!(!h.store.secrets.contains(&secret_name(&name)));
    assert!(h.ctx.broker.instance(&uuid).is_none());

    // nothing references the target any more
    h.selector.unmount(&b.target_path).await.expect("repeat unmount");
}

#[tokio::test]
async fn test_configuration_change_rebuilds_pod_with_references() {
    let h = harness(false, BTreeMap::new());
    let a = setting("/targets/a", Some(MountMode::PerPvc));
    h.selector.mount(&a).await.expect("mount a");
    let name = mount_pod_name(NODE, "pvc-1");
    let old = h.store.pods.snapshot(&name).expect("pod");
    let old_uuid = label(&old.metadata, LABEL_UPGRADE_UUID).expect("uuid").to_string();

    let mut b = setting("/targets/b", Some(MountMode::PerPvc));
    b.options = vec!["cache-size=2048".into()];
    h.selector.mount(&b).await.expect("mount b");

    let rebuilt = h.store.pods.snapshot(&name).expect("rebuilt pod");
    assert_eq!(label(&rebuilt.metadata, LABEL_CONFIG_HASH), Some(b.config_hash().as_str()));
    assert_ne!(label(&rebuilt.metadata, LABEL_UPGRADE_UUID), Some(old_uuid.as_str()));
    let annotations = rebuilt.metadata.annotations.as_ref();
    assert!(references_target(annotations, &a.target_path), "old reference carried over");
    assert!(references_target(annotations, &b.target_path));
    assert!(h.ctx.broker.instance(&old_uuid).is_none());
}

#[tokio::test]
async fn test_concurrent_mounts_share_one_pod() {
    let h = harness(false, BTreeMap::new());
    let settings: Vec<MountSetting> = (0..5)
        .map(|i| setting(&format!("/targets/{i}"), Some(MountMode::SharedPod)))
        .collect();

    let results = futures::future::join_all(settings.iter().map(|s| h.selector.mount(s))).await;
    assert!(results.iter().all(Result::is_ok));

    let name = mount_pod_name(NODE, "myfs");
    assert_eq!(h.store.pods.names(), vec![name.clone()]);
    assert_eq!(references(&h.store.pods.snapshot(&name).expect("pod")), 5);
}

#[tokio::test]
async fn test_mount_times_out_when_pod_never_ready() {
    let h = harness(false, BTreeMap::new());
    h.store.pods.set_create_hook(|_| {});
    let err = h
        .selector
        .mount(&setting("/targets/slow", Some(MountMode::PerPvc)))
        .await
        .expect_err("never ready");
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_daemonset_mount_and_release() {
    let h = harness(false, BTreeMap::new());
    let a = setting("/targets/a", Some(MountMode::DaemonSet));
    let b = setting("/targets/b", Some(MountMode::DaemonSet));
    let name = daemon_set_name("myfs");

    let mounted = h.selector.mount(&a).await.expect("mount a");
    assert_eq!(mounted.kind, ResourceKind::DaemonSet);
    assert_eq!(mounted.name, name);
    h.selector.mount(&b).await.expect("mount b");
    let ds = h.store.daemon_sets.snapshot(&name).expect("daemonset");
    assert_eq!(count_references(ds.metadata.annotations.as_ref()), 2);

    h.selector.unmount(&a.target_path).await.expect("unmount a");
    assert!(h.store.daemon_sets.contains(&name));
    h.selector.unmount(&b.target_path).await.expect("unmount b");
    assert!(!h.store.daemon_sets.contains(&name));
    assert!(!h.store.secrets.contains(&secret_name(&name)));
}

#[tokio::test]
async fn test_unschedulable_daemonset_falls_back_to_shared_pod() {
    let h = harness(false, BTreeMap::from([("disk".to_string(), "hdd".to_string())]));
    let entry = r#"
mountMode: daemonset
nodeAffinity:
  requiredDuringSchedulingIgnoredDuringExecution:
    nodeSelectorTerms:
      - matchExpressions:
          - key: disk
            operator: In
            values: ["ssd"]
"#;
    h.store.config_maps.insert(ConfigMap {
        metadata: ObjectMeta {
            name: Some(h.ctx.config.mount_config_map.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("default".to_string(), entry.to_string())])),
        ..Default::default()
    });

    let target = setting("/targets/a", None);
    let mounted = h.selector.mount(&target).await.expect("fallback mount");
    assert_eq!(mounted.kind, ResourceKind::Pod);
    assert_eq!(mounted.name, mount_pod_name(NODE, "myfs"));

    // the daemonset lost its only reference and is gone
    let ds_name = daemon_set_name("myfs");
    assert!(!h.store.daemon_sets.contains(&ds_name));
    assert!(!h.store.secrets.contains(&secret_name(&ds_name)));

    let owner = h.selector.owner_of(&target.target_path).await.expect("owner");
    assert_eq!(owner, Some((ResourceKind::Pod, mounted.name.clone())));
}

#[tokio::test]
async fn test_distinct_volumes_share_one_pod_without_rebuild() {
    let h = harness(false, BTreeMap::new());
    let a = volume_setting("pvc-1", "/targets/a", Some(MountMode::SharedPod));
    let b = volume_setting("pvc-2", "/targets/b", Some(MountMode::SharedPod));
    let name = mount_pod_name(NODE, "myfs");

    h.selector.mount(&a).await.expect("mount a");
    let before = h.store.pods.snapshot(&name).expect("pod");
    let uuid = label(&before.metadata, LABEL_UPGRADE_UUID).expect("uuid").to_string();
    let hash = label(&before.metadata, LABEL_CONFIG_HASH).expect("hash").to_string();

    let second = h.selector.mount(&b).await.expect("mount b");
    assert_eq!(second.name, name);
    assert_eq!(h.store.pods.names(), vec![name.clone()]);
    let after = h.store.pods.snapshot(&name).expect("pod");
    assert_eq!(label(&after.metadata, LABEL_UPGRADE_UUID), Some(uuid.as_str()), "pod was not rebuilt");
    assert_eq!(label(&after.metadata, LABEL_CONFIG_HASH), Some(hash.as_str()));
    assert_eq!(references(&after), 2);
    assert!(h.ctx.broker.instance(&uuid).is_some());
}

#[tokio::test]
async fn test_distinct_volumes_share_one_daemonset_without_roll() {
    let h = harness(false, BTreeMap::new());
    let a = volume_setting("pvc-1", "/targets/a", Some(MountMode::DaemonSet));
    let b = volume_setting("pvc-2", "/targets/b", Some(MountMode::DaemonSet));
    let name = daemon_set_name("myfs");

    h.selector.mount(&a).await.expect("mount a");
    let before = h.store.daemon_sets.snapshot(&name).expect("daemonset");
    let hash = template_label(&before, LABEL_CONFIG_HASH).expect("template hash");
    let uuid = template_label(&before, LABEL_UPGRADE_UUID).expect("template uuid");

    h.selector.mount(&b).await.expect("mount b");
    let after = h.store.daemon_sets.snapshot(&name).expect("daemonset");
    assert_eq!(template_label(&after, LABEL_CONFIG_HASH), Some(hash), "template was not rolled");
    assert_eq!(template_label(&after, LABEL_UPGRADE_UUID), Some(uuid));
    assert_eq!(count_references(after.metadata.annotations.as_ref()), 2);
}

#[tokio::test]
async fn test_daemonset_roll_drops_stale_annotations() {
    let h = harness(false, BTreeMap::new());
    let a = setting("/targets/a", Some(MountMode::DaemonSet));
    let name = daemon_set_name("myfs");
    h.selector.mount(&a).await.expect("mount a");
    h.store.daemon_sets.modify(&name, |ds| {
        ds.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("example.com/old-spec".to_string(), "stale".to_string());
    });

    let mut b = volume_setting("pvc-2", "/targets/b", Some(MountMode::DaemonSet));
    b.options = vec!["cache-size=2048".into()];
    let new_hash = b.shared_config_hash();
    // the controller's replica for the rolled template
    let mut replica = replica_of(&h.store.daemon_sets.snapshot(&name).expect("daemonset"));
    replica.metadata.name = Some(format!("{name}-{NODE}-rolled"));
    replica
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_CONFIG_HASH.to_string(), new_hash.clone());
    h.store.pods.insert(replica);

    h.selector.mount(&b).await.expect("mount b");
    let ds = h.store.daemon_sets.snapshot(&name).expect("daemonset");
    assert_eq!(label(&ds.metadata, LABEL_CONFIG_HASH), Some(new_hash.as_str()));
    let annotations = ds.metadata.annotations.as_ref();
    assert!(!annotations.is_some_and(|a| a.contains_key("example.com/old-spec")));
    assert!(references_target(annotations, &a.target_path), "old reference carried over");
    assert!(references_target(annotations, &b.target_path));
}

#[tokio::test]
async fn test_process_mounts_bypass_the_cluster() {
    let h = harness(true, BTreeMap::new());
    let target = setting("/targets/host", Some(MountMode::DaemonSet));
    let mounted = h.selector.mount(&target).await.expect("mount");
    assert_eq!(mounted.kind, ResourceKind::Process);
    assert_eq!(h.mounter.source_of("/targets/host").as_deref(), Some("redis://meta:6379/1"));
    assert!(h.store.pods.names().is_empty());

    h.selector.unmount("/targets/host").await.expect("unmount");
    assert!(h.mounter.source_of("/targets/host").is_none());
}
