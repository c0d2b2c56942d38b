// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Strategy Selector
//!
//! Picks the resource kind that hosts a volume's mount and dispatches to the
//! matching manager. A daemonset that cannot run on this node is retried
//! once through the shared-pod manager.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Entry point of the node agent's mount and unmount calls

use crate::application::daemonset_mount::DaemonSetMount;
use crate::application::mount_context::MountContext;
use crate::application::pod_mount::{PodKeying, PodMount};
use crate::application::process_mount::ProcessMount;
use crate::domain::cluster::ListSelector;
use crate::domain::mount::{HostMounter, MountError, MountManager};
use crate::domain::mount_config::MountMode;
use crate::domain::reference::references_target;
use crate::domain::resource::{MountedResource, ResourceKind, LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT};
use crate::domain::setting::MountSetting;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which manager handles a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStrategy {
    Process,
    PerVolumePod,
    SharedPod,
    DaemonSet,
}

impl fmt::Display for MountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStrategy::Process => write!(f, "process"),
            MountStrategy::PerVolumePod => write!(f, "per-pvc pod"),
            MountStrategy::SharedPod => write!(f, "shared pod"),
            MountStrategy::DaemonSet => write!(f, "daemonset"),
        }
    }
}

/// One manager per strategy.
pub struct MountManagers {
    pub process: Arc<dyn MountManager>,
    pub per_volume: Arc<dyn MountManager>,
    pub shared_pod: Arc<dyn MountManager>,
    pub daemon_set: Arc<dyn MountManager>,
}

impl MountManagers {
    pub fn standard(ctx: &Arc<MountContext>, mounter: Arc<dyn HostMounter>) -> Self {
        Self {
            process: Arc::new(ProcessMount::new(mounter)),
            per_volume: Arc::new(PodMount::new(ctx.clone(), PodKeying::PerVolume)),
            shared_pod: Arc::new(PodMount::new(ctx.clone(), PodKeying::Shared)),
            daemon_set: Arc::new(DaemonSetMount::new(ctx.clone())),
        }
    }
}

pub struct MountSelector {
    ctx: Arc<MountContext>,
    managers: MountManagers,
}

impl MountSelector {
    pub fn new(ctx: Arc<MountContext>, managers: MountManagers) -> Self {
        Self { ctx, managers }
    }

    pub fn manager(&self, strategy: MountStrategy) -> &dyn MountManager {
        match strategy {
            MountStrategy::Process => self.managers.process.as_ref(),
            MountStrategy::PerVolumePod => self.managers.per_volume.as_ref(),
            MountStrategy::SharedPod => self.managers.shared_pod.as_ref(),
            MountStrategy::DaemonSet => self.managers.daemon_set.as_ref(),
        }
    }

    pub async fn select(&self, setting: &MountSetting) -> MountStrategy {
        if self.ctx.config.by_process {
            return MountStrategy::Process;
        }
        let resolved = self.ctx.resolve_mount_config(setting).await;
        debug!(
            volume = %setting.unique_id,
            mode = %resolved.mode,
            source = ?resolved.source,
            "resolved mount mode"
        );
        match resolved.mode {
            MountMode::DaemonSet => MountStrategy::DaemonSet,
            MountMode::SharedPod => MountStrategy::SharedPod,
            MountMode::PerPvc => MountStrategy::PerVolumePod,
        }
    }

    pub async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError> {
        let strategy = self.select(setting).await;
        info!(volume = %setting.unique_id, target = %setting.target_path, strategy = %strategy, "mounting volume");
        match self.manager(strategy).mount(setting).await {
            Err(e) if strategy == MountStrategy::DaemonSet && e.is_scheduling() => {
                warn!(
                    volume = %setting.unique_id,
                    "daemonset cannot serve this node, falling back to shared pod: {}", e
                );
                self.manager(MountStrategy::SharedPod).mount(setting).await
            }
            result => result,
        }
    }

    /// Drop the reference of `target` from whichever resource holds it. A
    /// target nothing references is a no-op.
    pub async fn unmount(&self, target: &str) -> Result<(), MountError> {
        if self.ctx.config.by_process {
            return self.manager(MountStrategy::Process).unmount(target, target).await;
        }
        match self.owner_of(target).await? {
            Some((ResourceKind::DaemonSet, name)) => {
                self.manager(MountStrategy::DaemonSet).unmount(target, &name).await
            }
            Some((_, name)) => self.manager(MountStrategy::PerVolumePod).unmount(target, &name).await,
            None => {
                debug!(target, "no mount resource references target");
                Ok(())
            }
        }
    }

    /// Resource referencing `target`: mount pods on this node first, then
    /// daemonsets.
    pub async fn owner_of(&self, target: &str) -> Result<Option<(ResourceKind, String)>, MountError> {
        let selector = ListSelector::new().label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT);
        let local = selector.clone().on_node(self.ctx.node_name());

        let pods = self.ctx.store.pods().list(&local).await?;
        if let Some(pod) = pods
            .iter()
            .find(|p| references_target(p.metadata.annotations.as_ref(), target))
        {
            return Ok(Some((ResourceKind::Pod, pod.metadata.name.clone().unwrap_or_default())));
        }

        let daemon_sets = self.ctx.store.daemon_sets().list(&selector).await?;
        Ok(daemon_sets
            .iter()
            .find(|ds| references_target(ds.metadata.annotations.as_ref(), target))
            .map(|ds| (ResourceKind::DaemonSet, ds.metadata.name.clone().unwrap_or_default())))
    }

    pub async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError> {
        let strategy = self.select(setting).await;
        self.manager(strategy).clean_cache(setting).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::DriverConfig;
    use crate::infrastructure::memory_store::{InMemoryClusterStore, RecordingExecutor};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers with a fixed outcome.
    struct Scripted {
        calls: AtomicUsize,
        scheduling_error: bool,
    }

    impl Scripted {
        fn new(scheduling_error: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                scheduling_error,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MountManager for Scripted {
        async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.scheduling_error {
                return Err(MountError::Scheduling {
                    resource: "ds".into(),
                    node: "node-a".into(),
                    reason: "taint".into(),
                });
            }
            Ok(MountedResource {
                kind: ResourceKind::Pod,
                name: setting.target_path.clone(),
                mount_path: String::new(),
            })
        }

        async fn unmount(&self, _target: &str, _resource: &str) -> Result<(), MountError> {
            Ok(())
        }

        async fn add_reference(&self, _target: &str, _resource: &str) -> Result<(), MountError> {
            Ok(())
        }

        async fn reference_count(&self, _resource: &str) -> Result<usize, MountError> {
            Ok(0)
        }

        async fn clean_cache(&self, _setting: &MountSetting) -> Result<(), MountError> {
            Ok(())
        }
    }

    fn context(store: Arc<InMemoryClusterStore>, by_process: bool) -> Arc<MountContext> {
        let config = DriverConfig {
            node_name: "node-a".into(),
            by_process,
            ..Default::default()
        };
        Arc::new(MountContext::new(Arc::new(config), store, Arc::new(RecordingExecutor::new())))
    }

    fn mount_config(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("juicefs-mount-config".into()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn selector_with(ctx: Arc<MountContext>, daemon_set: Arc<Scripted>, shared: Arc<Scripted>) -> MountSelector {
        MountSelector::new(
            ctx,
            MountManagers {
                process: Scripted::new(false),
                per_volume: Scripted::new(false),
                shared_pod: shared,
                daemon_set,
            },
        )
    }

    #[tokio::test]
    async fn test_select_follows_configuration() {
        let store = Arc::new(InMemoryClusterStore::new());
        store
            .config_maps
            .insert(mount_config(&[("fast-sc", "mountMode: daemonset"), ("default", "mountMode: shared-pod")]));
        let selector = selector_with(context(store, false), Scripted::new(false), Scripted::new(false));

        let mut setting = MountSetting {
            storage_class: Some("fast-sc".into()),
            ..Default::default()
        };
        assert_eq!(selector.select(&setting).await, MountStrategy::DaemonSet);
        setting.storage_class = Some("other".into());
        assert_eq!(selector.select(&setting).await, MountStrategy::SharedPod);
        setting.mount_mode = Some(MountMode::PerPvc);
        assert_eq!(selector.select(&setting).await, MountStrategy::PerVolumePod);
    }

    #[tokio::test]
    async fn test_by_process_wins() {
        let store = Arc::new(InMemoryClusterStore::new());
        let selector = selector_with(context(store, true), Scripted::new(false), Scripted::new(false));
        let setting = MountSetting {
            mount_mode: Some(MountMode::DaemonSet),
            ..Default::default()
        };
        assert_eq!(selector.select(&setting).await, MountStrategy::Process);
    }

    #[tokio::test]
    async fn test_scheduling_error_falls_back_once() {
        let store = Arc::new(InMemoryClusterStore::new());
        let daemon_set = Scripted::new(true);
        let shared = Scripted::new(true);
        let selector = selector_with(context(store, false), daemon_set.clone(), shared.clone());
        let setting = MountSetting {
            mount_mode: Some(MountMode::DaemonSet),
            target_path: "/t".into(),
            ..Default::default()
        };

        // the fallback's own scheduling error is returned as-is
        let err = selector.mount(&setting).await.expect_err("both fail");
        assert!(err.is_scheduling());
        assert_eq!(daemon_set.calls(), 1);
        assert_eq!(shared.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_unmount_is_noop() {
        let store = Arc::new(InMemoryClusterStore::new());
        let selector = selector_with(context(store, false), Scripted::new(false), Scripted::new(false));
        selector.unmount("/nowhere").await.expect("noop");
        assert_eq!(selector.owner_of("/nowhere").await.expect("scan"), None);
    }
}
