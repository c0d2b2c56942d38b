// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! DaemonSet Mount Manager
//!
//! Hosts mounts in a node-wide daemonset keyed by the shared identity of the
//! volume. References live on the daemonset's annotations, exactly as they do
//! on mount pods, so a reference can move between the two kinds when the
//! selector falls back.
//!
//! Readiness is judged on this node only: a replica scheduled here, carrying
//! the current configuration hash, must be ready. A node the daemonset cannot
//! run on yields [`MountError::Scheduling`] after the reference is rolled
//! back.

use crate::application::mount_context::MountContext;
use crate::domain::cluster::ListSelector;
use crate::domain::mount::{MountError, MountManager};
use crate::domain::reference::{count_references, insert_reference, reference_annotations, remove_reference};
use crate::domain::resource::{
    annotation, daemon_set_name, is_being_deleted, is_pod_ready, label, MountedResource, ResourceKind,
    ANNOTATION_MOUNT_PATH, LABEL_CONFIG_HASH, LABEL_RESOURCE_TYPE, LABEL_UNIQUE_ID, LABEL_UPGRADE_UUID,
    RESOURCE_TYPE_MOUNT,
};
use crate::domain::scheduling::check_node_schedulable;
use crate::domain::setting::MountSetting;
use crate::domain::template::MountIdentity;
use crate::infrastructure::retry::{poll_until, retry_on_conflict, Backoff, WaitError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::NodeAffinity;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct DaemonSetMount {
    ctx: Arc<MountContext>,
}

/// Upgrade uuid stamped on the daemonset's pod template.
fn template_uuid(ds: &DaemonSet) -> Option<&str> {
    ds.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get(LABEL_UPGRADE_UUID))
        .map(String::as_str)
}

impl DaemonSetMount {
    pub fn new(ctx: Arc<MountContext>) -> Self {
        Self { ctx }
    }

    pub fn resource_name(&self, setting: &MountSetting) -> String {
        daemon_set_name(&setting.shared_identity())
    }

    fn mount_path_of(&self, name: &str) -> String {
        self.ctx.config.mount_base_path.join(name).to_string_lossy().into_owned()
    }

    fn identity(&self, name: &str, setting: &MountSetting, hash: &str) -> MountIdentity {
        MountIdentity {
            name: name.to_string(),
            unique_id: setting.shared_identity(),
            config_hash: hash.to_string(),
            upgrade_uuid: uuid::Uuid::new_v4().to_string(),
            mount_path: self.mount_path_of(name),
        }
    }

    async fn serve_fd(&self, ds: &DaemonSet) {
        let Some(uuid) = template_uuid(ds) else {
            return;
        };
        if let Err(e) = self.ctx.broker.ensure_serving(uuid).await {
            warn!(daemonset = ?ds.metadata.name, "failed to serve fuse fd: {}", e);
        }
    }

    /// Create the daemonset, attach to it, or roll its template forward.
    /// Caller holds the lock.
    async fn create_or_attach(
        &self,
        name: &str,
        setting: &MountSetting,
        node_affinity: Option<&NodeAffinity>,
    ) -> Result<DaemonSet, MountError> {
        let daemon_sets = self.ctx.store.daemon_sets();
        let timings = &self.ctx.config.timings;
        let hash = setting.shared_config_hash();
        let target = setting.target_path.as_str();
        let started = Instant::now();

        loop {
            let existing = match daemon_sets.get(name).await {
                Ok(ds) => Some(ds),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };

            let Some(ds) = existing else {
                let mut ds = self
                    .ctx
                    .templates
                    .daemon_set(&self.identity(name, setting, &hash), setting, node_affinity);
                insert_reference(ds.metadata.annotations.get_or_insert_with(BTreeMap::new), target);
                info!(daemonset = name, "creating mount daemonset");
                match daemon_sets.create(&ds).await {
                    Ok(created) => {
                        self.serve_fd(&created).await;
                        return Ok(created);
                    }
                    Err(e) if e.is_already_exists() => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            if is_being_deleted(&ds.metadata) {
                if started.elapsed() >= timings.delete_wait {
                    return Err(MountError::timeout("wait for mount daemonset deletion", name, started.elapsed()));
                }
                debug!(daemonset = name, "waiting for old mount daemonset to be deleted");
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => {
                        return Err(MountError::timeout("wait for mount daemonset deletion", name, started.elapsed()));
                    }
                    _ = tokio::time::sleep(timings.delete_poll) => {}
                }
                continue;
            }

            if label(&ds.metadata, LABEL_CONFIG_HASH) != Some(hash.as_str()) {
                let old_uuid = template_uuid(&ds).map(str::to_string);
                let updated = self.roll_template(name, setting, &hash, node_affinity).await?;
                if let Some(uuid) = old_uuid {
                    self.ctx.broker.stop(&uuid).await;
                }
                self.serve_fd(&updated).await;
                return Ok(updated);
            }

            self.add_reference_unlocked(target, name).await?;
            self.serve_fd(&ds).await;
            return Ok(ds);
        }
    }

    /// Replace the pod template with one built from `setting`. Annotations
    /// tied to the old template are dropped; references carry over and the
    /// caller's reference is added.
    async fn roll_template(
        &self,
        name: &str,
        setting: &MountSetting,
        hash: &str,
        node_affinity: Option<&NodeAffinity>,
    ) -> Result<DaemonSet, MountError> {
        let daemon_sets = self.ctx.store.daemon_sets();
        let fresh = self
            .ctx
            .templates
            .daemon_set(&self.identity(name, setting, hash), setting, node_affinity);
        let fresh = &fresh;
        let target = setting.target_path.as_str();
        info!(daemonset = name, "mount configuration changed, updating daemonset template");

        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut ds = daemon_sets.get(name).await?;
            if is_being_deleted(&ds.metadata) {
                return Err(MountError::ResourceDeleting(name.to_string()));
            }
            let labels = ds.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.extend(fresh.metadata.labels.clone().unwrap_or_default());
            let mut annotations = fresh.metadata.annotations.clone().unwrap_or_default();
            annotations.extend(reference_annotations(ds.metadata.annotations.as_ref()));
            insert_reference(&mut annotations, target);
            ds.metadata.annotations = Some(annotations);
            ds.spec = fresh.spec.clone();
            Ok(daemon_sets.update(&ds).await?)
        })
        .await
    }

    async fn add_reference_unlocked(&self, target: &str, name: &str) -> Result<(), MountError> {
        let daemon_sets = self.ctx.store.daemon_sets();
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut ds = daemon_sets.get(name).await?;
            if is_being_deleted(&ds.metadata) {
                return Err(MountError::ResourceDeleting(name.to_string()));
            }
            if !insert_reference(ds.metadata.annotations.get_or_insert_with(BTreeMap::new), target) {
                return Ok(());
            }
            daemon_sets.update(&ds).await?;
            debug!(daemonset = name, target, "reference added");
            Ok(())
        })
        .await
    }

    async fn remove_reference_unlocked(&self, target: &str, name: &str) -> Result<Option<DaemonSet>, MountError> {
        let daemon_sets = self.ctx.store.daemon_sets();
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut ds = match daemon_sets.get(name).await {
                Ok(ds) => ds,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(MountError::from(e)),
            };
            let removed = ds
                .metadata
                .annotations
                .as_mut()
                .map(|a| remove_reference(a, target))
                .unwrap_or(false);
            if !removed {
                return Ok(Some(ds));
            }
            Ok(Some(daemon_sets.update(&ds).await?))
        })
        .await
    }

    /// Whether the daemonset's affinity and tolerations admit this node.
    async fn check_schedulable(&self, ds: &DaemonSet) -> Result<Result<(), String>, MountError> {
        let node = self.ctx.store.nodes().get(self.ctx.node_name()).await?;
        let pod_spec = ds.spec.as_ref().and_then(|s| s.template.spec.as_ref());
        let affinity = pod_spec
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref());
        let tolerations = pod_spec
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or_default();
        Ok(check_node_schedulable(&node, affinity, tolerations))
    }

    /// Wait for a ready replica with the current hash on this node.
    async fn wait_local_replica(&self, identity: &str, hash: &str) -> Result<(), WaitError<MountError>> {
        let pods = self.ctx.store.pods();
        let timings = &self.ctx.config.timings;
        let selector = ListSelector::new()
            .label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT)
            .label(LABEL_UNIQUE_ID, identity)
            .on_node(self.ctx.node_name());
        let selector = &selector;
        poll_until(
            timings.daemonset_ready,
            timings.daemonset_ready_poll,
            &self.ctx.cancel,
            move || async move {
                let replicas = pods.list(selector).await.map_err(MountError::from)?;
                let ready = replicas.iter().any(|pod| {
                    !is_being_deleted(&pod.metadata)
                        && label(&pod.metadata, LABEL_CONFIG_HASH) == Some(hash)
                        && is_pod_ready(pod)
                });
                Ok(ready.then_some(()))
            },
        )
        .await
    }

    /// Undo the reference `mount` added so a fallback resource is the only
    /// owner of the target.
    async fn roll_back(&self, target: &str, name: &str) {
        if let Err(e) = self.unmount(target, name).await {
            warn!(daemonset = name, target, "failed to roll back daemonset reference: {}", e);
        }
    }
}

#[async_trait]
impl MountManager for DaemonSetMount {
    async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError> {
        if setting.target_path.is_empty() {
            return Err(MountError::InvalidSetting("target path is empty".to_string()));
        }
        let identity = setting.shared_identity();
        if identity.is_empty() {
            return Err(MountError::InvalidSetting("volume has no identity".to_string()));
        }
        let name = daemon_set_name(&identity);
        let resolved = self.ctx.resolve_mount_config(setting).await;
        let node = self.ctx.node_name().to_string();

        let ds = {
            let _guard = self.ctx.locks.lock(&name).await;
            self.ctx.ensure_secret(&name, setting).await?;
            self.create_or_attach(&name, setting, resolved.node_affinity.as_ref())
                .await?
        };

        if let Err(reason) = self.check_schedulable(&ds).await? {
            warn!(daemonset = %name, node = %node, "daemonset cannot run on this node: {}", reason);
            self.roll_back(&setting.target_path, &name).await;
            return Err(MountError::Scheduling {
                resource: name,
                node,
                reason,
            });
        }

        let hash = setting.shared_config_hash();
        match self.wait_local_replica(&identity, &hash).await {
            Ok(()) => {}
            Err(WaitError::TimedOut(elapsed)) if !self.ctx.cancel.is_cancelled() => {
                warn!(daemonset = %name, node = %node, "no ready replica on this node after {:?}", elapsed);
                self.roll_back(&setting.target_path, &name).await;
                return Err(MountError::Scheduling {
                    resource: name,
                    node,
                    reason: format!("no ready replica within {elapsed:?}"),
                });
            }
            Err(WaitError::TimedOut(elapsed)) => {
                return Err(MountError::timeout("wait for mount daemonset ready", name, elapsed));
            }
            Err(WaitError::Failed(e)) => return Err(e),
        }

        let mount_path = annotation(&ds.metadata, ANNOTATION_MOUNT_PATH)
            .map(str::to_string)
            .unwrap_or_else(|| self.mount_path_of(&name));
        info!(daemonset = %name, target = %setting.target_path, "mount daemonset ready on node");
        Ok(MountedResource {
            kind: ResourceKind::DaemonSet,
            name,
            mount_path,
        })
    }

    async fn unmount(&self, target: &str, resource: &str) -> Result<(), MountError> {
        let _guard = self.ctx.locks.lock(resource).await;
        let Some(ds) = self.remove_reference_unlocked(target, resource).await? else {
            debug!(daemonset = resource, "mount daemonset already gone");
            return Ok(());
        };
        let remaining = count_references(ds.metadata.annotations.as_ref());
        if remaining > 0 {
            info!(daemonset = resource, remaining, "mount daemonset still referenced");
            return Ok(());
        }

        info!(daemonset = resource, "mount daemonset has no references, deleting");
        match self.ctx.store.daemon_sets().delete(resource).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(uuid) = template_uuid(&ds) {
            self.ctx.broker.stop(uuid).await;
        }
        self.ctx.delete_secret(resource).await
    }

    async fn add_reference(&self, target: &str, resource: &str) -> Result<(), MountError> {
        let _guard = self.ctx.locks.lock(resource).await;
        self.add_reference_unlocked(target, resource).await
    }

    async fn reference_count(&self, resource: &str) -> Result<usize, MountError> {
        match self.ctx.store.daemon_sets().get(resource).await {
            Ok(ds) => Ok(count_references(ds.metadata.annotations.as_ref())),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError> {
        self.ctx.clean_cache(setting).await
    }
}
