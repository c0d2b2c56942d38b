// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pod Mount Manager
//!
//! Hosts mounts in a mount pod on this node. A pod is keyed either by the
//! volume's unique id (one pod per volume) or by its shared identity (many
//! volumes converge on one pod). Consumers are tracked as reference
//! annotations on the pod; the pod and its secret are deleted when the last
//! reference goes.
//!
//! All mutations of one pod name run under the named lock of that name.

use crate::application::mount_context::MountContext;
use crate::domain::mount::{MountError, MountManager};
use crate::domain::reference::{count_references, insert_reference, reference_annotations, remove_reference};
use crate::domain::resource::{
    annotation, is_being_deleted, is_pod_ready, label, mount_pod_name, MountedResource, ResourceKind,
    ANNOTATION_MOUNT_PATH, LABEL_CONFIG_HASH, LABEL_UPGRADE_UUID,
};
use crate::domain::setting::MountSetting;
use crate::domain::template::MountIdentity;
use crate::infrastructure::retry::{poll_until, retry_on_conflict, Backoff, WaitError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a pod name is derived from a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodKeying {
    /// One pod per volume, keyed by unique id.
    PerVolume,
    /// One pod per shared identity.
    Shared,
}

pub struct PodMount {
    ctx: Arc<MountContext>,
    keying: PodKeying,
}

impl PodMount {
    pub fn new(ctx: Arc<MountContext>, keying: PodKeying) -> Self {
        Self { ctx, keying }
    }

    pub fn keying(&self) -> PodKeying {
        self.keying
    }

    pub fn identity_of(&self, setting: &MountSetting) -> String {
        match self.keying {
            PodKeying::PerVolume => setting.unique_id.clone(),
            PodKeying::Shared => setting.shared_identity(),
        }
    }

    /// Configuration hash every consumer of the pod agrees on.
    pub fn hash_of(&self, setting: &MountSetting) -> String {
        match self.keying {
            PodKeying::PerVolume => setting.config_hash(),
            PodKeying::Shared => setting.shared_config_hash(),
        }
    }

    pub fn resource_name(&self, setting: &MountSetting) -> String {
        mount_pod_name(self.ctx.node_name(), &self.identity_of(setting))
    }

    fn mount_path_of(&self, name: &str) -> String {
        self.ctx.config.mount_base_path.join(name).to_string_lossy().into_owned()
    }

    /// Create the pod, attach to it, or rebuild it. Caller holds the lock.
    async fn create_or_attach(&self, name: &str, setting: &MountSetting) -> Result<Pod, MountError> {
        let pods = self.ctx.store.pods();
        let timings = &self.ctx.config.timings;
        let hash = self.hash_of(setting);
        let started = Instant::now();
        let mut carried = BTreeMap::new();

        loop {
            let existing = match pods.get(name).await {
                Ok(pod) => Some(pod),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };

            let Some(pod) = existing else {
                match self.create_pod(name, setting, &hash, &carried).await {
                    Ok(pod) => return Ok(pod),
                    Err(MountError::Cluster(e)) if e.is_already_exists() => continue,
                    Err(e) => return Err(e),
                }
            };

            if is_being_deleted(&pod.metadata) {
                if started.elapsed() >= timings.delete_wait {
                    return Err(MountError::timeout("wait for mount pod deletion", name, started.elapsed()));
                }
                debug!(pod = name, "waiting for old mount pod to be deleted");
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => {
                        return Err(MountError::timeout("wait for mount pod deletion", name, started.elapsed()));
                    }
                    _ = tokio::time::sleep(timings.delete_poll) => {}
                }
                continue;
            }

            if label(&pod.metadata, LABEL_CONFIG_HASH) != Some(hash.as_str()) {
                let refs = reference_annotations(pod.metadata.annotations.as_ref());
                info!(
                    pod = name,
                    references = refs.len(),
                    "mount configuration changed, rebuilding mount pod"
                );
                carried.extend(refs);
                if let Some(uuid) = label(&pod.metadata, LABEL_UPGRADE_UUID) {
                    self.ctx.broker.stop(uuid).await;
                }
                match pods.delete(name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            self.add_reference_unlocked(&setting.target_path, name).await?;
            return Ok(pod);
        }
    }

    async fn create_pod(
        &self,
        name: &str,
        setting: &MountSetting,
        hash: &str,
        carried: &BTreeMap<String, String>,
    ) -> Result<Pod, MountError> {
        let identity = MountIdentity {
            name: name.to_string(),
            unique_id: self.identity_of(setting),
            config_hash: hash.to_string(),
            upgrade_uuid: uuid::Uuid::new_v4().to_string(),
            mount_path: self.mount_path_of(name),
        };
        let mut pod = self.ctx.templates.mount_pod(&identity, setting, self.ctx.node_name());
        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.extend(carried.iter().map(|(k, v)| (k.clone(), v.clone())));
        insert_reference(annotations, &setting.target_path);

        if let Err(e) = self.ctx.broker.ensure_serving(&identity.upgrade_uuid).await {
            warn!(pod = name, "failed to serve fuse fd: {}", e);
        }

        info!(pod = name, carried = carried.len(), "creating mount pod");
        match self.ctx.store.pods().create(&pod).await {
            Ok(created) => Ok(created),
            Err(e) => {
                self.ctx.broker.stop(&identity.upgrade_uuid).await;
                Err(e.into())
            }
        }
    }

    async fn add_reference_unlocked(&self, target: &str, name: &str) -> Result<(), MountError> {
        let pods = self.ctx.store.pods();
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut pod = pods.get(name).await?;
            if is_being_deleted(&pod.metadata) {
                return Err(MountError::ResourceDeleting(name.to_string()));
            }
            let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            if !insert_reference(annotations, target) {
                debug!(pod = name, target, "reference already present");
                return Ok(());
            }
            pods.update(&pod).await?;
            debug!(pod = name, target, "reference added");
            Ok(())
        })
        .await
    }

    /// Remove the reference and return the references left, `None` when the
    /// pod is gone.
    async fn remove_reference_unlocked(&self, target: &str, name: &str) -> Result<Option<Pod>, MountError> {
        let pods = self.ctx.store.pods();
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut pod = match pods.get(name).await {
                Ok(pod) => pod,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(MountError::from(e)),
            };
            let removed = pod
                .metadata
                .annotations
                .as_mut()
                .map(|a| remove_reference(a, target))
                .unwrap_or(false);
            if !removed {
                return Ok(Some(pod));
            }
            let updated = pods.update(&pod).await?;
            Ok(Some(updated))
        })
        .await
    }

    async fn wait_ready(&self, name: &str) -> Result<(), MountError> {
        let pods = self.ctx.store.pods();
        let timings = &self.ctx.config.timings;
        let result = poll_until(timings.pod_ready, timings.pod_ready_poll, &self.ctx.cancel, move || async move {
            match pods.get(name).await {
                Ok(pod) if is_pod_ready(&pod) => Ok(Some(())),
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(WaitError::TimedOut(elapsed)) => Err(MountError::timeout("wait for mount pod ready", name, elapsed)),
            Err(WaitError::Failed(e)) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MountManager for PodMount {
    async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError> {
        if setting.target_path.is_empty() {
            return Err(MountError::InvalidSetting("target path is empty".to_string()));
        }
        if self.identity_of(setting).is_empty() {
            return Err(MountError::InvalidSetting("volume has no identity".to_string()));
        }
        let name = self.resource_name(setting);

        let pod = {
            let _guard = self.ctx.locks.lock(&name).await;
            self.ctx.ensure_secret(&name, setting).await?;
            self.create_or_attach(&name, setting).await?
        };

        if let Err(e) = self.wait_ready(&name).await {
            if let Some(uuid) = label(&pod.metadata, LABEL_UPGRADE_UUID) {
                // a hung mount process must not keep the descriptor
                self.ctx.broker.close_fd(uuid);
            }
            return Err(e);
        }

        let mount_path = annotation(&pod.metadata, ANNOTATION_MOUNT_PATH)
            .map(str::to_string)
            .unwrap_or_else(|| self.mount_path_of(&name));
        info!(pod = %name, target = %setting.target_path, "mount pod ready");
        Ok(MountedResource {
            kind: ResourceKind::Pod,
            name,
            mount_path,
        })
    }

    async fn unmount(&self, target: &str, resource: &str) -> Result<(), MountError> {
        let _guard = self.ctx.locks.lock(resource).await;
        let Some(pod) = self.remove_reference_unlocked(target, resource).await? else {
            debug!(pod = resource, "mount pod already gone");
            return Ok(());
        };
        let remaining = count_references(pod.metadata.annotations.as_ref());
        if remaining > 0 {
            info!(pod = resource, remaining, "mount pod still referenced");
            return Ok(());
        }

        info!(pod = resource, "mount pod has no references, deleting");
        match self.ctx.store.pods().delete(resource).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(uuid) = label(&pod.metadata, LABEL_UPGRADE_UUID) {
            self.ctx.broker.stop(uuid).await;
        }
        self.ctx.delete_secret(resource).await
    }

    async fn add_reference(&self, target: &str, resource: &str) -> Result<(), MountError> {
        let _guard = self.ctx.locks.lock(resource).await;
        self.add_reference_unlocked(target, resource).await
    }

    async fn reference_count(&self, resource: &str) -> Result<usize, MountError> {
        match self.ctx.store.pods().get(resource).await {
            Ok(pod) => Ok(count_references(pod.metadata.annotations.as_ref())),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError> {
        self.ctx.clean_cache(setting).await
    }
}
