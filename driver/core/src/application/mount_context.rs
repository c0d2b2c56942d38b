// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Context
//!
//! Collaborators shared by the mount managers, the selector and the upgrade
//! coordinators, plus the helpers several of them need:
//! - secret create-or-update and delete
//! - mount-mode resolution against the cluster ConfigMap
//! - job completion waits (canary and cache-clean jobs)

use crate::domain::cluster::{ClusterError, ClusterStore, ContainerExecutor};
use crate::domain::config::DriverConfig;
use crate::domain::mount::MountError;
use crate::domain::mount_config::{resolve_mount_config, ResolvedMountConfig};
use crate::domain::resource::job_outcome;
use crate::domain::setting::MountSetting;
use crate::domain::template::MountTemplates;
use crate::infrastructure::named_lock::NamedLocks;
use crate::infrastructure::templates::DefaultMountTemplates;
use crate::infrastructure::passfd::FdBroker;
use crate::infrastructure::retry::{poll_until, retry_on_conflict, Backoff, WaitError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MountContext {
    pub config: Arc<DriverConfig>,
    pub store: Arc<dyn ClusterStore>,
    pub executor: Arc<dyn ContainerExecutor>,
    pub templates: Arc<dyn MountTemplates>,
    /// Serializes every mutation of one mount resource, upgrades included.
    pub locks: Arc<NamedLocks>,
    pub broker: Arc<FdBroker>,
    pub cancel: CancellationToken,
}

/// How a job wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWait {
    Completed,
    Failed,
    TimedOut,
}

impl MountContext {
    /// Context with the default templates, a fresh lock table and broker.
    pub fn new(config: Arc<DriverConfig>, store: Arc<dyn ClusterStore>, executor: Arc<dyn ContainerExecutor>) -> Self {
        Self {
            templates: Arc::new(DefaultMountTemplates::new(&config)),
            locks: Arc::new(NamedLocks::new()),
            broker: Arc::new(FdBroker::from_config(&config)),
            cancel: CancellationToken::new(),
            config,
            store,
            executor,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Create the resource's secret, or bring an existing one up to date.
    pub async fn ensure_secret(&self, resource: &str, setting: &MountSetting) -> Result<(), MountError> {
        let secret = self
            .templates
            .secret(&crate::domain::resource::secret_name(resource), setting);
        let store = self.store.as_ref();
        let secret = &secret;
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let name = secret.metadata.name.as_deref().unwrap_or_default();
            match store.secrets().get(name).await {
                Ok(existing) => {
                    if existing.string_data == secret.string_data && existing.data == secret.data {
                        return Ok(());
                    }
                    let mut updated = secret.clone();
                    updated.metadata.resource_version = existing.metadata.resource_version;
                    store.secrets().update(&updated).await?;
                    debug!(secret = name, "secret updated");
                    Ok(())
                }
                Err(e) if e.is_not_found() => match store.secrets().create(secret).await {
                    Ok(_) => Ok(()),
                    // lost a race with another writer: re-read and compare
                    Err(e) if e.is_already_exists() => Err(ClusterError::Conflict(name.to_string())),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }

    /// Delete the resource's secret; an absent secret is fine.
    pub async fn delete_secret(&self, resource: &str) -> Result<(), MountError> {
        let name = crate::domain::resource::secret_name(resource);
        match self.store.secrets().delete(&name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(secret = %name, "secret already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the mount mode of a volume against the mount-config ConfigMap.
    /// A missing or unreadable ConfigMap counts as absent.
    pub async fn resolve_mount_config(&self, setting: &MountSetting) -> ResolvedMountConfig {
        let config_map = match self.store.config_maps().get(&self.config.mount_config_map).await {
            Ok(cm) => Some(cm),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(configmap = %self.config.mount_config_map, "failed to read mount config: {}", e);
                None
            }
        };
        resolve_mount_config(
            setting.mount_mode,
            setting.storage_class.as_deref(),
            config_map.as_ref().and_then(|cm| cm.data.as_ref()),
            self.config.mount_mode,
        )
    }

    /// Poll a job until it completes or fails, for at most `bound`.
    pub async fn wait_for_job(&self, name: &str, bound: Duration, interval: Duration) -> Result<JobWait, ClusterError> {
        let store = self.store.as_ref();
        let result = poll_until(bound, interval, &self.cancel, move || async move {
            match store.jobs().get(name).await {
                Ok(job) => Ok(job_outcome(&job)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;
        match result {
            Ok(true) => Ok(JobWait::Completed),
            Ok(false) => Ok(JobWait::Failed),
            Err(WaitError::TimedOut(_)) => Ok(JobWait::TimedOut),
            Err(WaitError::Failed(e)) => Err(e),
        }
    }

    pub async fn delete_job(&self, name: &str) {
        match self.store.jobs().delete(name).await {
            Ok(()) => debug!(job = name, "job deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(job = name, "failed to delete job: {}", e),
        }
    }

    /// Run the cache-clean job for a volume's cache directories on this node.
    pub async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError> {
        if setting.cache_dirs.is_empty() {
            return Ok(());
        }
        let identity = if setting.unique_id.is_empty() {
            setting.name.as_str()
        } else {
            setting.unique_id.as_str()
        };
        let name = crate::domain::resource::clean_cache_job_name(identity);
        let job = self.templates.clean_cache_job(&name, setting, self.node_name());
        match self.store.jobs().create(&job).await {
            Ok(_) => info!(job = %name, "cache clean job created"),
            Err(e) if e.is_already_exists() => debug!(job = %name, "cache clean job already running"),
            Err(e) => return Err(e.into()),
        }

        let timings = &self.config.timings;
        let started = tokio::time::Instant::now();
        match self.wait_for_job(&name, timings.canary, timings.canary_poll).await? {
            JobWait::Completed => {
                info!(job = %name, "cache cleaned");
                Ok(())
            }
            JobWait::Failed => {
                warn!(job = %name, "cache clean job failed");
                Ok(())
            }
            JobWait::TimedOut => {
                self.delete_job(&name).await;
                Err(MountError::timeout("clean cache", name, started.elapsed()))
            }
        }
    }
}
