// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process Mount Manager
//!
//! Mounts directly on the host from the node agent. No cluster object backs
//! the mount, so the target path is its own resource and there is exactly
//! one referent.

use crate::domain::mount::{HostMounter, MountError, MountManager};
use crate::domain::resource::{MountedResource, ResourceKind};
use crate::domain::setting::{Edition, MountSetting};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FS_TYPE: &str = "juicefs";

pub struct ProcessMount {
    mounter: Arc<dyn HostMounter>,
}

impl ProcessMount {
    pub fn new(mounter: Arc<dyn HostMounter>) -> Self {
        Self { mounter }
    }

    fn source_of(setting: &MountSetting) -> &str {
        match setting.edition {
            Edition::Community => &setting.source,
            Edition::Enterprise => &setting.name,
        }
    }
}

#[async_trait]
impl MountManager for ProcessMount {
    async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError> {
        let target = setting.target_path.as_str();
        if target.is_empty() {
            return Err(MountError::InvalidSetting("target path is empty".to_string()));
        }
        if self.mounter.is_mounted(target).await? {
            debug!(target, "already mounted on host");
        } else {
            self.mounter
                .mount(Self::source_of(setting), target, FS_TYPE, &setting.options)
                .await?;
        }
        Ok(MountedResource {
            kind: ResourceKind::Process,
            name: target.to_string(),
            mount_path: target.to_string(),
        })
    }

    async fn unmount(&self, target: &str, _resource: &str) -> Result<(), MountError> {
        if !self.mounter.is_mounted(target).await? {
            debug!(target, "not mounted on host");
            return Ok(());
        }
        self.mounter.unmount(target).await
    }

    async fn add_reference(&self, _target: &str, _resource: &str) -> Result<(), MountError> {
        Ok(())
    }

    async fn reference_count(&self, resource: &str) -> Result<usize, MountError> {
        Ok(usize::from(self.mounter.is_mounted(resource).await?))
    }

    async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError> {
        let identity = if setting.unique_id.is_empty() {
            &setting.name
        } else {
            &setting.unique_id
        };
        for dir in &setting.cache_dirs {
            let path = Path::new(dir).join(identity);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => info!(path = %path.display(), "cache removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), "failed to remove cache: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
