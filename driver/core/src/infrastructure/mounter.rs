// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host mounters for the by-process mode.

use crate::domain::mount::{HostMounter, MountError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Shells out to `mount(8)` and `umount(8)`.
#[derive(Debug, Default)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[String]) -> Result<(), MountError> {
        debug!(program, ?args, "running host mount command");
        let output = Command::new(program).args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(MountError::HostMount(format!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Mount points listed in `/proc/self/mountinfo` content.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = &str> {
    // fifth field is the mount point
    mountinfo.lines().filter_map(|line| line.split_whitespace().nth(4))
}

#[async_trait]
impl HostMounter for SystemMounter {
    async fn mount(&self, source: &str, target: &str, fs_type: &str, options: &[String]) -> Result<(), MountError> {
        tokio::fs::create_dir_all(target).await?;
        let mut args = vec!["-t".to_string(), fs_type.to_string()];
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(source.to_string());
        args.push(target.to_string());
        Self::run("mount", &args).await?;
        info!(target, "mounted on host");
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        Self::run("umount", &[target.to_string()]).await?;
        info!(target, "unmounted on host");
        Ok(())
    }

    async fn is_mounted(&self, target: &str) -> Result<bool, MountError> {
        let mountinfo = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
        let target = Path::new(target);
        let mounted = mount_points(&mountinfo).any(|mp| Path::new(mp) == target);
        Ok(mounted)
    }
}

/// Records mounts without touching the host. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    mounts: Mutex<HashMap<String, String>>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_of(&self, target: &str) -> Option<String> {
        self.mounts.lock().get(target).cloned()
    }
}

#[async_trait]
impl HostMounter for RecordingMounter {
    async fn mount(&self, source: &str, target: &str, _fs_type: &str, _options: &[String]) -> Result<(), MountError> {
        self.mounts.lock().insert(target.to_string(), source.to_string());
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        self.mounts.lock().remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &str) -> Result<bool, MountError> {
        Ok(self.mounts.lock().contains_key(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_points_from_mountinfo() {
        let info = "36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw\n\
                    37 35 0:45 / /var/lib/juicefs/volume/pvc-1 rw - fuse.juicefs JuiceFS:myfs rw\n";
        let points: Vec<&str> = mount_points(info).collect();
        assert_eq!(points, vec!["/mnt/parent", "/var/lib/juicefs/volume/pvc-1"]);
    }

    #[tokio::test]
    async fn test_recording_mounter() {
        let mounter = RecordingMounter::new();
        mounter.mount("redis://meta", "/mnt/a", "juicefs", &[]).await.expect("mount");
        assert!(mounter.is_mounted("/mnt/a").await.expect("check"));
        assert_eq!(mounter.source_of("/mnt/a").as_deref(), Some("redis://meta"));
        mounter.unmount("/mnt/a").await.expect("unmount");
        assert!(!mounter.is_mounted("/mnt/a").await.expect("check"));
    }
}
