// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Graceful Upgrade Coordinator
//!
//! Upgrades one running mount instance without dropping its FUSE connection.
//!
//! ```text
//! PrepareCanary -> ValidateVersion -> FdHandoff    -> SignalReload -> WaitForReplacement   (recreate)
//!                                  -> BinaryUpload -> SignalReload                        (in place)
//! ```
//!
//! Each step is one handler returning the next step or the final message.
//! Steps carry their own bounded retries; any error aborts the rest. The
//! whole sequence runs under the named lock of the resource owning the pod,
//! so a mount or unmount of that resource never interleaves with it.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Single-instance upgrade for the control socket and the
//!   batch coordinator

use crate::application::mount_context::{JobWait, MountContext};
use crate::domain::cluster::ListSelector;
use crate::domain::resource::{
    annotation, canary_job_name, has_mount_container, has_umount_pre_stop, is_being_deleted, is_pod_complete,
    is_pod_ready, label, owning_resource_name, pod_edition, pod_node_name, ANNOTATION_MOUNT_PATH,
    ANNOTATION_UPGRADE_PROCESS, LABEL_CONFIG_HASH, LABEL_RESOURCE_TYPE, LABEL_UNIQUE_ID, LABEL_UPGRADE_UUID,
    MOUNT_CONTAINER_NAME, RESOURCE_TYPE_MOUNT,
};
use crate::domain::setting::Edition;
use crate::domain::upgrade::{MountProcessConf, UpgradeAction, UpgradeError, POD_FAIL, POD_START, POD_SUCCESS};
use crate::domain::version::{Version, VersionPolicy};
use crate::infrastructure::passfd::FdBroker;
use crate::infrastructure::progress::ProgressReporter;
use crate::infrastructure::retry::{poll_until, retry_on_conflict, Backoff, WaitError};
use crate::infrastructure::templates::{COMMUNITY_BINARY, ENTERPRISE_BINARY, ENTERPRISE_MOUNT_HELPER, VERSION_MARKER};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upgrades one instance; the batch coordinator fans out over it.
#[async_trait]
pub trait InstanceUpgrader: Send + Sync {
    /// Why `pod` cannot be upgraded with `action`, if it cannot.
    fn can_upgrade(&self, pod: &Pod, action: UpgradeAction) -> Result<(), String>;

    /// Upgrade the named mount pod, publishing progress. Publishes exactly
    /// one `POD-SUCCESS` or `POD-FAIL` line and returns the success message.
    async fn upgrade(&self, name: &str, action: UpgradeAction, progress: &ProgressReporter)
        -> Result<String, UpgradeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStep {
    PrepareCanary,
    ValidateVersion,
    FdHandoff,
    BinaryUpload,
    SignalReload,
    WaitForReplacement,
}

/// Transition chosen by a step handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Next(UpgradeStep),
    Finished(String),
}

/// State of one upgrade in flight.
struct UpgradeRun<'a> {
    pod: Pod,
    name: String,
    action: UpgradeAction,
    edition: Edition,
    uuid: String,
    unique_id: String,
    hash: String,
    process: MountProcessConf,
    /// The in-progress annotation was set by this run.
    annotated: bool,
    progress: &'a ProgressReporter,
}

impl<'a> UpgradeRun<'a> {
    fn new(pod: Pod, action: UpgradeAction, progress: &'a ProgressReporter) -> Self {
        let meta = &pod.metadata;
        Self {
            name: meta.name.clone().unwrap_or_default(),
            edition: pod_edition(&pod),
            uuid: label(meta, LABEL_UPGRADE_UUID).unwrap_or_default().to_string(),
            unique_id: label(meta, LABEL_UNIQUE_ID).unwrap_or_default().to_string(),
            hash: label(meta, LABEL_CONFIG_HASH).unwrap_or_default().to_string(),
            process: MountProcessConf::default(),
            annotated: false,
            action,
            progress,
            pod,
        }
    }

    fn say(&self, message: impl Into<String>) {
        self.progress.publish(message);
    }
}

pub struct GracefulUpgrade {
    ctx: Arc<MountContext>,
    policy: Arc<dyn VersionPolicy>,
}

impl GracefulUpgrade {
    pub fn new(ctx: Arc<MountContext>, policy: Arc<dyn VersionPolicy>) -> Self {
        Self { ctx, policy }
    }

    /// Coordinator using the compatibility table of the driver configuration.
    pub fn from_context(ctx: Arc<MountContext>) -> Self {
        let policy = Arc::new(ctx.config.compatibility.clone());
        Self::new(ctx, policy)
    }

    async fn run(&self, name: &str, action: UpgradeAction, progress: &ProgressReporter) -> Result<String, UpgradeError> {
        let pods = self.ctx.store.pods();
        let pod = match pods.get(name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                return Err(UpgradeError::Rejected(format!("mount pod {name} not found")));
            }
            Err(e) => return Err(e.into()),
        };
        self.can_upgrade(&pod, action).map_err(UpgradeError::Rejected)?;

        let _guard = self.ctx.locks.lock(&owning_resource_name(&pod)).await;
        // another upgrade may have started while this one waited for the lock
        let pod = pods.get(name).await?;
        self.can_upgrade(&pod, action).map_err(UpgradeError::Rejected)?;

        let mut run = UpgradeRun::new(pod, action, progress);
        let bound = self.ctx.config.timings.single_upgrade;
        let result = match tokio::time::timeout(bound, self.drive(&mut run)).await {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::timeout("upgrade", name)),
        };
        if result.is_err() && run.annotated {
            self.clear_upgrade_annotation(name).await;
        }
        result
    }

    async fn drive(&self, run: &mut UpgradeRun<'_>) -> Result<String, UpgradeError> {
        let mut step = UpgradeStep::PrepareCanary;
        loop {
            debug!(pod = %run.name, ?step, "upgrade step");
            let outcome = match step {
                UpgradeStep::PrepareCanary => self.prepare_canary(run).await?,
                UpgradeStep::ValidateVersion => self.validate_version(run).await?,
                UpgradeStep::FdHandoff => self.fd_handoff(run).await?,
                UpgradeStep::BinaryUpload => self.binary_upload(run).await?,
                UpgradeStep::SignalReload => self.signal_reload(run).await?,
                UpgradeStep::WaitForReplacement => self.wait_for_replacement(run).await?,
            };
            match outcome {
                StepOutcome::Next(next) => step = next,
                StepOutcome::Finished(message) => return Ok(message),
            }
        }
    }

    /// Read the live process configuration and run the canary job.
    async fn prepare_canary(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        let timings = &self.ctx.config.timings;
        let mount_path = annotation(&run.pod.metadata, ANNOTATION_MOUNT_PATH)
            .ok_or_else(|| UpgradeError::Rejected(format!("mount pod {} has no mount path", run.name)))?;
        let config_path = Path::new(mount_path).join(".config");
        let raw = tokio::time::timeout(timings.config_read, tokio::fs::read(&config_path))
            .await
            .map_err(|_| UpgradeError::timeout(format!("read {}", config_path.display()), &run.name))??;
        run.process = serde_json::from_slice(&raw).map_err(|e| {
            UpgradeError::Rejected(format!("invalid mount config {}: {}", config_path.display(), e))
        })?;
        if run.process.pid <= 0 {
            return Err(UpgradeError::Rejected(format!(
                "mount config of {} has no process id",
                run.name
            )));
        }

        let node = self.ctx.node_name();
        let job_name = canary_job_name(&run.unique_id, node);
        let job = self
            .ctx
            .templates
            .canary_job(&job_name, &run.pod, node, &run.uuid, run.action);
        match self.ctx.store.jobs().create(&job).await {
            Ok(_) => debug!(job = %job_name, "canary job created"),
            Err(e) if e.is_already_exists() => debug!(job = %job_name, "canary job already exists"),
            Err(e) => return Err(e.into()),
        }

        let waited = self
            .ctx
            .wait_for_job(&job_name, timings.canary, timings.canary_poll)
            .await?;
        self.ctx.delete_job(&job_name).await;
        match waited {
            JobWait::Completed => {}
            JobWait::Failed => {
                return Err(UpgradeError::Rejected(format!("canary job {job_name} failed")));
            }
            JobWait::TimedOut => return Err(UpgradeError::timeout("wait for canary job", job_name)),
        }
        run.say(format!("canary job of mount pod {} completed", run.name));
        Ok(StepOutcome::Next(UpgradeStep::ValidateVersion))
    }

    async fn validate_version(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        let marker = self.ctx.broker.instance_dir(&run.uuid).join(VERSION_MARKER);
        let text = tokio::fs::read_to_string(&marker).await.map_err(|e| {
            UpgradeError::Rejected(format!("canary left no version at {}: {}", marker.display(), e))
        })?;
        let version = Version::find_in(&text)
            .ok_or_else(|| UpgradeError::Incompatible(format!("cannot read a version from '{}'", text.trim())))?;
        self.policy
            .check(run.edition, version, run.action)
            .map_err(UpgradeError::Incompatible)?;

        run.say(format!(
            "mount pod {}: {} {} supports {} upgrade",
            run.name, run.edition, version, run.action
        ));
        let next = match run.action {
            UpgradeAction::Recreate => UpgradeStep::FdHandoff,
            UpgradeAction::InPlace => UpgradeStep::BinaryUpload,
        };
        Ok(StepOutcome::Next(next))
    }

    /// Make the broker the only holder of the FUSE fd.
    async fn fd_handoff(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        self.set_upgrade_annotation(&run.name).await?;
        run.annotated = true;

        let broker = &self.ctx.broker;
        if run.edition == Edition::Community {
            broker.update_sid(&run.uuid, run.process.sid());
            debug!(pod = %run.name, sid = run.process.sid(), "session id recorded");
        }

        let timings = &self.ctx.config.timings;
        let socket = broker.legacy_socket(&run.uuid);
        run.say("close fuse fd in mount pod");
        for attempt in 1..=timings.fd_handoff_attempts {
            match FdBroker::pull_fd(&socket, true, timings.fd_exchange).await {
                Ok(pulled) => {
                    info!(pod = %run.name, offered = pulled.offered, "FUSE fd released by mount process");
                    return Ok(StepOutcome::Next(UpgradeStep::SignalReload));
                }
                Err(e) => debug!(pod = %run.name, attempt, "FUSE fd not available yet: {}", e),
            }
            self.pause(timings.fd_handoff_interval, &run.name).await?;
        }
        Err(UpgradeError::timeout(
            format!("receive FUSE fd from {}", socket.display()),
            &run.name,
        ))
    }

    /// Move the binaries the canary staged over the running ones.
    async fn binary_upload(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        run.say("upgrade binary to mount pod");
        let staged = self.ctx.config.pod_fd_path.display().to_string();
        let script = match run.edition {
            Edition::Community => format!("rm -rf {COMMUNITY_BINARY} && mv {staged}/juicefs {COMMUNITY_BINARY}"),
            Edition::Enterprise => format!(
                "rm -rf {ENTERPRISE_BINARY} && mv {staged}/juicefs {ENTERPRISE_BINARY} && \
                 rm -rf {ENTERPRISE_MOUNT_HELPER} && mv {staged}/jfsmount {ENTERPRISE_MOUNT_HELPER}"
            ),
        };
        self.exec(&run.name, vec!["sh".to_string(), "-c".to_string(), script])
            .await?;
        Ok(StepOutcome::Next(UpgradeStep::SignalReload))
    }

    /// SIGHUP the mount process. Exhausting the retries is reported and the
    /// upgrade goes on.
    async fn signal_reload(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        let timings = &self.ctx.config.timings;
        let command: Vec<String> = ["kill", "-s", "SIGHUP"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(run.process.pid.to_string()))
            .collect();

        let mut delivered = false;
        for attempt in 1..=timings.reload_attempts {
            match self.exec(&run.name, command.clone()).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => debug!(pod = %run.name, attempt, "SIGHUP not delivered: {}", e),
            }
            self.pause(timings.reload_interval, &run.name).await?;
        }
        if !delivered {
            warn!(pod = %run.name, pid = run.process.pid, "giving up on SIGHUP");
            run.say(format!(
                "fail to send SIGHUP to process {} in mount pod {}",
                run.process.pid, run.name
            ));
        }

        match run.action {
            UpgradeAction::InPlace => Ok(StepOutcome::Finished("Upgrade binary in jfs-mount".to_string())),
            UpgradeAction::Recreate => {
                run.say(format!("Upgrade pod [{}] with recreating", run.name));
                Ok(StepOutcome::Next(UpgradeStep::WaitForReplacement))
            }
        }
    }

    /// Wait until a new ready instance serves the mount, or the old one is
    /// gone.
    async fn wait_for_replacement(&self, run: &mut UpgradeRun<'_>) -> Result<StepOutcome, UpgradeError> {
        let timings = &self.ctx.config.timings;
        let pods = self.ctx.store.pods();
        let selector = ListSelector::new()
            .label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT)
            .on_node(self.ctx.node_name());
        let selector = &selector;
        let (old, uuid, hash, unique_id) = (run.name.as_str(), run.uuid.as_str(), run.hash.as_str(), run.unique_id.as_str());

        let result = poll_until(timings.replacement, timings.replacement_poll, &self.ctx.cancel, move || async move {
            let candidates = pods.list(selector).await?;
            let replacement = candidates.iter().find(|p| {
                let meta = &p.metadata;
                let same_instance = label(meta, LABEL_UPGRADE_UUID) == Some(uuid)
                    || (label(meta, LABEL_CONFIG_HASH) == Some(hash) && label(meta, LABEL_UNIQUE_ID) == Some(unique_id));
                meta.name.as_deref() != Some(old)
                    && same_instance
                    && !is_being_deleted(meta)
                    && !is_pod_complete(p)
                    && is_pod_ready(p)
            });
            if let Some(new) = replacement {
                return Ok(Some(format!(
                    "Upgrade mount pod and recreate one: {}",
                    new.metadata.name.as_deref().unwrap_or_default()
                )));
            }
            match pods.get(old).await {
                Ok(pod) if is_pod_complete(&pod) => Ok(Some(format!("mount pod {old} has exited"))),
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(Some(format!("mount pod {old} has been replaced"))),
                Err(e) => Err(e),
            }
        })
        .await;

        match result {
            Ok(message) => Ok(StepOutcome::Finished(message)),
            Err(WaitError::TimedOut(elapsed)) => {
                warn!(pod = %run.name, ?elapsed, "node may be busy, check the mount pod manually");
                Err(UpgradeError::timeout("wait for replacement mount pod", &run.name))
            }
            Err(WaitError::Failed(e)) => Err(e.into()),
        }
    }

    async fn exec(&self, pod: &str, command: Vec<String>) -> Result<(), UpgradeError> {
        self.ctx
            .executor
            .exec(pod, MOUNT_CONTAINER_NAME, &command)
            .await
            .map(|_| ())
            .map_err(|e| UpgradeError::Exec {
                pod: pod.to_string(),
                reason: e.to_string(),
            })
    }

    async fn pause(&self, interval: Duration, name: &str) -> Result<(), UpgradeError> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(UpgradeError::timeout("upgrade", name)),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }

    async fn set_upgrade_annotation(&self, name: &str) -> Result<(), UpgradeError> {
        let pods = self.ctx.store.pods();
        let stamp = Utc::now().to_rfc3339();
        let stamp = stamp.as_str();
        retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut pod = pods.get(name).await?;
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_UPGRADE_PROCESS.to_string(), stamp.to_string());
            pods.update(&pod).await.map(|_| ())
        })
        .await?;
        Ok(())
    }

    async fn clear_upgrade_annotation(&self, name: &str) {
        let pods = self.ctx.store.pods();
        let result = retry_on_conflict(&Backoff::STANDARD, move || async move {
            let mut pod = match pods.get(name).await {
                Ok(pod) => pod,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            let removed = pod
                .metadata
                .annotations
                .as_mut()
                .and_then(|a| a.remove(ANNOTATION_UPGRADE_PROCESS))
                .is_some();
            if removed {
                pods.update(&pod).await?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(pod = name, "failed to clear upgrade annotation: {}", e);
        }
    }
}

#[async_trait]
impl InstanceUpgrader for GracefulUpgrade {
    fn can_upgrade(&self, pod: &Pod, action: UpgradeAction) -> Result<(), String> {
        let meta = &pod.metadata;
        let name = meta.name.as_deref().unwrap_or_default();
        let node = self.ctx.node_name();
        if pod_node_name(pod) != Some(node) {
            return Err(format!("mount pod {name} is not on node {node}"));
        }
        if label(meta, LABEL_CONFIG_HASH).unwrap_or_default().is_empty() {
            return Err(format!("mount pod {name} has no hash label"));
        }
        if label(meta, LABEL_UNIQUE_ID).unwrap_or_default().is_empty() {
            return Err(format!("mount pod {name} has no identity label"));
        }
        if label(meta, LABEL_UPGRADE_UUID).unwrap_or_default().is_empty() {
            return Err(format!("mount pod {name} has no upgrade uuid, cannot {action} upgrade"));
        }
        if !has_mount_container(pod) {
            return Err(format!("mount pod {name} has no mount container"));
        }
        if has_umount_pre_stop(pod) {
            return Err(format!("mount pod {name} has umount prestop hook, can not upgrade"));
        }
        if !is_pod_ready(pod) {
            return Err(format!("mount pod {name} is not ready yet"));
        }
        if let Some(started) = annotation(meta, ANNOTATION_UPGRADE_PROCESS) {
            let window = self.ctx.config.timings.upgrade_in_progress;
            match DateTime::parse_from_rfc3339(started) {
                Ok(at) => {
                    let age = Utc::now().signed_duration_since(at.with_timezone(&Utc));
                    if age.to_std().map(|a| a < window).unwrap_or(true) {
                        return Err(format!("mount pod {name} is already in upgrade process"));
                    }
                }
                Err(e) => debug!(pod = name, "ignoring unparsable upgrade annotation: {}", e),
            }
        }
        Ok(())
    }

    async fn upgrade(
        &self,
        name: &str,
        action: UpgradeAction,
        progress: &ProgressReporter,
    ) -> Result<String, UpgradeError> {
        progress.publish(format!("{POD_START} [{name}] {action} upgrade"));
        let result = self.run(name, action, progress).await;
        match &result {
            Ok(message) => {
                info!(pod = name, %action, "mount pod upgraded: {}", message);
                progress.publish(format!("{POD_SUCCESS} [{name}] {message}"));
            }
            Err(e) => {
                error!(pod = name, %action, "mount pod upgrade failed: {}", e);
                progress.publish(format!("{POD_FAIL} [{name}] {e}"));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{self, mark_complete, ready_mount_pod, Fixture};
    use crate::domain::cluster::ClusterError;
    use crate::domain::cluster::ExecOutput;
    use crate::domain::version::CompatibilityTable;
    use crate::infrastructure::passfd::{FdInstance, ScmRightsChannel, LEGACY_SOCKET};
    use crate::infrastructure::progress::ProgressReceiver;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    const POD: &str = "juicefs-node-a-pv-1";
    const UUID: &str = "0f0e";

    struct Setup {
        fx: Fixture,
        coordinator: GracefulUpgrade,
        _dir: tempfile::TempDir,
        fd_dir: PathBuf,
    }

    /// A ready mount pod whose mount path holds a `.config`, and a job hook
    /// that completes canaries after writing `version` as their marker.
    fn setup(version: &'static str) -> Setup {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_support::config(dir.path());
        let mount_path = config.mount_base_path.join(POD);
        std::fs::create_dir_all(&mount_path).expect("mount path");
        std::fs::write(mount_path.join(".config"), r#"{"pid": 42, "meta": {"sid": 7}}"#).expect("config");
        let fd_dir = config.fd_base_path.join(UUID);
        std::fs::create_dir_all(&fd_dir).expect("fd dir");

        let pod = ready_mount_pod(&config, POD, UUID, &mount_path);
        let fx = test_support::fixture(config);
        fx.store.pods.insert(pod);
        let marker = fd_dir.join(VERSION_MARKER);
        fx.store.jobs.set_create_hook(move |job| {
            std::fs::write(&marker, format!("juicefs version {version}+2024-01-01")).expect("marker");
            mark_complete(job);
        });
        let coordinator = GracefulUpgrade::new(fx.ctx.clone(), Arc::new(CompatibilityTable::default()));
        Setup {
            fx,
            coordinator,
            _dir: dir,
            fd_dir,
        }
    }

    async fn drain(rx: &mut ProgressReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_in_place_upgrade_swaps_binary_and_reloads() {
        let s = setup("1.2.3");
        let progress = ProgressReporter::new();
        let mut rx = progress.subscribe();

        let message = s
            .coordinator
            .upgrade(POD, UpgradeAction::InPlace, &progress)
            .await
            .expect("upgrade");
        assert_eq!(message, "Upgrade binary in jfs-mount");

        let commands: Vec<String> = s.fx.executor.calls().iter().map(|c| c.line()).collect();
        assert!(commands[0].contains("mv /tmp/juicefs /usr/local/bin/juicefs"));
        assert_eq!(commands[1], "kill -s SIGHUP 42");
        assert!(s.fx.store.jobs.names().is_empty(), "canary job is cleaned up");

        let lines = drain(&mut rx).await;
        assert!(lines.first().is_some_and(|l| l.starts_with("POD-START [juicefs-node-a-pv-1]")));
        assert!(lines.iter().any(|l| l.contains("canary job of mount pod")));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("POD-SUCCESS [juicefs-node-a-pv-1] Upgrade binary in jfs-mount")
        );
    }

    #[tokio::test]
    async fn test_old_version_is_incompatible() {
        let s = setup("1.0.0");
        let progress = ProgressReporter::new();
        let mut rx = progress.subscribe();

        let err = s
            .coordinator
            .upgrade(POD, UpgradeAction::Recreate, &progress)
            .await
            .expect_err("too old");
        assert!(matches!(err, UpgradeError::Incompatible(_)));
        assert!(s.fx.executor.calls().is_empty());
        let lines = drain(&mut rx).await;
        assert!(lines.last().is_some_and(|l| l.starts_with("POD-FAIL [juicefs-node-a-pv-1] incompatible")));
    }

    #[tokio::test]
    async fn test_unreachable_fd_fails_and_clears_annotation() {
        let s = setup("1.2.3");
        let progress = ProgressReporter::new();
        let err = s
            .coordinator
            .upgrade(POD, UpgradeAction::Recreate, &progress)
            .await
            .expect_err("no mount process socket");
        assert!(matches!(err, UpgradeError::Timeout { .. }));
        let pod = s.fx.store.pods.snapshot(POD).expect("pod");
        assert!(annotation(&pod.metadata, ANNOTATION_UPGRADE_PROCESS).is_none());
    }

    #[tokio::test]
    async fn test_recreate_hands_off_fd_and_waits_for_replacement() {
        let s = setup("1.2.3");

        // old mount process serving its fd socket
        let listener = UnixListener::bind(s.fd_dir.join(LEGACY_SOCKET)).expect("bind");
        let old_process = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let instance = FdInstance::detached("old-process");
            instance.exchange(&mut ScmRightsChannel::new(stream)).expect("exchange")
        });

        // the signal makes the pod controller start a replacement
        let store = s.fx.store.clone();
        let config = s.fx.ctx.config.clone();
        s.fx.executor.set_handler(move |call| {
            if call.line().starts_with("kill") {
                let mount_path = config.mount_base_path.join(POD);
                store.pods.insert(ready_mount_pod(&config, "juicefs-node-a-pv-1-new", UUID, &mount_path));
            }
            Ok(ExecOutput::default())
        });

        let progress = ProgressReporter::new();
        let mut rx = progress.subscribe();
        let message = s
            .coordinator
            .upgrade(POD, UpgradeAction::Recreate, &progress)
            .await
            .expect("upgrade");
        assert_eq!(message, "Upgrade mount pod and recreate one: juicefs-node-a-pv-1-new");

        let outcome = old_process.join().expect("old process");
        assert!(!outcome.sent, "the old process held no descriptor");

        let lines = drain(&mut rx).await;
        assert!(lines.iter().any(|l| l == "Upgrade pod [juicefs-node-a-pv-1] with recreating"));
        assert!(lines.last().is_some_and(|l| l.starts_with("POD-SUCCESS")));
        let pod = s.fx.store.pods.snapshot(POD).expect("old pod");
        assert!(annotation(&pod.metadata, ANNOTATION_UPGRADE_PROCESS).is_some());
    }

    #[tokio::test]
    async fn test_reload_failure_is_not_fatal() {
        let s = setup("1.2.3");
        s.fx.executor.set_handler(|call| {
            if call.line().starts_with("kill") {
                Err(ClusterError::Api("process busy".into()))
            } else {
                Ok(ExecOutput::default())
            }
        });
        let progress = ProgressReporter::new();
        let mut rx = progress.subscribe();
        s.coordinator
            .upgrade(POD, UpgradeAction::InPlace, &progress)
            .await
            .expect("best effort reload");
        let kills = s.fx.executor.calls().iter().filter(|c| c.line().starts_with("kill")).count();
        assert_eq!(kills as u32, s.fx.ctx.config.timings.reload_attempts);
        assert!(drain(&mut rx).await.iter().any(|l| l.contains("fail to send SIGHUP")));
    }

    #[tokio::test]
    async fn test_eligibility() {
        let s = setup("1.2.3");
        let pod = s.fx.store.pods.snapshot(POD).expect("pod");
        assert!(s.coordinator.can_upgrade(&pod, UpgradeAction::Recreate).is_ok());

        let mut in_progress = pod.clone();
        in_progress
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_UPGRADE_PROCESS.into(), Utc::now().to_rfc3339());
        let reason = s.coordinator.can_upgrade(&in_progress, UpgradeAction::Recreate).expect_err("busy");
        assert!(reason.contains("already in upgrade process"));

        let mut stale = pod.clone();
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        stale
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_UPGRADE_PROCESS.into(), long_ago.to_rfc3339());
        assert!(s.coordinator.can_upgrade(&stale, UpgradeAction::Recreate).is_ok());

        let mut not_ready = pod.clone();
        not_ready.status = None;
        assert!(s.coordinator.can_upgrade(&not_ready, UpgradeAction::InPlace).is_err());

        let mut elsewhere = pod;
        if let Some(spec) = elsewhere.spec.as_mut() {
            spec.node_name = Some("node-b".into());
        }
        assert!(s.coordinator.can_upgrade(&elsewhere, UpgradeAction::InPlace).is_err());
    }
}
