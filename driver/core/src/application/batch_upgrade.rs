// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Batch Upgrade Coordinator
//!
//! Fans the single-instance upgrade out over every eligible mount pod on
//! this node. At most one batch runs per node agent; a request arriving
//! while one runs is attached to the running batch's progress stream.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Node-wide upgrades with per-instance outcomes

use crate::application::graceful_upgrade::InstanceUpgrader;
use crate::application::mount_context::MountContext;
use crate::domain::cluster::ListSelector;
use crate::domain::resource::{label, LABEL_RESOURCE_TYPE, LABEL_UNIQUE_ID, RESOURCE_TYPE_MOUNT};
use crate::domain::upgrade::{UpgradeAction, UpgradeRequest, BATCH_FAIL, BATCH_SUCCESS};
use crate::infrastructure::progress::{ProgressReceiver, ProgressReporter};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    /// Collecting eligible instances.
    Waiting,
    /// Per-instance upgrades are in flight.
    Running,
}

struct ActiveBatch {
    phase: BatchPhase,
    reporter: ProgressReporter,
    instances: Vec<String>,
}

/// Outcome of one finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub upgraded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn terminal_line(&self) -> String {
        if self.succeeded() {
            format!(
                "{BATCH_SUCCESS} upgraded {} mount pods, skipped {}",
                self.upgraded.len(),
                self.skipped.len()
            )
        } else {
            let names: Vec<&str> = self.failed.iter().map(|(name, _)| name.as_str()).collect();
            format!(
                "{BATCH_FAIL} {} of {} mount pods failed: {}",
                self.failed.len(),
                self.failed.len() + self.upgraded.len(),
                names.join(", ")
            )
        }
    }
}

/// Handle returned to a caller of [`BatchUpgrade::attach_or_start`].
pub struct BatchAttachment {
    pub receiver: ProgressReceiver,
    /// False when the caller joined a batch that was already running.
    pub started: bool,
}

pub struct BatchUpgrade {
    ctx: Arc<MountContext>,
    upgrader: Arc<dyn InstanceUpgrader>,
    active: Mutex<Option<ActiveBatch>>,
}

impl BatchUpgrade {
    pub fn new(ctx: Arc<MountContext>, upgrader: Arc<dyn InstanceUpgrader>) -> Self {
        Self {
            ctx,
            upgrader,
            active: Mutex::new(None),
        }
    }

    /// Phase and instance list of the running batch.
    pub fn status(&self) -> Option<(BatchPhase, Vec<String>)> {
        self.active
            .lock()
            .as_ref()
            .map(|batch| (batch.phase, batch.instances.clone()))
    }

    /// Start a batch for `request`, or attach to the one already running.
    /// The receiver ends with a `BATCH-SUCCESS` or `BATCH-FAIL` line.
    pub fn attach_or_start(self: &Arc<Self>, request: UpgradeRequest) -> BatchAttachment {
        let reporter = {
            let mut active = self.active.lock();
            if let Some(batch) = active.as_ref() {
                info!(phase = ?batch.phase, "batch upgrade already running, attaching");
                return BatchAttachment {
                    receiver: batch.reporter.subscribe(),
                    started: false,
                };
            }
            let reporter = ProgressReporter::new();
            *active = Some(ActiveBatch {
                phase: BatchPhase::Waiting,
                reporter: reporter.clone(),
                instances: Vec::new(),
            });
            reporter
        };
        let receiver = reporter.subscribe();

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(&request, &reporter).await;
            // clear first so a caller that sees the terminal line can start the next batch
            this.active.lock().take();
            let line = match outcome {
                Ok(summary) => summary.terminal_line(),
                Err(reason) => format!("{BATCH_FAIL} {reason}"),
            };
            reporter.publish(line);
        });

        BatchAttachment {
            receiver,
            started: true,
        }
    }

    /// Run one batch to completion. Per-instance failures are collected;
    /// `Err` means the batch could not start.
    pub async fn execute(&self, request: &UpgradeRequest, progress: &ProgressReporter) -> Result<BatchSummary, String> {
        let limit = self.ctx.config.max_parallel_upgrades;
        if request.worker > limit as i64 {
            warn!(worker = request.worker, limit, "batch worker count over limit");
            return Err(format!("worker {} exceeds the limit of {} parallel upgrades", request.worker, limit));
        }
        let worker = usize::try_from(request.worker.max(1)).unwrap_or(1);

        let selector = ListSelector::new()
            .label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT)
            .on_node(self.ctx.node_name());
        let pods = self
            .ctx
            .store
            .pods()
            .list(&selector)
            .await
            .map_err(|e| format!("list mount pods: {e}"))?;

        let mut summary = BatchSummary::default();
        let mut targets = Vec::new();
        for pod in &pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let Some(unique_id) = label(&pod.metadata, LABEL_UNIQUE_ID).filter(|id| !id.is_empty()) else {
                debug!(pod = %name, "no identity label, not part of the batch");
                continue;
            };
            if !request.unique_ids.is_empty() && !request.unique_ids.iter().any(|id| id == unique_id) {
                continue;
            }
            if let Err(reason) = self.upgrader.can_upgrade(pod, request.action) {
                progress.publish(format!("skip mount pod {name}: {reason}"));
                summary.skipped.push((name, reason));
                continue;
            }
            targets.push(name);
        }

        if let Some(batch) = self.active.lock().as_mut() {
            batch.phase = BatchPhase::Running;
            batch.instances = targets.clone();
        }
        info!(count = targets.len(), worker, action = %request.action, "starting batch upgrade");
        progress.publish(format!(
            "upgrading {} mount pods with {} workers",
            targets.len(),
            worker
        ));

        let total = targets.len();
        let permits = Arc::new(Semaphore::new(worker));
        let mut tasks = JoinSet::new();
        for name in targets {
            let upgrader = self.upgrader.clone();
            let permits = permits.clone();
            let progress = progress.clone();
            let action: UpgradeAction = request.action;
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (name, Err("batch cancelled".to_string()));
                };
                let result = upgrader
                    .upgrade(&name, action, &progress)
                    .await
                    .map_err(|e| e.to_string());
                (name, result)
            });
        }

        let period = self.ctx.config.timings.batch_status_sync;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut finished = 0;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(_)))) => {
                        finished += 1;
                        summary.upgraded.push(name);
                    }
                    Some(Ok((name, Err(reason)))) => {
                        finished += 1;
                        summary.failed.push((name, reason));
                    }
                    Some(Err(e)) => {
                        finished += 1;
                        error!("batch upgrade task aborted: {}", e);
                        summary.failed.push(("<unknown>".to_string(), e.to_string()));
                    }
                },
                _ = ticker.tick() => {
                    progress.publish(format!("batch upgrade: {finished}/{total} mount pods finished"));
                }
            }
        }

        summary.upgraded.sort();
        summary.failed.sort();
        info!(
            upgraded = summary.upgraded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "batch upgrade finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{self, ready_mount_pod, Fixture};
    use crate::domain::upgrade::{is_batch_terminal, UpgradeError, POD_FAIL, POD_START, POD_SUCCESS};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Follows the per-pod contract without touching the cluster.
    #[derive(Default)]
    struct FakeUpgrader {
        failing: HashSet<String>,
        ineligible: HashSet<String>,
        delay: Duration,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl InstanceUpgrader for FakeUpgrader {
        fn can_upgrade(&self, pod: &Pod, _action: UpgradeAction) -> Result<(), String> {
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            if self.ineligible.contains(name) {
                return Err("not ready".to_string());
            }
            Ok(())
        }

        async fn upgrade(
            &self,
            name: &str,
            _action: UpgradeAction,
            progress: &ProgressReporter,
        ) -> Result<String, UpgradeError> {
            self.calls.lock().push(name.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            progress.publish(format!("{POD_START} [{name}]"));
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(name) {
                progress.publish(format!("{POD_FAIL} [{name}] boom"));
                return Err(UpgradeError::Rejected("boom".into()));
            }
            progress.publish(format!("{POD_SUCCESS} [{name}] done"));
            Ok("done".into())
        }
    }

    fn seed(fx: &Fixture, pods: &[(&str, &str)]) {
        for (name, unique_id) in pods {
            let mut pod = ready_mount_pod(&fx.ctx.config, name, "u", Path::new("/jfs"));
            if let Some(labels) = pod.metadata.labels.as_mut() {
                labels.insert(LABEL_UNIQUE_ID.to_string(), unique_id.to_string());
            }
            fx.store.pods.insert(pod);
        }
    }

    fn coordinator(upgrader: FakeUpgrader) -> (Fixture, Arc<FakeUpgrader>, Arc<BatchUpgrade>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let fx = test_support::fixture(test_support::config(dir.path()));
        let upgrader = Arc::new(upgrader);
        let batch = Arc::new(BatchUpgrade::new(fx.ctx.clone(), upgrader.clone()));
        (fx, upgrader, batch, dir)
    }

    async fn collect(mut receiver: ProgressReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = receiver.recv().await {
            let done = is_batch_terminal(&line);
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    fn count(lines: &[String], prefix: &str, name: &str) -> usize {
        let tag = format!("{prefix} [{name}]");
        lines.iter().filter(|l| l.starts_with(&tag)).count()
    }

    #[tokio::test]
    async fn test_one_failure_fails_the_batch() {
        let (fx, _upgrader, batch, _dir) = coordinator(FakeUpgrader {
            failing: HashSet::from(["pod-b".to_string()]),
            ..Default::default()
        });
        seed(&fx, &[("pod-a", "1"), ("pod-b", "2"), ("pod-c", "3")]);

        let mut request = UpgradeRequest::batch(UpgradeAction::Recreate);
        request.worker = 3;
        let lines = collect(batch.attach_or_start(request).receiver).await;

        assert_eq!(lines.last().map(String::as_str), Some("BATCH-FAIL 1 of 3 mount pods failed: pod-b"));
        for name in ["pod-a", "pod-c"] {
            assert_eq!(count(&lines, POD_SUCCESS, name), 1);
            assert_eq!(count(&lines, POD_FAIL, name), 0);
        }
        assert_eq!(count(&lines, POD_FAIL, "pod-b"), 1);
    }

    #[tokio::test]
    async fn test_ineligible_pods_are_skipped() {
        let (fx, upgrader, batch, _dir) = coordinator(FakeUpgrader {
            ineligible: HashSet::from(["pod-b".to_string()]),
            ..Default::default()
        });
        seed(&fx, &[("pod-a", "1"), ("pod-b", "2")]);

        let progress = ProgressReporter::new();
        let summary = batch
            .execute(&UpgradeRequest::batch(UpgradeAction::InPlace), &progress)
            .await
            .expect("batch");
        assert!(summary.succeeded());
        assert_eq!(summary.upgraded, vec!["pod-a".to_string()]);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(*upgrader.calls.lock(), vec!["pod-a".to_string()]);
        assert_eq!(summary.terminal_line(), "BATCH-SUCCESS upgraded 1 mount pods, skipped 1");
    }

    #[tokio::test]
    async fn test_allow_list_filters_instances() {
        let (fx, upgrader, batch, _dir) = coordinator(FakeUpgrader::default());
        seed(&fx, &[("pod-a", "1"), ("pod-b", "2"), ("pod-c", "3")]);

        let mut request = UpgradeRequest::batch(UpgradeAction::Recreate);
        request.unique_ids = vec!["1".into(), "3".into()];
        let summary = batch
            .execute(&request, &ProgressReporter::new())
            .await
            .expect("batch");
        assert_eq!(summary.upgraded, vec!["pod-a".to_string(), "pod-c".to_string()]);
        assert!(!upgrader.calls.lock().contains(&"pod-b".to_string()));
    }

    #[tokio::test]
    async fn test_worker_limit() {
        let (fx, upgrader, batch, _dir) = coordinator(FakeUpgrader {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        seed(&fx, &[("pod-a", "1"), ("pod-b", "2"), ("pod-c", "3"), ("pod-d", "4")]);

        let mut too_many = UpgradeRequest::batch(UpgradeAction::Recreate);
        too_many.worker = fx.ctx.config.max_parallel_upgrades as i64 + 1;
        let lines = collect(batch.attach_or_start(too_many).receiver).await;
        assert!(lines.last().is_some_and(|l| l.starts_with("BATCH-FAIL worker")));
        assert!(upgrader.calls.lock().is_empty());

        let mut two = UpgradeRequest::batch(UpgradeAction::Recreate);
        two.worker = 2;
        batch.execute(&two, &ProgressReporter::new()).await.expect("batch");
        assert_eq!(upgrader.calls.lock().len(), 4);
        assert!(upgrader.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_second_request_attaches_to_running_batch() {
        let (fx, upgrader, batch, _dir) = coordinator(FakeUpgrader {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        seed(&fx, &[("pod-a", "1")]);

        let first = batch.attach_or_start(UpgradeRequest::batch(UpgradeAction::Recreate));
        let second = batch.attach_or_start(UpgradeRequest::batch(UpgradeAction::Recreate));
        assert!(first.started);
        assert!(!second.started);
        assert!(batch.status().is_some());

        let (a, b) = tokio::join!(collect(first.receiver), collect(second.receiver));
        assert_eq!(a.last(), b.last());
        assert_eq!(upgrader.calls.lock().len(), 1);
        assert!(batch.status().is_none(), "state is reset after the run");

        let third = batch.attach_or_start(UpgradeRequest::batch(UpgradeAction::Recreate));
        assert!(third.started);
        collect(third.receiver).await;
    }
}
