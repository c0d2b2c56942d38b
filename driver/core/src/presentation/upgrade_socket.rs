// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Upgrade control socket.
//!
//! Text protocol over a Unix socket, one message per line. The client sends
//! a single request line; the server streams progress lines and ends the
//! stream with a terminal line:
//!
//! ```text
//! -> juicefs-node-a-pv-1 RECREATE
//! <- POD-START [juicefs-node-a-pv-1] recreate upgrade
//! <- canary job of mount pod juicefs-node-a-pv-1 completed
//! <- ...
//! <- POD-SUCCESS [juicefs-node-a-pv-1] Upgrade mount pod and recreate one: ...
//! <- SUCCESS [juicefs-node-a-pv-1] Upgrade mount pod and recreate one: ...
//! ```
//!
//! `BATCH` requests end with `BATCH-SUCCESS` or `BATCH-FAIL`. The request
//! `list` is answered with the fd broker's instance table.

use crate::application::graceful_upgrade::InstanceUpgrader;
use crate::application::node_services::NodeServices;
use crate::domain::upgrade::{
    is_batch_terminal, is_single_terminal, UpgradeAction, UpgradeRequest, FAIL, LIST_REQUEST, SUCCESS,
};
use crate::infrastructure::progress::{ProgressReceiver, ProgressReporter};
use anyhow::{bail, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct UpgradeSocketServer {
    services: Arc<NodeServices>,
    listener: UnixListener,
    path: PathBuf,
}

impl UpgradeSocketServer {
    /// Bind `path`, replacing a socket left behind by a previous agent.
    pub fn bind(services: Arc<NodeServices>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale upgrade socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
        let listener =
            UnixListener::bind(&path).with_context(|| format!("failed to bind {}", path.display()))?;
        Ok(Self {
            services,
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept requests until `shutdown` is cancelled, then remove the socket.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "upgrade socket listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let services = self.services.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(services, stream).await {
                                warn!("upgrade request aborted: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("upgrade socket accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "upgrade socket not removed: {}", e);
        }
        info!("upgrade socket stopped");
    }
}

async fn send(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_connection(services: Arc<NodeServices>, stream: UnixStream) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut message = String::new();
    BufReader::new(reader).read_line(&mut message).await?;
    let message = message.trim();
    info!(request = message, "upgrade request received");

    if message == LIST_REQUEST {
        writer.write_all(services.ctx.broker.describe().as_bytes()).await?;
        return writer.shutdown().await;
    }

    let request = match UpgradeRequest::parse(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(request = message, "rejecting upgrade request: {}", e);
            return send(&mut writer, &format!("{FAIL} {e}")).await;
        }
    };

    if request.is_batch() {
        let attachment = services.batch.attach_or_start(request);
        forward(attachment.receiver, &mut writer, is_batch_terminal).await?;
    } else {
        upgrade_single(services.upgrader.clone(), &request.name, request.action, &mut writer).await?;
    }
    writer.shutdown().await
}

async fn upgrade_single(
    upgrader: Arc<dyn InstanceUpgrader>,
    name: &str,
    action: UpgradeAction,
    writer: &mut OwnedWriteHalf,
) -> io::Result<()> {
    let progress = ProgressReporter::new();
    let receiver = progress.subscribe();
    let task_name = name.to_string();
    // the upgrade keeps going if the client disconnects
    let task = tokio::spawn(async move { upgrader.upgrade(&task_name, action, &progress).await });

    // ends when the task drops the reporter
    forward(receiver, writer, |_| false).await?;
    let terminal = match task.await {
        Ok(Ok(message)) => format!("{SUCCESS} [{name}] {message}"),
        Ok(Err(e)) => format!("{FAIL} [{name}] {e}"),
        Err(e) => format!("{FAIL} [{name}] upgrade task aborted: {e}"),
    };
    send(writer, &terminal).await
}

async fn forward(
    mut receiver: ProgressReceiver,
    writer: &mut OwnedWriteHalf,
    terminal: impl Fn(&str) -> bool,
) -> io::Result<()> {
    while let Some(line) = receiver.recv().await {
        send(writer, &line).await?;
        if terminal(&line) {
            break;
        }
    }
    Ok(())
}

/// Send `message` and hand every reply line to `on_line` until a line
/// satisfying `terminal` arrives; that line is returned.
async fn request(
    socket: &Path,
    message: &str,
    terminal: impl Fn(&str) -> bool,
    mut on_line: impl FnMut(&str),
) -> Result<String> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    let (reader, mut writer) = stream.into_split();
    send(&mut writer, message).await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        on_line(&line);
        if terminal(&line) {
            return Ok(line);
        }
    }
    bail!("upgrade socket closed before a final status")
}

/// Upgrade one mount pod; returns the `SUCCESS` or `FAIL` line.
pub async fn trigger_upgrade(
    socket: &Path,
    name: &str,
    action: UpgradeAction,
    on_line: impl FnMut(&str),
) -> Result<String> {
    let message = UpgradeRequest::single(name, action).to_message();
    request(socket, &message, is_single_terminal, on_line).await
}

/// Upgrade every eligible mount pod; returns the `BATCH-SUCCESS` or
/// `BATCH-FAIL` line.
pub async fn trigger_batch_upgrade(
    socket: &Path,
    batch: &UpgradeRequest,
    on_line: impl FnMut(&str),
) -> Result<String> {
    // a malformed request is answered with a plain FAIL
    let terminal = |line: &str| is_batch_terminal(line) || is_single_terminal(line);
    request(socket, &batch.to_message(), terminal, on_line).await
}

/// The fd broker's instance table, one instance per line.
pub async fn list_fds(socket: &Path) -> Result<String> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    stream.write_all(format!("{LIST_REQUEST}\n").as_bytes()).await?;
    let mut table = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut table).await?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{self, ready_mount_pod};
    use crate::infrastructure::memory_store::{InMemoryClusterStore, RecordingExecutor};
    use crate::infrastructure::mounter::RecordingMounter;

    struct Running {
        socket: PathBuf,
        services: Arc<NodeServices>,
        _dir: tempfile::TempDir,
    }

    async fn start(store: InMemoryClusterStore) -> Running {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_support::config(dir.path());
        let socket = config.upgrade_socket.clone();
        let services = NodeServices::init(
            config,
            Arc::new(store),
            Arc::new(RecordingExecutor::new()),
            Arc::new(RecordingMounter::new()),
        )
        .await
        .expect("services");
        let server = UpgradeSocketServer::bind(services.clone(), &socket).expect("bind");
        tokio::spawn(server.run(services.shutdown_token()));
        Running {
            socket,
            services,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_unknown_pod_fails_with_final_line() {
        let running = start(InMemoryClusterStore::new()).await;
        let mut seen = Vec::new();
        let last = trigger_upgrade(&running.socket, "missing", UpgradeAction::Recreate, |l| seen.push(l.to_string()))
            .await
            .expect("stream");

        assert_eq!(last, "FAIL [missing] mount pod missing not found");
        assert!(seen[0].starts_with("POD-START [missing]"));
        assert!(seen.iter().any(|l| l.starts_with("POD-FAIL [missing]")));
    }

    #[tokio::test]
    async fn test_malformed_request_is_answered_with_fail() {
        let running = start(InMemoryClusterStore::new()).await;
        let last = request(&running.socket, "pod-a SIDEWAYS", is_single_terminal, |_| {})
            .await
            .expect("reply");
        assert_eq!(last, "FAIL unknown upgrade action 'SIDEWAYS'");
    }

    #[tokio::test]
    async fn test_batch_over_empty_node_succeeds() {
        let running = start(InMemoryClusterStore::new()).await;
        let last = trigger_batch_upgrade(&running.socket, &UpgradeRequest::batch(UpgradeAction::InPlace), |_| {})
            .await
            .expect("stream");
        assert_eq!(last, "BATCH-SUCCESS upgraded 0 mount pods, skipped 0");
    }

    #[tokio::test]
    async fn test_list_describes_broker() {
        let store = InMemoryClusterStore::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_support::config(dir.path());
        store.pods.insert(ready_mount_pod(&config, "juicefs-node-a-pv-1", "uuid-9", dir.path()));
        let running = start(store).await;

        let table = list_fds(&running.socket).await.expect("list");
        assert!(table.starts_with("key: uuid-9, value: "));
        assert!(table.trim_end().ends_with("fuse_fd_csi_comm.sock"));

        running.services.shutdown().await;
    }
}
