// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! FUSE descriptor broker.
//!
//! Keeps the live FUSE connection descriptor of every mount instance on this
//! node and hands it across process boundaries when an instance is replaced.
//! One Unix socket per instance, keyed by the instance's upgrade uuid.
//!
//! Exchange, from the broker's side:
//!
//! 1. send the settings blob with `[filler, held fd]` attached
//! 2. close the local copy of the held fd if one was sent
//! 3. receive the reply: `CLOSE`, or a settings blob with a new descriptor
//! 4. adopt the new descriptor if nothing is held, otherwise close it
//!
//! Steps 1-4 hold the instance's exchange lock, so at most one side owns the
//! descriptor when an exchange completes.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements descriptor handoff for graceful upgrades

pub mod transport;

use crate::domain::config::DriverConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
pub use transport::{FdChannel, ScmRightsChannel};

pub const SERVER_SOCKET: &str = "fuse_fd_csi_comm.sock";
/// Prefix of the socket a mount process serves its own descriptor on.
pub const LEGACY_SOCKET_PREFIX: &str = "fuse_fd_comm.";
pub const LEGACY_SOCKET: &str = "fuse_fd_comm.1";
pub const DEFAULT_SETTING: &[u8] = b"FUSE";
pub const CLOSE_WORD: &[u8] = b"CLOSE";

/// Always attached so a message carries at least one descriptor.
const FILLER_FD: RawFd = libc::STDIN_FILENO;

/// Bootstrap pulls run with bounded concurrency.
const BOOTSTRAP_PARALLELISM: usize = 20;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no fd broker instance for {0}")]
    UnknownInstance(String),

    #[error("fd exchange on {0} timed out")]
    Timeout(String),

    #[error("peer sent no descriptors")]
    NoDescriptor,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Ownership of an instance's live descriptor.
#[derive(Debug, Default)]
pub enum HeldFd {
    /// Never held one.
    #[default]
    Empty,
    Held(OwnedFd),
    /// Handed to a peer; the peer owns it now.
    Sent,
}

impl HeldFd {
    pub fn is_held(&self) -> bool {
        matches!(self, HeldFd::Held(_))
    }

    fn raw(&self) -> Option<RawFd> {
        match self {
            HeldFd::Held(fd) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct FdState {
    fd: HeldFd,
    setting: Vec<u8>,
    sid: u64,
}

/// Per-instance broker state.
#[derive(Debug)]
pub struct FdInstance {
    key: String,
    state: Mutex<FdState>,
    exchange: Mutex<()>,
    done: CancellationToken,
    server_address: PathBuf,
    address_in_pod: PathBuf,
}

/// What one exchange did with the held descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub sent: bool,
    pub adopted: bool,
}

impl FdInstance {
    fn new(key: &str, server_address: PathBuf, address_in_pod: PathBuf) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(FdState {
                fd: HeldFd::Empty,
                setting: DEFAULT_SETTING.to_vec(),
                sid: 0,
            }),
            exchange: Mutex::new(()),
            done: CancellationToken::new(),
            server_address,
            address_in_pod,
        }
    }

    /// An instance without a socket, for driving [`FdInstance::exchange`]
    /// over an arbitrary channel.
    pub fn detached(key: &str) -> Self {
        Self::new(key, PathBuf::new(), PathBuf::new())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holds_fd(&self) -> bool {
        self.state.lock().fd.is_held()
    }

    pub fn setting(&self) -> Vec<u8> {
        self.state.lock().setting.clone()
    }

    pub fn adopt(&self, fd: OwnedFd, setting: Vec<u8>) {
        let mut state = self.state.lock();
        state.fd = HeldFd::Held(fd);
        state.setting = setting;
    }

    /// Run one exchange over `channel`. Blocks; call from a blocking context.
    pub fn exchange(&self, channel: &mut dyn FdChannel) -> Result<ExchangeOutcome, BrokerError> {
        let _serial = self.exchange.lock();

        let sent = {
            let mut state = self.state.lock();
            let mut fds = vec![FILLER_FD];
            let held = state.fd.raw();
            fds.extend(held);
            channel.send_fds(&state.setting, &fds)?;
            if held.is_some() {
                debug!(instance = %self.key, "sent FUSE fd");
                // dropping the OwnedFd closes our copy
                state.fd = HeldFd::Sent;
            }
            held.is_some()
        };

        let (message, received) = channel.recv_fds(1)?;

        let mut state = self.state.lock();
        let adopted = if message != CLOSE_WORD && !state.fd.is_held() && !received.is_empty() {
            let mut received = received.into_iter();
            if let Some(fd) = received.next() {
                state.fd = HeldFd::Held(fd);
            }
            state.setting = message;
            debug!(instance = %self.key, "adopted FUSE fd");
            true
        } else {
            debug!(
                instance = %self.key,
                message = %String::from_utf8_lossy(&message),
                count = received.len(),
                "discarding received descriptors"
            );
            // received fds close on drop
            false
        };
        Ok(ExchangeOutcome { sent, adopted })
    }

    /// Drop the held descriptor without handing it to anyone.
    fn close(&self) {
        let mut state = self.state.lock();
        if state.fd.is_held() {
            state.fd = HeldFd::Sent;
        }
    }
}

/// What [`FdBroker::pull_fd`] got back from a mount process.
#[derive(Debug)]
pub struct PulledFd {
    /// The live descriptor, when kept.
    pub fd: Option<OwnedFd>,
    /// A live descriptor was offered by the peer.
    pub offered: bool,
    pub setting: Vec<u8>,
}

pub struct FdBroker {
    base_path: PathBuf,
    pod_fd_path: PathBuf,
    exchange_timeout: Duration,
    instances: Mutex<HashMap<String, Arc<FdInstance>>>,
}

impl FdBroker {
    pub fn new(base_path: impl Into<PathBuf>, pod_fd_path: impl Into<PathBuf>, exchange_timeout: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            pod_fd_path: pod_fd_path.into(),
            exchange_timeout,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(&config.fd_base_path, &config.pod_fd_path, config.timings.fd_exchange)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn instance_dir(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    /// Socket a mount process of this instance serves its own fd on.
    pub fn legacy_socket(&self, key: &str) -> PathBuf {
        self.instance_dir(key).join(LEGACY_SOCKET)
    }

    pub fn instance(&self, key: &str) -> Option<Arc<FdInstance>> {
        self.instances.lock().get(key).cloned()
    }

    fn register(&self, key: &str) -> Arc<FdInstance> {
        let instance = Arc::new(FdInstance::new(
            key,
            self.instance_dir(key).join(SERVER_SOCKET),
            self.pod_fd_path.join(SERVER_SOCKET),
        ));
        self.instances.lock().insert(key.to_string(), instance.clone());
        instance
    }

    /// Register `key` and return the socket address as seen from inside the
    /// mount pod. Idempotent.
    pub async fn fd_address(&self, key: &str) -> Result<PathBuf, BrokerError> {
        if let Some(existing) = self.instance(key) {
            return Ok(existing.address_in_pod.clone());
        }
        tokio::fs::create_dir_all(self.instance_dir(key)).await?;
        Ok(self.register(key).address_in_pod.clone())
    }

    /// Start accepting exchanges for a registered instance.
    pub async fn serve(&self, key: &str) -> Result<(), BrokerError> {
        let instance = self
            .instance(key)
            .ok_or_else(|| BrokerError::UnknownInstance(key.to_string()))?;
        let address = instance.server_address.clone();
        match tokio::fs::remove_file(&address).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&address)?;
        info!(instance = %key, address = %address.display(), "serving FUSE fd");

        let timeout = self.exchange_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = instance.done.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let instance = instance.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(instance.clone(), stream, timeout).await {
                                    error!(instance = %instance.key, "fd exchange failed: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!(instance = %instance.key, "accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            drop(listener);
            let _ = tokio::fs::remove_file(&instance.server_address).await;
            instance.close();
            debug!(instance = %instance.key, "fd server stopped");
        });
        Ok(())
    }

    /// Register and serve `key` unless the broker already knows it. Returns
    /// whether a server was started.
    pub async fn ensure_serving(&self, key: &str) -> Result<bool, BrokerError> {
        if self.instance(key).is_some() {
            return Ok(false);
        }
        self.fd_address(key).await?;
        self.serve(key).await?;
        Ok(true)
    }

    /// Stop serving, close the held fd and remove the instance directory.
    pub async fn stop(&self, key: &str) {
        let removed = self.instances.lock().remove(key);
        if let Some(instance) = removed {
            info!(instance = %key, "stopping fd server");
            instance.done.cancel();
            instance.close();
        }
        let dir = self.instance_dir(key);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), "failed to remove fd directory: {}", e);
            }
        }
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.instances.lock().keys().cloned().collect();
        for key in keys {
            self.stop(&key).await;
        }
    }

    /// Close the held fd; the instance keeps serving.
    pub fn close_fd(&self, key: &str) {
        if let Some(instance) = self.instance(key) {
            debug!(instance = %key, "closing FUSE fd");
            instance.close();
        }
    }

    pub fn update_sid(&self, key: &str, sid: u64) {
        if let Some(instance) = self.instance(key) {
            instance.state.lock().sid = sid;
        }
    }

    pub fn sid(&self, key: &str) -> u64 {
        self.instance(key).map(|i| i.state.lock().sid).unwrap_or(0)
    }

    /// One line per instance: `key: <uuid>, value: <server socket>`.
    pub fn describe(&self) -> String {
        let instances = self.instances.lock();
        let mut keys: Vec<&String> = instances.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| format!("key: {}, value: {}\n", k, instances[*k].server_address.display()))
            .collect()
    }

    /// Take over descriptors from mount processes that were running before
    /// this broker started. Directories of instances not in `live` are left
    /// alone; directories without a mount-process socket are removed.
    pub async fn bootstrap(self: &Arc<Self>, live: &HashSet<String>) -> Result<usize, BrokerError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = JoinSet::new();
        let permits = Arc::new(tokio::sync::Semaphore::new(BOOTSTRAP_PARALLELISM));
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            let Some(socket) = find_legacy_socket(&entry.path()).await? else {
                debug!(instance = %key, "no mount process socket, removing directory");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
                continue;
            };
            if !live.contains(&key) {
                continue;
            }
            let broker = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                broker.take_over(&key, &socket).await
            });
        }

        let mut adopted = 0;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(Some(()))) {
                adopted += 1;
            }
        }
        info!(adopted, "fd broker bootstrap finished");
        Ok(adopted)
    }

    async fn take_over(&self, key: &str, socket: &Path) -> Option<()> {
        let pulled = match Self::pull_fd(socket, false, self.exchange_timeout).await {
            Ok(pulled) => pulled,
            Err(e) => {
                debug!(instance = %key, "could not pull fd: {}", e);
                return None;
            }
        };
        let fd = pulled.fd?;
        let instance = self.register(key);
        instance.adopt(fd, pulled.setting);
        if let Err(e) = self.serve(key).await {
            error!(instance = %key, "failed to serve adopted fd: {}", e);
            return None;
        }
        Some(())
    }

    /// Dial a mount process's socket and take its descriptor.
    ///
    /// With `release`, the process is told to drop its copy and the received
    /// descriptor is closed here too. Without it, the descriptor is handed
    /// back to the process and a duplicate is kept.
    pub async fn pull_fd(path: &Path, release: bool, timeout: Duration) -> Result<PulledFd, BrokerError> {
        let path = path.to_path_buf();
        let display = path.display().to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<PulledFd, BrokerError> {
            let mut channel = ScmRightsChannel::connect(&path)?;
            channel.set_read_timeout(Some(timeout))?;
            pull_over(&mut channel, release)
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(BrokerError::Io(io::Error::other(join))),
            Err(_) => Err(BrokerError::Timeout(display)),
        }
    }
}

/// Client half of an exchange, independent of the socket type.
pub fn pull_over(channel: &mut dyn FdChannel, release: bool) -> Result<PulledFd, BrokerError> {
    let (setting, fds) = channel.recv_fds(2)?;
    let mut fds = fds.into_iter();
    // first descriptor is the filler
    if fds.next().is_none() {
        return Err(BrokerError::NoDescriptor);
    }
    let live = fds.next();
    let offered = live.is_some();

    if release {
        channel.send_fds(CLOSE_WORD, &[FILLER_FD])?;
        return Ok(PulledFd {
            fd: None,
            offered,
            setting,
        });
    }

    if let Some(fd) = &live {
        channel.send_fds(&setting, &[fd.as_raw_fd()])?;
    }
    Ok(PulledFd {
        fd: live,
        offered,
        setting,
    })
}

async fn find_legacy_socket(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(LEGACY_SOCKET_PREFIX) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

async fn handle_connection(
    instance: Arc<FdInstance>,
    stream: tokio::net::UnixStream,
    timeout: Duration,
) -> Result<ExchangeOutcome, BrokerError> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut channel = ScmRightsChannel::new(stream);
    tokio::task::spawn_blocking(move || instance.exchange(&mut channel))
        .await
        .map_err(|e| BrokerError::Io(io::Error::other(e)))?
}
