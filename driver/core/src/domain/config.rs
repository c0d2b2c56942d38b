// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Driver Configuration Types
//
// Defines the configuration schema for the CSI node agent:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and namespace of mount resources
// - Mount mode defaults and by-process switch
// - Socket and mount point locations
// - Wait bounds for every polling loop
// - Upgrade compatibility table

use crate::domain::mount_config::MountMode;
use crate::domain::version::CompatibilityTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "juicefs.com/v1";
pub const KIND: &str = "DriverConfig";
pub const CONFIG_PATH_ENV: &str = "JFS_CSI_CONFIG_PATH";

/// Top-level Kubernetes-style driver configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfigManifest {
    /// API version (must be "juicefs.com/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "DriverConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node agent configuration (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Name of the node this agent runs on
    #[serde(default)]
    pub node_name: String,

    /// Namespace mount pods, daemonsets, secrets and jobs live in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Mount inside the agent process instead of creating mount resources
    #[serde(default)]
    pub by_process: bool,

    /// Process-wide mount mode used when neither the volume nor the cluster
    /// config names one
    #[serde(default)]
    pub mount_mode: Option<MountMode>,

    /// ConfigMap holding per-storage-class mount modes
    #[serde(default = "default_mount_config_map")]
    pub mount_config_map: String,

    /// Host directory mount points are created under
    #[serde(default = "default_mount_base_path")]
    pub mount_base_path: PathBuf,

    /// Host directory holding one fd-exchange directory per mount instance
    #[serde(default = "default_fd_base_path")]
    pub fd_base_path: PathBuf,

    /// Where `fd_base_path/<uuid>` is mounted inside a mount pod
    #[serde(default = "default_pod_fd_path")]
    pub pod_fd_path: PathBuf,

    /// Upgrade control socket
    #[serde(default = "default_upgrade_socket")]
    pub upgrade_socket: PathBuf,

    #[serde(default = "default_mount_image")]
    pub mount_image: String,

    #[serde(default = "default_mount_image")]
    pub cache_clean_image: String,

    /// Upper bound for the batch worker count
    #[serde(default = "default_max_parallel_upgrades")]
    pub max_parallel_upgrades: usize,

    #[serde(default)]
    pub timings: Timings,

    #[serde(default)]
    pub compatibility: CompatibilityTable,
}

/// Bounds and intervals of every polling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    #[serde(with = "humantime_serde")]
    pub delete_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub delete_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub pod_ready: Duration,
    #[serde(with = "humantime_serde")]
    pub pod_ready_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub daemonset_ready: Duration,
    #[serde(with = "humantime_serde")]
    pub daemonset_ready_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub canary: Duration,
    #[serde(with = "humantime_serde")]
    pub canary_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub config_read: Duration,
    pub fd_handoff_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub fd_handoff_interval: Duration,
    pub reload_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub reload_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub replacement: Duration,
    #[serde(with = "humantime_serde")]
    pub replacement_poll: Duration,
    #[serde(with = "humantime_serde")]
    pub single_upgrade: Duration,
    /// An upgrade annotation younger than this blocks another upgrade
    #[serde(with = "humantime_serde")]
    pub upgrade_in_progress: Duration,
    #[serde(with = "humantime_serde")]
    pub batch_status_sync: Duration,
    /// Read timeout of one fd exchange on the broker socket
    #[serde(with = "humantime_serde")]
    pub fd_exchange: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            delete_wait: Duration::from_secs(60),
            delete_poll: Duration::from_millis(500),
            pod_ready: Duration::from_secs(60),
            pod_ready_poll: Duration::from_millis(500),
            daemonset_ready: Duration::from_secs(300),
            daemonset_ready_poll: Duration::from_secs(2),
            canary: Duration::from_secs(300),
            canary_poll: Duration::from_millis(500),
            config_read: Duration::from_secs(2),
            fd_handoff_attempts: 100,
            fd_handoff_interval: Duration::from_millis(100),
            reload_attempts: 50,
            reload_interval: Duration::from_millis(200),
            replacement: Duration::from_secs(60),
            replacement_poll: Duration::from_secs(1),
            single_upgrade: Duration::from_secs(30 * 60),
            upgrade_in_progress: Duration::from_secs(5 * 60),
            batch_status_sync: Duration::from_secs(2),
            fd_exchange: Duration::from_secs(600),
        }
    }
}

impl Timings {
    /// Millisecond-scale bounds for tests and dry runs.
    pub fn fast() -> Self {
        let tick = Duration::from_millis(10);
        Self {
            delete_wait: Duration::from_millis(500),
            delete_poll: tick,
            pod_ready: Duration::from_millis(500),
            pod_ready_poll: tick,
            daemonset_ready: Duration::from_millis(300),
            daemonset_ready_poll: tick,
            canary: Duration::from_millis(500),
            canary_poll: tick,
            config_read: Duration::from_millis(200),
            fd_handoff_attempts: 5,
            fd_handoff_interval: tick,
            reload_attempts: 3,
            reload_interval: tick,
            replacement: Duration::from_millis(500),
            replacement_poll: tick,
            single_upgrade: Duration::from_secs(5),
            upgrade_in_progress: Duration::from_secs(300),
            batch_status_sync: Duration::from_millis(20),
            fd_exchange: Duration::from_secs(2),
        }
    }
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

fn default_mount_config_map() -> String {
    "juicefs-mount-config".to_string()
}

fn default_mount_base_path() -> PathBuf {
    PathBuf::from("/var/lib/juicefs/volume")
}

fn default_fd_base_path() -> PathBuf {
    PathBuf::from("/var/run/juicefs-csi")
}

fn default_pod_fd_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_upgrade_socket() -> PathBuf {
    PathBuf::from("/tmp/juicefs-csi-upgrade.sock")
}

fn default_mount_image() -> String {
    "juicedata/mount:ce-v1.2.1".to_string()
}

fn default_max_parallel_upgrades() -> usize {
    50
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            namespace: default_namespace(),
            by_process: false,
            mount_mode: None,
            mount_config_map: default_mount_config_map(),
            mount_base_path: default_mount_base_path(),
            fd_base_path: default_fd_base_path(),
            pod_fd_path: default_pod_fd_path(),
            upgrade_socket: default_upgrade_socket(),
            mount_image: default_mount_image(),
            cache_clean_image: default_mount_image(),
            max_parallel_upgrades: default_max_parallel_upgrades(),
            timings: Timings::default(),
            compatibility: CompatibilityTable::default(),
        }
    }
}

impl Default for DriverConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "juicefs-csi-node".to_string(),
                labels: None,
            },
            spec: DriverConfig::default(),
        }
    }
}

impl DriverConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. JFS_CSI_CONFIG_PATH environment variable
    /// 2. ./juicefs-csi.yaml (working directory)
    /// 3. /etc/juicefs-csi/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./juicefs-csi.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        let system_config = PathBuf::from("/etc/juicefs-csi/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows the node daemonset to inject per-node values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(node) = lookup("NODE_NAME").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: NODE_NAME={}", node);
            self.spec.node_name = node;
        }

        if let Some(ns) = lookup("JUICEFS_MOUNT_NAMESPACE").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: JUICEFS_MOUNT_NAMESPACE={}", ns);
            self.spec.namespace = ns;
        }

        if let Some(val) = lookup("JFS_BY_PROCESS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => self.spec.by_process = true,
                "false" | "0" | "no" | "off" => self.spec.by_process = false,
                _ => tracing::warn!(
                    "Invalid value for JFS_BY_PROCESS: '{}'. Expected true/false. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("JFS_MOUNT_MODE") {
            match val.parse::<MountMode>() {
                Ok(mode) => {
                    tracing::info!("Environment override: JFS_MOUNT_MODE={}", mode);
                    self.spec.mount_mode = Some(mode);
                }
                Err(e) => tracing::warn!("Invalid value for JFS_MOUNT_MODE: {}. Ignoring.", e),
            }
        }

        if let Some(val) = lookup("JFS_MAX_PARALLEL_UPGRADES") {
            match val.parse::<usize>() {
                Ok(n) => self.spec.max_parallel_upgrades = n,
                Err(_) => tracing::warn!(
                    "Invalid value for JFS_MAX_PARALLEL_UPGRADES: '{}'. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        self.spec.validate()
    }
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name cannot be empty (set it or export NODE_NAME)");
        }

        if self.namespace.is_empty() {
            anyhow::bail!("namespace cannot be empty");
        }

        if self.max_parallel_upgrades == 0 {
            anyhow::bail!("max_parallel_upgrades must be at least 1");
        }

        let t = &self.timings;
        let bounds = [
            ("delete_wait", t.delete_wait),
            ("pod_ready", t.pod_ready),
            ("daemonset_ready", t.daemonset_ready),
            ("canary", t.canary),
            ("config_read", t.config_read),
            ("replacement", t.replacement),
            ("single_upgrade", t.single_upgrade),
            ("fd_exchange", t.fd_exchange),
            ("batch_status_sync", t.batch_status_sync),
        ];
        for (name, value) in bounds {
            if value.is_zero() {
                anyhow::bail!("timings.{} must be greater than zero", name);
            }
        }

        Ok(())
    }
}
