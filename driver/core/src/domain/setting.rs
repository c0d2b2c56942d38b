// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Settings
//!
//! Per-volume mount parameters handed to the mount core by the CSI node
//! server, and the configuration hash that decides whether an existing
//! mount resource can be shared or must be rebuilt.

use crate::domain::mount_config::MountMode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Filesystem edition, which decides binary layout and upgrade policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    #[default]
    Community,
    Enterprise,
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edition::Community => write!(f, "community"),
            Edition::Enterprise => write!(f, "enterprise"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MountSetting {
    /// Filesystem name.
    pub name: String,
    /// Metadata engine URL (community) or volume token source (enterprise).
    pub source: String,
    pub edition: Edition,
    /// CSI volume id.
    pub volume_id: String,
    /// Stable identity of the volume (usually the PV name).
    pub unique_id: String,
    /// Kubelet target path of the consumer.
    pub target_path: String,
    #[serde(default)]
    pub sub_path: String,
    /// Mount point of the mount process on the host. Filled in by the manager.
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Explicit per-volume mount mode.
    #[serde(default)]
    pub mount_mode: Option<MountMode>,
    /// Group identity used when many volumes share one mount resource.
    #[serde(default)]
    pub share_group: Option<String>,
    #[serde(default)]
    pub cache_dirs: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Credentials stored in the resource secret.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl MountSetting {
    /// sha256 over the settings with consumer-specific fields cleared, so all
    /// consumers of one volume agree on the hash.
    pub fn config_hash(&self) -> String {
        self.hash_for_identity(&self.unique_id)
    }

    /// Hash for a resource keyed by [`shared_identity`](Self::shared_identity).
    /// Volumes that converge on the same shared resource agree on it even
    /// though their unique ids differ.
    pub fn shared_config_hash(&self) -> String {
        self.hash_for_identity(&self.shared_identity())
    }

    fn hash_for_identity(&self, identity: &str) -> String {
        let mut normalized = self.clone();
        normalized.unique_id = identity.to_string();
        normalized.target_path.clear();
        normalized.volume_id.clear();
        normalized.sub_path.clear();
        normalized.mount_path.clear();
        // selectors of the resource, not part of its configuration
        normalized.storage_class = None;
        normalized.mount_mode = None;
        normalized.share_group = None;
        let encoded = serde_json::to_vec(&normalized)
            .expect("mount settings hold only strings, string maps and unit enums");
        let mut hash = hex::encode(Sha256::digest(&encoded));
        hash.truncate(63);
        hash
    }

    /// Identity used to key a resource shared by many volumes.
    pub fn shared_identity(&self) -> String {
        self.share_group
            .clone()
            .or_else(|| self.storage_class.clone())
            .unwrap_or_else(|| self.name.clone())
    }
}
