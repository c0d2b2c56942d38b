// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Mode Configuration
//!
//! Decides which resource kind hosts a volume's mount. Sources are consulted
//! in order and the first usable one wins:
//!
//! 1. explicit per-volume mode
//! 2. cluster ConfigMap entry keyed by storage-class name
//! 3. cluster ConfigMap `default` entry
//! 4. process-wide mode flag
//! 5. `per-pvc`
//!
//! A stored value that does not parse is skipped rather than failing the
//! mount path.

use k8s_openapi::api::core::v1::NodeAffinity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Key of the fallback entry in the mount-mode ConfigMap.
pub const DEFAULT_CONFIG_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MountMode {
    #[default]
    #[serde(rename = "per-pvc", alias = "perPVC", alias = "pvc")]
    PerPvc,
    #[serde(rename = "shared-pod", alias = "sharedPod")]
    SharedPod,
    #[serde(rename = "daemonset", alias = "daemonSet", alias = "DaemonSet")]
    DaemonSet,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::PerPvc => write!(f, "per-pvc"),
            MountMode::SharedPod => write!(f, "shared-pod"),
            MountMode::DaemonSet => write!(f, "daemonset"),
        }
    }
}

impl FromStr for MountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-pvc" | "perpvc" | "pvc" => Ok(MountMode::PerPvc),
            "shared-pod" | "sharedpod" => Ok(MountMode::SharedPod),
            "daemonset" => Ok(MountMode::DaemonSet),
            other => Err(format!("unknown mount mode '{other}'")),
        }
    }
}

/// One value of the mount-mode ConfigMap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MountConfigEntry {
    #[serde(alias = "deploymentMode")]
    pub mount_mode: Option<MountMode>,
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
}

impl MountConfigEntry {
    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

/// Where the resolved mode came from; logged with every mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    Volume,
    StorageClass,
    ClusterDefault,
    GlobalFlag,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMountConfig {
    pub mode: MountMode,
    pub source: ModeSource,
    /// Node affinity applied to daemonset templates.
    pub node_affinity: Option<NodeAffinity>,
}

fn stored_entry(data: Option<&BTreeMap<String, String>>, key: &str) -> Option<MountConfigEntry> {
    let raw = data?.get(key)?;
    match MountConfigEntry::parse(raw) {
        Ok(entry) if entry.mount_mode.is_some() => Some(entry),
        Ok(_) => {
            warn!("mount config entry '{}' has no mount mode, ignoring", key);
            None
        }
        Err(e) => {
            warn!("invalid mount config entry '{}': {}, ignoring", key, e);
            None
        }
    }
}

/// Apply the resolution order. `config_data` is the ConfigMap's data, if
/// the ConfigMap exists.
pub fn resolve_mount_config(
    explicit: Option<MountMode>,
    storage_class: Option<&str>,
    config_data: Option<&BTreeMap<String, String>>,
    global: Option<MountMode>,
) -> ResolvedMountConfig {
    if let Some(mode) = explicit {
        // affinity still comes from the cluster config when one applies
        let node_affinity = storage_class
            .and_then(|sc| stored_entry(config_data, sc))
            .or_else(|| stored_entry(config_data, DEFAULT_CONFIG_KEY))
            .and_then(|e| e.node_affinity);
        return ResolvedMountConfig {
            mode,
            source: ModeSource::Volume,
            node_affinity,
        };
    }

    if let Some(entry) = storage_class.and_then(|sc| stored_entry(config_data, sc)) {
        return ResolvedMountConfig {
            mode: entry.mount_mode.unwrap_or_default(),
            source: ModeSource::StorageClass,
            node_affinity: entry.node_affinity,
        };
    }

    if let Some(entry) = stored_entry(config_data, DEFAULT_CONFIG_KEY) {
        return ResolvedMountConfig {
            mode: entry.mount_mode.unwrap_or_default(),
            source: ModeSource::ClusterDefault,
            node_affinity: entry.node_affinity,
        };
    }

    match global {
        Some(mode) => ResolvedMountConfig {
            mode,
            source: ModeSource::GlobalFlag,
            node_affinity: None,
        },
        None => ResolvedMountConfig {
            mode: MountMode::PerPvc,
            source: ModeSource::BuiltIn,
            node_affinity: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_explicit_mode_wins() {
        let d = data(&[("sc", "mountMode: daemonset")]);
        let r = resolve_mount_config(Some(MountMode::SharedPod), Some("sc"), Some(&d), None);
        assert_eq!(r.mode, MountMode::SharedPod);
        assert_eq!(r.source, ModeSource::Volume);
    }

    #[test]
    fn test_storage_class_then_default() {
        let d = data(&[("sc", "mountMode: daemonset"), ("default", "mountMode: shared-pod")]);
        let r = resolve_mount_config(None, Some("sc"), Some(&d), None);
        assert_eq!(r.mode, MountMode::DaemonSet);
        assert_eq!(r.source, ModeSource::StorageClass);

        let r = resolve_mount_config(None, Some("other"), Some(&d), None);
        assert_eq!(r.mode, MountMode::SharedPod);
        assert_eq!(r.source, ModeSource::ClusterDefault);
    }

    #[test]
    fn test_invalid_entries_fall_through() {
        let d = data(&[("sc", "mountMode: [not, valid"), ("default", "mountMode: bogus")]);
        let r = resolve_mount_config(None, Some("sc"), Some(&d), Some(MountMode::DaemonSet));
        assert_eq!(r.mode, MountMode::DaemonSet);
        assert_eq!(r.source, ModeSource::GlobalFlag);

        let r = resolve_mount_config(None, Some("sc"), Some(&d), None);
        assert_eq!(r.mode, MountMode::PerPvc);
        assert_eq!(r.source, ModeSource::BuiltIn);
    }

    #[test]
    fn test_aliases_and_affinity() {
        let raw = r#"
deploymentMode: sharedPod
nodeAffinity:
  requiredDuringSchedulingIgnoredDuringExecution:
    nodeSelectorTerms:
      - matchExpressions:
          - key: disk
            operator: In
            values: ["ssd"]
"#;
        let entry = MountConfigEntry::parse(raw).expect("entry parses");
        assert_eq!(entry.mount_mode, Some(MountMode::SharedPod));
        assert!(entry.node_affinity.is_some());
        assert_eq!("DaemonSet".parse::<MountMode>(), Ok(MountMode::DaemonSet));
        assert!("nope".parse::<MountMode>().is_err());
    }
}
