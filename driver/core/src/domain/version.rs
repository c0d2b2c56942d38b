// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Upgrade compatibility policy.
//!
//! Which edition/version combinations support which upgrade action is policy
//! data supplied by configuration; the coordinator only asks the injected
//! [`VersionPolicy`].

use crate::domain::setting::Edition;
use crate::domain::upgrade::UpgradeAction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Extract the first `x.y.z` found in free text such as
    /// `juicefs version 1.2.1+2024-08-30.cd871d1`.
    pub fn find_in(text: &str) -> Option<Self> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN
            .get_or_init(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok())
            .as_ref()?;
        let caps = pattern.captures(text)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::find_in(s).ok_or_else(|| format!("'{s}' is not a version"))
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Decides whether an action is supported by the version a canary reported.
pub trait VersionPolicy: Send + Sync {
    fn check(&self, edition: Edition, version: Version, action: UpgradeAction) -> Result<(), String>;
}

/// Minimum versions per edition and action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompatibilityTable {
    pub community_recreate: Version,
    pub community_in_place: Version,
    pub enterprise_recreate: Version,
    pub enterprise_in_place: Version,
}

impl Default for CompatibilityTable {
    fn default() -> Self {
        Self {
            community_recreate: Version::new(1, 2, 1),
            community_in_place: Version::new(1, 2, 0),
            enterprise_recreate: Version::new(5, 1, 0),
            enterprise_in_place: Version::new(5, 0, 0),
        }
    }
}

impl CompatibilityTable {
    fn minimum(&self, edition: Edition, action: UpgradeAction) -> Version {
        match (edition, action) {
            (Edition::Community, UpgradeAction::Recreate) => self.community_recreate,
            (Edition::Community, UpgradeAction::InPlace) => self.community_in_place,
            (Edition::Enterprise, UpgradeAction::Recreate) => self.enterprise_recreate,
            (Edition::Enterprise, UpgradeAction::InPlace) => self.enterprise_in_place,
        }
    }
}

impl VersionPolicy for CompatibilityTable {
    fn check(&self, edition: Edition, version: Version, action: UpgradeAction) -> Result<(), String> {
        let minimum = self.minimum(edition, action);
        if version < minimum {
            return Err(format!(
                "{edition} version {version} does not support {action} upgrade, requires at least {minimum}"
            ));
        }
        Ok(())
    }
}
