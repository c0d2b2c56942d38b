// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Upgrade Requests
//!
//! Grammar of the upgrade control channel and the vocabulary of progress
//! messages streamed back to the caller.
//!
//! ```text
//! <instance-name|BATCH> [RECREATE|NORECREATE] [worker=N,ignoreError=B,uniqueIds=a/b]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Instance name that selects a batch upgrade.
pub const BATCH_TARGET: &str = "BATCH";
/// Request that lists the broker's instances instead of upgrading.
pub const LIST_REQUEST: &str = "list";

pub const POD_START: &str = "POD-START";
pub const POD_SUCCESS: &str = "POD-SUCCESS";
pub const POD_FAIL: &str = "POD-FAIL";
pub const BATCH_SUCCESS: &str = "BATCH-SUCCESS";
pub const BATCH_FAIL: &str = "BATCH-FAIL";
pub const SUCCESS: &str = "SUCCESS";
pub const FAIL: &str = "FAIL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UpgradeAction {
    /// Start a fresh mount pod that takes over the FUSE fd.
    #[default]
    Recreate,
    /// Swap the binary inside the running container and reload.
    InPlace,
}

impl UpgradeAction {
    pub fn token(&self) -> &'static str {
        match self {
            UpgradeAction::Recreate => "RECREATE",
            UpgradeAction::InPlace => "NORECREATE",
        }
    }
}

impl fmt::Display for UpgradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeAction::Recreate => write!(f, "recreate"),
            UpgradeAction::InPlace => write!(f, "in-place"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub name: String,
    pub action: UpgradeAction,
    /// Requested batch concurrency, validated by the batch coordinator.
    pub worker: i64,
    pub ignore_error: bool,
    /// Allow-list of stable identities; empty means every instance.
    pub unique_ids: Vec<String>,
}

impl UpgradeRequest {
    pub fn single(name: impl Into<String>, action: UpgradeAction) -> Self {
        Self {
            name: name.into(),
            action,
            worker: 1,
            ignore_error: false,
            unique_ids: Vec::new(),
        }
    }

    pub fn batch(action: UpgradeAction) -> Self {
        Self::single(BATCH_TARGET, action)
    }

    pub fn is_batch(&self) -> bool {
        self.name == BATCH_TARGET
    }

    /// Parse a control message.
    pub fn parse(message: &str) -> Result<Self, RequestParseError> {
        let mut tokens = message.split_whitespace();
        let name = tokens.next().ok_or(RequestParseError::Empty)?;
        let mut request = Self::single(name, UpgradeAction::Recreate);

        for token in tokens {
            if token.contains('=') {
                request.apply_options(token);
                continue;
            }
            match token.to_ascii_uppercase().as_str() {
                "RECREATE" => request.action = UpgradeAction::Recreate,
                "NORECREATE" => request.action = UpgradeAction::InPlace,
                _ => return Err(RequestParseError::UnknownAction(token.to_string())),
            }
        }
        Ok(request)
    }

    fn apply_options(&mut self, options: &str) {
        for pair in options.split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                tracing::warn!("ignoring malformed upgrade option '{}'", pair);
                continue;
            };
            match key.trim() {
                "worker" => match value.trim().parse::<i64>() {
                    Ok(n) => self.worker = n,
                    Err(_) => tracing::warn!("invalid worker value '{}', using {}", value, self.worker),
                },
                "ignoreError" => match value.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => self.ignore_error = true,
                    "false" | "0" | "no" | "off" => self.ignore_error = false,
                    _ => tracing::warn!("invalid ignoreError value '{}'", value),
                },
                "uniqueIds" | "uniqueId" => {
                    self.unique_ids = value
                        .split('/')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                other => tracing::warn!("ignoring unknown upgrade option '{}'", other),
            }
        }
    }

    /// Render back into the wire form.
    pub fn to_message(&self) -> String {
        let mut message = format!("{} {}", self.name, self.action.token());
        if self.is_batch() {
            message.push_str(&format!(" worker={},ignoreError={}", self.worker, self.ignore_error));
            if !self.unique_ids.is_empty() {
                message.push_str(&format!(",uniqueIds={}", self.unique_ids.join("/")));
            }
        }
        message
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestParseError {
    #[error("empty upgrade request")]
    Empty,
    #[error("unknown upgrade action '{0}'")]
    UnknownAction(String),
}

/// Why a single instance upgrade stopped.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The instance is not in a state that can be upgraded.
    #[error("{0}")]
    Rejected(String),

    /// The running version does not support the requested action.
    #[error("incompatible: {0}")]
    Incompatible(String),

    #[error("{operation} for {resource} timed out")]
    Timeout { operation: String, resource: String },

    #[error("exec in {pod} failed: {reason}")]
    Exec { pod: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cluster(#[from] crate::domain::cluster::ClusterError),

    #[error(transparent)]
    Mount(#[from] crate::domain::mount::MountError),
}

impl UpgradeError {
    pub fn timeout(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        UpgradeError::Timeout {
            operation: operation.into(),
            resource: resource.into(),
        }
    }
}

/// True for lines that end a single-instance stream.
pub fn is_single_terminal(line: &str) -> bool {
    has_prefix(line, SUCCESS) || has_prefix(line, FAIL)
}

/// True for lines that end a batch stream.
pub fn is_batch_terminal(line: &str) -> bool {
    has_prefix(line, BATCH_SUCCESS) || has_prefix(line, BATCH_FAIL)
}

fn has_prefix(line: &str, prefix: &str) -> bool {
    line.strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with(' '))
        .unwrap_or(false)
}

/// Live configuration of a running mount process, read from `.config`
/// inside its mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub struct MountProcessConf {
    pub pid: i32,
    #[serde(default)]
    pub meta: MountProcessMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub struct MountProcessMeta {
    #[serde(default)]
    pub sid: u64,
}

impl MountProcessConf {
    pub fn sid(&self) -> u64 {
        self.meta.sid
    }
}
