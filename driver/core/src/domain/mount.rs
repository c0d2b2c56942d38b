// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mount Manager contract shared by every resource kind.

use crate::domain::cluster::ClusterError;
use crate::domain::resource::MountedResource;
use crate::domain::setting::MountSetting;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Capability set implemented by the process, pod and daemonset managers.
#[async_trait]
pub trait MountManager: Send + Sync {
    /// Create or attach the backing resource, register `setting.target_path`
    /// as a reference and wait until the resource is ready.
    async fn mount(&self, setting: &MountSetting) -> Result<MountedResource, MountError>;

    /// Drop the reference of `target` from `resource`, deleting the resource
    /// once nothing references it.
    async fn unmount(&self, target: &str, resource: &str) -> Result<(), MountError>;

    async fn add_reference(&self, target: &str, resource: &str) -> Result<(), MountError>;

    async fn reference_count(&self, resource: &str) -> Result<usize, MountError>;

    /// Remove the volume's cache data from this node.
    async fn clean_cache(&self, setting: &MountSetting) -> Result<(), MountError>;
}

#[derive(Debug, Error)]
pub enum MountError {
    /// The daemonset cannot run a replica on this node.
    #[error("{resource} cannot be scheduled on node {node}: {reason}")]
    Scheduling {
        resource: String,
        node: String,
        reason: String,
    },

    #[error("{operation} on {resource} did not finish within {elapsed:?}")]
    Timeout {
        operation: String,
        resource: String,
        elapsed: Duration,
    },

    #[error("{0} is being deleted")]
    ResourceDeleting(String),

    #[error("invalid mount setting: {0}")]
    InvalidSetting(String),

    #[error("host mount failed: {0}")]
    HostMount(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl MountError {
    pub fn timeout(operation: impl Into<String>, resource: impl Into<String>, elapsed: Duration) -> Self {
        MountError::Timeout {
            operation: operation.into(),
            resource: resource.into(),
            elapsed,
        }
    }

    pub fn is_scheduling(&self) -> bool {
        matches!(self, MountError::Scheduling { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MountError::Timeout { .. })
    }
}

/// Mounts performed directly by the node agent, without a mount workload.
#[async_trait]
pub trait HostMounter: Send + Sync {
    async fn mount(&self, source: &str, target: &str, fs_type: &str, options: &[String]) -> Result<(), MountError>;

    async fn unmount(&self, target: &str) -> Result<(), MountError>;

    async fn is_mounted(&self, target: &str) -> Result<bool, MountError>;
}
