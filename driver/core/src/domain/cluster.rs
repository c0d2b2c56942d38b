// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Cluster Store Interfaces
//!
//! Persistence contracts for the cluster objects the mount core manipulates.
//! The cluster API is treated as a CRUD key-value store with optimistic
//! concurrency: `update` fails with [`ClusterError::Conflict`] when the
//! object's resource version is stale.
//!
//! | Trait | Objects | Implementations |
//! |-------|---------|-----------------|
//! | `ResourceStore<K>` | Pod, DaemonSet, Secret, Job, ConfigMap, Node | `InMemoryResourceStore`, `KubeResourceStore` |
//! | `ClusterStore` | accessor over all of the above | `InMemoryClusterStore`, `KubeClusterStore` |
//! | `ContainerExecutor` | exec into a named container | `KubeContainerExecutor` |
//!
//! Stores are scoped to the driver namespace; nodes are cluster scoped.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use std::collections::BTreeMap;
use thiserror::Error;

/// Label and field constraints for a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub labels: BTreeMap<String, String>,
    /// Restricts pods to those scheduled on this node (`spec.nodeName`).
    pub node_name: Option<String>,
}

impl ListSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    /// `k=v,k2=v2` form understood by the API server.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn field_selector(&self) -> String {
        self.node_name
            .as_ref()
            .map(|n| format!("spec.nodeName={n}"))
            .unwrap_or_default()
    }

    /// Whether an object's labels satisfy the label part of the selector.
    pub fn matches_labels(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.labels.iter().all(|(k, v)| {
            labels
                .and_then(|l| l.get(k))
                .map(|actual| actual == v)
                .unwrap_or(false)
        })
    }
}

/// CRUD contract for one object kind.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K, ClusterError>;

    async fn create(&self, object: &K) -> Result<K, ClusterError>;

    /// Replace the object; stale resource versions fail with `Conflict`.
    async fn update(&self, object: &K) -> Result<K, ClusterError>;

    async fn delete(&self, name: &str) -> Result<(), ClusterError>;

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>, ClusterError>;
}

/// Access to every object kind the mount core touches.
pub trait ClusterStore: Send + Sync {
    fn pods(&self) -> &dyn ResourceStore<Pod>;
    fn daemon_sets(&self) -> &dyn ResourceStore<DaemonSet>;
    fn secrets(&self) -> &dyn ResourceStore<Secret>;
    fn jobs(&self) -> &dyn ResourceStore<Job>;
    fn config_maps(&self) -> &dyn ResourceStore<ConfigMap>;
    fn nodes(&self) -> &dyn ResourceStore<Node>;
}

/// Captured output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands inside a named container of a pod.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<ExecOutput, ClusterError>;
}

/// Cluster store failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("resource version conflict on {0}")]
    Conflict(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClusterError::NotFound(resp.message),
                409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
                409 => ClusterError::Conflict(resp.message),
                422 => ClusterError::Invalid(resp.message),
                _ => ClusterError::Api(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
            },
            other => ClusterError::Api(other.to_string()),
        }
    }
}
