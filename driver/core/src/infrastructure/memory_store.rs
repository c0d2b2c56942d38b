// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory cluster store.
//!
//! Behaves like the API server where the mount core cares: names are unique,
//! every write bumps `metadata.resourceVersion`, and an update carrying a
//! stale version fails with `Conflict`. Used for tests and dry runs, together
//! with [`RecordingExecutor`].

use crate::domain::cluster::{ClusterError, ClusterStore, ContainerExecutor, ExecOutput, ListSelector, ResourceStore};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::Metadata;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Hook<K> = Arc<dyn Fn(&mut K) + Send + Sync>;

pub struct InMemoryResourceStore<K> {
    objects: RwLock<HashMap<String, K>>,
    on_create: RwLock<Option<Hook<K>>>,
    version: AtomicU64,
}

impl<K> Default for InMemoryResourceStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            on_create: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }
}

impl<K> InMemoryResourceStore<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Serialize + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn name_of(object: &K) -> Result<String, ClusterError> {
        object
            .metadata()
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ClusterError::Invalid(format!("{} without a name", K::KIND)))
    }

    /// Run `hook` on every object as it is created, e.g. to mark pods ready.
    pub fn set_create_hook(&self, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        *self.on_create.write() = Some(Arc::new(hook));
    }

    /// Store `object` as-is, bypassing create semantics.
    pub fn insert(&self, mut object: K) {
        let Ok(name) = Self::name_of(&object) else {
            return;
        };
        object.metadata_mut().resource_version = Some(self.next_version());
        self.objects.write().insert(name, object);
    }

    pub fn snapshot(&self, name: &str) -> Option<K> {
        self.objects.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Mutate a stored object in place, bumping its version. Returns false
    /// when the object does not exist.
    pub fn modify(&self, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let version = self.next_version();
        let mut objects = self.objects.write();
        match objects.get_mut(name) {
            Some(object) => {
                f(object);
                object.metadata_mut().resource_version = Some(version);
                true
            }
            None => false,
        }
    }

    /// Set the deletion timestamp, as the API server does while finalizers run.
    pub fn mark_deleting(&self, name: &str) -> bool {
        self.modify(name, |o| {
            o.metadata_mut().deletion_timestamp = Some(Time(Utc::now()));
        })
    }

    pub fn remove(&self, name: &str) -> Option<K> {
        self.objects.write().remove(name)
    }

    fn matches(object: &K, selector: &ListSelector) -> bool {
        if !selector.matches_labels(object.metadata().labels.as_ref()) {
            return false;
        }
        match &selector.node_name {
            Some(node) => serde_json::to_value(object)
                .ok()
                .and_then(|v| v.pointer("/spec/nodeName").and_then(|n| n.as_str().map(String::from)))
                .map(|n| &n == node)
                .unwrap_or(false),
            None => true,
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for InMemoryResourceStore<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Serialize + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ClusterError> {
        self.snapshot(name)
            .ok_or_else(|| ClusterError::NotFound(format!("{} {}", K::KIND, name)))
    }

    async fn create(&self, object: &K) -> Result<K, ClusterError> {
        let name = Self::name_of(object)?;
        let hook = self.on_create.read().clone();
        let mut stored = object.clone();
        {
            let meta = stored.metadata_mut();
            meta.resource_version = Some(self.next_version());
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
        }
        if let Some(hook) = hook {
            hook(&mut stored);
        }
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(format!("{} {}", K::KIND, name)));
        }
        objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update(&self, object: &K) -> Result<K, ClusterError> {
        let name = Self::name_of(object)?;
        let version = self.next_version();
        let mut objects = self.objects.write();
        let current = objects
            .get(&name)
            .ok_or_else(|| ClusterError::NotFound(format!("{} {}", K::KIND, name)))?;
        let expected = object.metadata().resource_version.as_deref();
        if expected.is_some() && expected != current.metadata().resource_version.as_deref() {
            return Err(ClusterError::Conflict(format!("{} {}", K::KIND, name)));
        }
        let mut stored = object.clone();
        {
            let meta = stored.metadata_mut();
            meta.resource_version = Some(version);
            // server-owned fields survive a replace
            meta.uid = current.metadata().uid.clone();
            meta.creation_timestamp = current.metadata().creation_timestamp.clone();
            meta.deletion_timestamp = current.metadata().deletion_timestamp.clone();
        }
        objects.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        self.remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("{} {}", K::KIND, name)))
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>, ClusterError> {
        let objects = self.objects.read();
        let mut matched: Vec<K> = objects
            .values()
            .filter(|o| Self::matches(o, selector))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        Ok(matched)
    }
}

/// In-memory store for every kind, with public handles for seeding state.
#[derive(Default)]
pub struct InMemoryClusterStore {
    pub pods: InMemoryResourceStore<Pod>,
    pub daemon_sets: InMemoryResourceStore<DaemonSet>,
    pub secrets: InMemoryResourceStore<Secret>,
    pub jobs: InMemoryResourceStore<Job>,
    pub config_maps: InMemoryResourceStore<ConfigMap>,
    pub nodes: InMemoryResourceStore<Node>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClusterStore for InMemoryClusterStore {
    fn pods(&self) -> &dyn ResourceStore<Pod> {
        &self.pods
    }

    fn daemon_sets(&self) -> &dyn ResourceStore<DaemonSet> {
        &self.daemon_sets
    }

    fn secrets(&self) -> &dyn ResourceStore<Secret> {
        &self.secrets
    }

    fn jobs(&self) -> &dyn ResourceStore<Job> {
        &self.jobs
    }

    fn config_maps(&self) -> &dyn ResourceStore<ConfigMap> {
        &self.config_maps
    }

    fn nodes(&self) -> &dyn ResourceStore<Node> {
        &self.nodes
    }
}

/// One command seen by a [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

impl ExecCall {
    /// The command joined with spaces, for substring assertions.
    pub fn line(&self) -> String {
        self.command.join(" ")
    }
}

type ExecHandler = Arc<dyn Fn(&ExecCall) -> Result<ExecOutput, ClusterError> + Send + Sync>;

/// Executor that records commands and answers them through an optional
/// handler. Without a handler every command succeeds with empty output.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecCall>>,
    handler: RwLock<Option<ExecHandler>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: impl Fn(&ExecCall) -> Result<ExecOutput, ClusterError> + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ContainerExecutor for RecordingExecutor {
    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<ExecOutput, ClusterError> {
        let call = ExecCall {
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
        };
        self.calls.lock().push(call.clone());
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(&call),
            None => Ok(ExecOutput::default()),
        }
    }
}
