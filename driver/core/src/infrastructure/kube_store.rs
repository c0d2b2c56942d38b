// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster store backed by the Kubernetes API.

use crate::domain::cluster::{ClusterError, ClusterStore, ContainerExecutor, ExecOutput, ListSelector, ResourceStore};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub struct KubeResourceStore<K> {
    api: Api<K>,
}

impl<K> KubeResourceStore<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

fn list_params(selector: &ListSelector) -> ListParams {
    let mut params = ListParams::default();
    let labels = selector.label_selector();
    if !labels.is_empty() {
        params = params.labels(&labels);
    }
    let fields = selector.field_selector();
    if !fields.is_empty() {
        params = params.fields(&fields);
    }
    params
}

#[async_trait]
impl<K> ResourceStore<K> for KubeResourceStore<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ClusterError> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, object: &K) -> Result<K, ClusterError> {
        Ok(self.api.create(&PostParams::default(), object).await?)
    }

    async fn update(&self, object: &K) -> Result<K, ClusterError> {
        let name = object.name_any();
        Ok(self.api.replace(&name, &PostParams::default(), object).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClusterError> {
        self.api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn list(&self, selector: &ListSelector) -> Result<Vec<K>, ClusterError> {
        Ok(self.api.list(&list_params(selector)).await?.items)
    }
}

/// Namespaced stores for mount workloads, cluster-wide store for nodes.
pub struct KubeClusterStore {
    pods: KubeResourceStore<Pod>,
    daemon_sets: KubeResourceStore<DaemonSet>,
    secrets: KubeResourceStore<Secret>,
    jobs: KubeResourceStore<Job>,
    config_maps: KubeResourceStore<ConfigMap>,
    nodes: KubeResourceStore<Node>,
}

impl KubeClusterStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: KubeResourceStore::new(Api::namespaced(client.clone(), namespace)),
            daemon_sets: KubeResourceStore::new(Api::namespaced(client.clone(), namespace)),
            secrets: KubeResourceStore::new(Api::namespaced(client.clone(), namespace)),
            jobs: KubeResourceStore::new(Api::namespaced(client.clone(), namespace)),
            config_maps: KubeResourceStore::new(Api::namespaced(client.clone(), namespace)),
            nodes: KubeResourceStore::new(Api::all(client)),
        }
    }
}

impl ClusterStore for KubeClusterStore {
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

pub struct KubeContainerExecutor {
    pods: Api<Pod>,
}

impl KubeContainerExecutor {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ContainerExecutor for KubeContainerExecutor {
    async fn exec(&self, pod: &str, container: &str, command: &[String]) -> Result<ExecOutput, ClusterError> {
        debug!(pod, container, ?command, "exec in container");
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self.pods.exec(pod, command.to_vec(), &params).await?;

        let mut output = ExecOutput::default();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output.stdout)
                .await
                .map_err(|e| ClusterError::Api(format!("read stdout of {pod}: {e}")))?;
        }
        if let Some(mut stderr) = process.stderr() {
            stderr
                .read_to_string(&mut output.stderr)
                .await
                .map_err(|e| ClusterError::Api(format!("read stderr of {pod}: {e}")))?;
        }

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| ClusterError::Api(format!("exec in {pod}: {e}")))?;

        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => Err(ClusterError::Api(format!(
                "command in {pod}/{container} failed: {} {}",
                s.message.unwrap_or_default(),
                output.stderr.trim()
            ))),
            _ => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_skip_empty_selectors() {
        let params = list_params(&ListSelector::new());
        assert!(params.label_selector.is_none());
        assert!(params.field_selector.is_none());

        let params = list_params(&ListSelector::new().label("app", "mount").on_node("n1"));
        assert_eq!(params.label_selector.as_deref(), Some("app=mount"));
        assert_eq!(params.field_selector.as_deref(), Some("spec.nodeName=n1"));
    }
}
