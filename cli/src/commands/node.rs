// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `juicefs-csi node`: the long-running node agent.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use juicefs_csi_core::application::NodeServices;
use juicefs_csi_core::infrastructure::{KubeClusterStore, KubeContainerExecutor, SystemMounter};
use juicefs_csi_core::presentation::UpgradeSocketServer;

use super::load_driver_config;

/// Connect to the cluster, wire the node services and serve the upgrade
/// socket until SIGINT or SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_driver_config(config_path)?;
    let services = start_services(config).await?;

    let server = UpgradeSocketServer::bind(services.clone(), services.ctx.config.upgrade_socket.clone())
        .context("Failed to bind upgrade socket")?;
    let server_task = tokio::spawn(server.run(services.shutdown_token()));
    info!(node = %services.ctx.node_name(), "node agent running");

    wait_for_signal().await?;
    info!("shutdown signal received");

    services.shutdown().await;
    server_task.await.context("upgrade socket task panicked")?;
    info!("node agent stopped");
    Ok(())
}

pub(crate) async fn start_services(
    config: juicefs_csi_core::domain::config::DriverConfig,
) -> Result<Arc<NodeServices>> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = Arc::new(KubeClusterStore::new(client.clone(), &config.namespace));
    let executor = Arc::new(KubeContainerExecutor::new(client, &config.namespace));
    NodeServices::init(config, store, executor, Arc::new(SystemMounter::new())).await
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
