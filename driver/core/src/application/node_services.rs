// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node Services
//!
//! Builds every service the node agent needs from one configuration and
//! owns their lifecycle. Tests build a fresh instance per case.

use crate::application::batch_upgrade::BatchUpgrade;
use crate::application::graceful_upgrade::GracefulUpgrade;
use crate::application::mount_context::MountContext;
use crate::application::mount_selector::{MountManagers, MountSelector};
use crate::domain::cluster::{ClusterStore, ContainerExecutor, ListSelector};
use crate::domain::config::DriverConfig;
use crate::domain::mount::HostMounter;
use crate::domain::resource::{
    is_being_deleted, label, LABEL_RESOURCE_TYPE, LABEL_UPGRADE_UUID, RESOURCE_TYPE_MOUNT,
};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct NodeServices {
    pub ctx: Arc<MountContext>,
    pub selector: Arc<MountSelector>,
    pub upgrader: Arc<GracefulUpgrade>,
    pub batch: Arc<BatchUpgrade>,
}

impl NodeServices {
    /// Wire the services and take over FUSE descriptors of mount pods that
    /// outlived the previous node agent.
    pub async fn init(
        config: DriverConfig,
        store: Arc<dyn ClusterStore>,
        executor: Arc<dyn ContainerExecutor>,
        mounter: Arc<dyn HostMounter>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid driver configuration")?;
        let ctx = Arc::new(MountContext::new(Arc::new(config), store, executor));
        let selector = Arc::new(MountSelector::new(
            ctx.clone(),
            MountManagers::standard(&ctx, mounter),
        ));
        let upgrader = Arc::new(GracefulUpgrade::from_context(ctx.clone()));
        let batch = Arc::new(BatchUpgrade::new(ctx.clone(), upgrader.clone()));

        let services = Arc::new(Self {
            ctx,
            selector,
            upgrader,
            batch,
        });
        services.bootstrap_broker().await?;
        Ok(services)
    }

    async fn bootstrap_broker(&self) -> Result<()> {
        let selector = ListSelector::new()
            .label(LABEL_RESOURCE_TYPE, RESOURCE_TYPE_MOUNT)
            .on_node(self.ctx.node_name());
        let pods = self
            .ctx
            .store
            .pods()
            .list(&selector)
            .await
            .context("failed to list mount pods")?;
        let live: HashSet<String> = pods
            .iter()
            .filter(|p| !is_being_deleted(&p.metadata))
            .filter_map(|p| label(&p.metadata, LABEL_UPGRADE_UUID))
            .filter(|uuid| !uuid.is_empty())
            .map(String::from)
            .collect();

        let broker = &self.ctx.broker;
        let adopted = broker
            .bootstrap(&live)
            .await
            .context("failed to scan fd directories")?;
        let mut served = 0;
        for uuid in &live {
            match broker.ensure_serving(uuid).await {
                Ok(true) => served += 1,
                Ok(false) => {}
                Err(e) => warn!(instance = %uuid, "failed to serve fd socket: {}", e),
            }
        }
        info!(live = live.len(), adopted, served, "fd broker ready");
        Ok(())
    }

    /// Token cancelled by [`NodeServices::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.cancel.child_token()
    }

    /// Abort every wait, then stop every fd socket.
    pub async fn shutdown(&self) {
        info!("shutting down node services");
        self.ctx.cancel.cancel();
        self.ctx.broker.stop_all().await;
    }
}
