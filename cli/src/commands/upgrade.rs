// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Upgrade socket client commands
//!
//! Commands: upgrade, upgrade-batch, fds

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use juicefs_csi_core::domain::upgrade::{
    UpgradeAction, UpgradeRequest, BATCH_FAIL, BATCH_SUCCESS, FAIL, POD_FAIL, SUCCESS,
};
use juicefs_csi_core::presentation::{list_fds, trigger_batch_upgrade, trigger_upgrade};

use super::load_driver_config;

#[derive(Args, Debug, Clone)]
pub struct UpgradeBatchArgs {
    /// Swap binaries inside the running pods instead of recreating them
    #[arg(long)]
    pub no_recreate: bool,

    /// Mount pods upgraded concurrently
    #[arg(long, default_value_t = 1)]
    pub worker: i64,

    /// Exit successfully even when some mount pods failed
    #[arg(long)]
    pub ignore_error: bool,

    /// Only upgrade mount pods of these volumes, slash separated
    #[arg(long, value_name = "ID/ID/...")]
    pub unique_ids: Option<String>,
}

impl UpgradeBatchArgs {
    pub fn to_request(&self) -> UpgradeRequest {
        let mut request = UpgradeRequest::batch(action(self.no_recreate));
        request.worker = self.worker;
        request.ignore_error = self.ignore_error;
        request.unique_ids = self
            .unique_ids
            .as_deref()
            .map(|ids| ids.split('/').filter(|id| !id.is_empty()).map(String::from).collect())
            .unwrap_or_default();
        request
    }
}

fn action(no_recreate: bool) -> UpgradeAction {
    if no_recreate {
        UpgradeAction::InPlace
    } else {
        UpgradeAction::Recreate
    }
}

fn resolve_socket(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> Result<PathBuf> {
    match socket {
        Some(socket) => Ok(socket),
        None => Ok(load_driver_config(config_path)?.upgrade_socket),
    }
}

fn print_line(line: &str) {
    if line.starts_with(FAIL) || line.starts_with(BATCH_FAIL) || line.starts_with(POD_FAIL) {
        println!("{}", line.red());
    } else if line.starts_with(SUCCESS) || line.starts_with(BATCH_SUCCESS) {
        println!("{}", line.green());
    } else {
        println!("{line}");
    }
}

/// Map the terminal line of a stream to the process outcome.
pub fn outcome(last: &str, ignore_error: bool) -> Result<()> {
    let failed = last.starts_with(BATCH_FAIL) || last.split_whitespace().next() == Some(FAIL);
    if failed && !ignore_error {
        bail!("upgrade failed: {last}");
    }
    Ok(())
}

pub async fn single(
    config_path: Option<PathBuf>,
    socket: Option<PathBuf>,
    name: &str,
    no_recreate: bool,
) -> Result<()> {
    let socket = resolve_socket(config_path, socket)?;
    let last = trigger_upgrade(&socket, name, action(no_recreate), print_line).await?;
    outcome(&last, false)
}

pub async fn batch(config_path: Option<PathBuf>, socket: Option<PathBuf>, args: UpgradeBatchArgs) -> Result<()> {
    let socket = resolve_socket(config_path, socket)?;
    let request = args.to_request();
    let last = trigger_batch_upgrade(&socket, &request, print_line).await?;
    if args.ignore_error && last.starts_with(BATCH_FAIL) {
        println!("{}", "Some mount pods failed; ignoring as requested".yellow());
    }
    outcome(&last, args.ignore_error)
}

pub async fn fds(config_path: Option<PathBuf>, socket: Option<PathBuf>) -> Result<()> {
    let socket = resolve_socket(config_path, socket)?;
    let table = list_fds(&socket).await?;
    if table.trim().is_empty() {
        println!("{}", "No FUSE descriptors held".dimmed());
    } else {
        print!("{table}");
    }
    Ok(())
}
