// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! One-off mount and unmount against the cluster
//!
//! These run the same selector the node agent uses. FUSE descriptors of mount
//! pods created here are served only while the command runs; the node agent
//! takes them over when it next starts.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

use juicefs_csi_core::domain::setting::MountSetting;

use super::load_driver_config;
use super::node::start_services;

#[derive(Args, Debug, Clone)]
pub struct MountArgs {
    /// Mount settings as YAML or JSON
    #[arg(long, value_name = "FILE")]
    pub setting: PathBuf,

    /// Override the target path from the settings file
    #[arg(long)]
    pub target: Option<String>,
}

pub fn read_setting(path: &Path, target: Option<String>) -> Result<MountSetting> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut setting: MountSetting = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse mount settings in {}", path.display()))?;
    if let Some(target) = target {
        setting.target_path = target;
    }
    anyhow::ensure!(!setting.target_path.is_empty(), "mount settings need a target path");
    anyhow::ensure!(!setting.unique_id.is_empty(), "mount settings need a unique id");
    Ok(setting)
}

pub async fn mount(config_path: Option<PathBuf>, args: MountArgs) -> Result<()> {
    let setting = read_setting(&args.setting, args.target)?;
    let services = start_services(load_driver_config(config_path)?).await?;

    let result = services.selector.mount(&setting).await;
    services.shutdown().await;
    let mounted = result.context("Mount failed")?;

    println!(
        "{}",
        format!("✓ Mounted {} through {} {}", setting.target_path, mounted.kind, mounted.name).green()
    );
    println!("{}", serde_json::to_string_pretty(&mounted)?);
    Ok(())
}

pub async fn unmount(config_path: Option<PathBuf>, target: &str) -> Result<()> {
    let services = start_services(load_driver_config(config_path)?).await?;
    let result = services.selector.unmount(target).await;
    services.shutdown().await;
    result.context("Unmount failed")?;

    println!("{}", format!("✓ Released {target}").green());
    Ok(())
}
