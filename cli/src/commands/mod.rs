// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the JuiceFS CSI CLI

pub mod config;
pub mod mount;
pub mod node;
pub mod upgrade;

pub use self::config::ConfigCommand;
pub use self::mount::MountArgs;
pub use self::upgrade::UpgradeBatchArgs;

use anyhow::{Context, Result};
use juicefs_csi_core::domain::config::{DriverConfig, DriverConfigManifest};
use std::path::PathBuf;

/// Load the manifest (discovery plus environment overrides) and return its spec.
pub(crate) fn load_driver_config(config_path: Option<PathBuf>) -> Result<DriverConfig> {
    let manifest =
        DriverConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    Ok(manifest.spec)
}
