// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # JuiceFS CSI Node CLI
//!
//! The `juicefs-csi` binary runs the node agent and talks to a running agent
//! over its upgrade socket.
//!
//! ## Commands
//!
//! - `juicefs-csi node` - Run the node agent until SIGINT/SIGTERM
//! - `juicefs-csi upgrade|upgrade-batch|fds` - Upgrade socket client
//! - `juicefs-csi mount|unmount` - One-off mount operations
//! - `juicefs-csi config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use juicefs_csi::commands::{self, ConfigCommand, MountArgs, UpgradeBatchArgs};
use juicefs_csi::logging::{init_logging, LogFormat};

/// JuiceFS CSI node agent
#[derive(Parser)]
#[command(name = "juicefs-csi")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "JFS_CSI_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "JFS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Upgrade socket of the node agent (default: from configuration)
    #[arg(long, global = true, env = "JFS_UPGRADE_SOCKET", value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent
    Node,

    /// Upgrade one mount pod
    Upgrade {
        /// Mount pod name
        name: String,

        /// Swap the binary inside the running pod instead of recreating it
        #[arg(long)]
        no_recreate: bool,
    },

    /// Upgrade every eligible mount pod on this node
    #[command(name = "upgrade-batch")]
    UpgradeBatch(UpgradeBatchArgs),

    /// List the FUSE descriptors held by the node agent
    Fds,

    /// Mount a volume described by a settings file
    Mount(MountArgs),

    /// Release the mount behind a target path
    Unmount {
        #[arg(long)]
        target: String,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Commands::Node => commands::node::run(cli.config).await,
        Commands::Upgrade { name, no_recreate } => {
            commands::upgrade::single(cli.config, cli.socket, &name, no_recreate).await
        }
        Commands::UpgradeBatch(args) => commands::upgrade::batch(cli.config, cli.socket, args).await,
        Commands::Fds => commands::upgrade::fds(cli.config, cli.socket).await,
        Commands::Mount(args) => commands::mount::mount(cli.config, args).await,
        Commands::Unmount { target } => commands::mount::unmount(cli.config, &target).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
    }
}
