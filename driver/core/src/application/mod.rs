// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer
//!
//! Use cases of the node agent, built on the domain model and driven by the
//! presentation layer and the CLI.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`mount_selector`] | Strategy choice, daemonset fallback, unmount by target |
//! | [`pod_mount`] | Per-volume and shared mount pods |
//! | [`daemonset_mount`] | Mount daemonsets with scheduling rollback |
//! | [`process_mount`] | Host mounts without a cluster object |
//! | [`graceful_upgrade`] | Single-instance upgrade state machine |
//! | [`batch_upgrade`] | Node-wide upgrade fan-out |
//! | [`node_services`] | Wiring and lifecycle of the above |

pub mod batch_upgrade;
pub mod daemonset_mount;
pub mod graceful_upgrade;
pub mod mount_context;
pub mod mount_selector;
pub mod node_services;
pub mod pod_mount;
pub mod process_mount;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch_upgrade::{BatchAttachment, BatchPhase, BatchSummary, BatchUpgrade};
pub use daemonset_mount::DaemonSetMount;
pub use graceful_upgrade::{GracefulUpgrade, InstanceUpgrader, StepOutcome, UpgradeStep};
pub use mount_context::{JobWait, MountContext};
pub use mount_selector::{MountManagers, MountSelector, MountStrategy};
pub use node_services::NodeServices;
pub use pod_mount::{PodKeying, PodMount};
pub use process_mount::ProcessMount;
