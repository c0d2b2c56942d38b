// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`juicefs-csi-core`)
//!
//! Local control surface that translates requests into application service
//! calls. **No business logic lives here**; all real work is delegated to
//! services in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`upgrade_socket`] | Unix socket, line protocol | Single and batch upgrades, fd broker listing |

pub mod upgrade_socket;

pub use upgrade_socket::{list_fds, trigger_batch_upgrade, trigger_upgrade, UpgradeSocketServer};
