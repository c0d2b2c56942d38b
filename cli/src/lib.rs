// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! JuiceFS CSI CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command handlers and logging setup for the `juicefs-csi` binary

pub mod commands;
pub mod logging;
