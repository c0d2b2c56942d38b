// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! JuiceFS CSI Core
//!
//! Mount-lifecycle orchestration for the node agent: strategy selection,
//! reference-counted mount workloads, FUSE descriptor handoff and graceful
//! upgrades.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Wires the domain, application, infrastructure and
//!   presentation layers into one crate

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
