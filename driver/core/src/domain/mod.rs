// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Types and rules of mount-resource orchestration that do not depend on a
//! particular cluster client or socket implementation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Reference keys, settings, mount modes, scheduling rules,
//!   upgrade grammar and the collaborator traits the other layers implement

pub mod cluster;
pub mod config;
pub mod mount;
pub mod mount_config;
pub mod reference;
pub mod resource;
pub mod scheduling;
pub mod setting;
pub mod template;
pub mod upgrade;
pub mod version;
