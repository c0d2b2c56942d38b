// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Infrastructure Layer
//!
//! Implementations of the domain's collaborator traits (Kubernetes and
//! in-memory stores, host mounter, workload templates) plus the plumbing the
//! application layer shares: the named lock table, conflict retry and
//! bounded polling, progress streams and the FUSE fd broker.

pub mod kube_store;
pub mod memory_store;
pub mod mounter;
pub mod named_lock;
pub mod passfd;
pub mod progress;
pub mod retry;
pub mod templates;

pub use kube_store::{KubeClusterStore, KubeContainerExecutor, KubeResourceStore};
pub use memory_store::{ExecCall, InMemoryClusterStore, InMemoryResourceStore, RecordingExecutor};
pub use mounter::{RecordingMounter, SystemMounter};
pub use named_lock::NamedLocks;
pub use passfd::FdBroker;
pub use progress::{ProgressReceiver, ProgressReporter};
pub use templates::DefaultMountTemplates;
