// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Construction of the cluster objects backing a mount.
//!
//! Managers decide *when* objects exist and which labels and references they
//! carry; a [`MountTemplates`] implementation decides *what* the workload
//! looks like (containers, volumes, environment).

use crate::domain::setting::MountSetting;
use crate::domain::upgrade::UpgradeAction;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{NodeAffinity, Pod, Secret};

/// Identity stamped onto a mount workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountIdentity {
    pub name: String,
    /// Value of the stable identity label.
    pub unique_id: String,
    pub config_hash: String,
    pub upgrade_uuid: String,
    pub mount_path: String,
}

pub trait MountTemplates: Send + Sync {
    fn mount_pod(&self, identity: &MountIdentity, setting: &MountSetting, node: &str) -> Pod;

    fn daemon_set(
        &self,
        identity: &MountIdentity,
        setting: &MountSetting,
        node_affinity: Option<&NodeAffinity>,
    ) -> DaemonSet;

    fn secret(&self, name: &str, setting: &MountSetting) -> Secret;

    /// Short-lived probe using the target's image. It writes the version
    /// marker and, for in-place upgrades, the new binary into the instance's
    /// fd-exchange directory.
    fn canary_job(&self, name: &str, target: &Pod, node: &str, upgrade_uuid: &str, action: UpgradeAction) -> Job;

    fn clean_cache_job(&self, name: &str, setting: &MountSetting, node: &str) -> Job;
}
