// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reference Keys
//!
//! A mount resource records every consumer relying on it as one annotation:
//! the key is a digest of the consumer's target path and the value is the
//! target path itself. Keys carry a fixed prefix so they can be told apart
//! from unrelated annotations.
//!
//! The same scheme is used for pods and daemonsets, so a target that moves
//! between resource kinds (e.g. after a scheduling fallback) is always
//! recognised by the same key.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Prefix shared by every reference annotation key.
pub const REFERENCE_PREFIX: &str = "juicefs-";

/// Kubernetes annotation/label name length ceiling.
const MAX_KEY_LEN: usize = 63;

/// Deterministic reference key for a target path.
pub fn reference_key(target: &str) -> String {
    let digest = hex::encode(Sha256::digest(target.as_bytes()));
    let mut key = format!("{REFERENCE_PREFIX}{digest}");
    key.truncate(MAX_KEY_LEN);
    key
}

/// True when `key` has the shape of a reference key (prefix followed by the
/// truncated lowercase hex digest).
pub fn is_reference_key(key: &str) -> bool {
    match key.strip_prefix(REFERENCE_PREFIX) {
        Some(rest) => {
            rest.len() == MAX_KEY_LEN - REFERENCE_PREFIX.len()
                && rest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// True iff at least one annotation is a self-consistent reference, i.e. its
/// key equals `reference_key(value)`.
pub fn has_reference(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .map(|a| a.iter().any(|(k, v)| *k == reference_key(v)))
        .unwrap_or(false)
}

/// Number of annotations keyed as references.
pub fn count_references(annotations: Option<&BTreeMap<String, String>>) -> usize {
    annotations
        .map(|a| a.keys().filter(|k| is_reference_key(k)).count())
        .unwrap_or(0)
}

/// Subset of `annotations` that are references. Used to carry references
/// across a rebuild while dropping everything tied to the old spec.
pub fn reference_annotations(annotations: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    annotations
        .map(|a| {
            a.iter()
                .filter(|(k, _)| is_reference_key(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `target` is referenced from `annotations`.
pub fn references_target(annotations: Option<&BTreeMap<String, String>>, target: &str) -> bool {
    annotations
        .map(|a| a.contains_key(&reference_key(target)))
        .unwrap_or(false)
}

/// Insert the reference for `target`. Returns false when it was already present.
pub fn insert_reference(annotations: &mut BTreeMap<String, String>, target: &str) -> bool {
    annotations
        .insert(reference_key(target), target.to_string())
        .is_none()
}

/// Remove the reference for `target`. Returns false when it was absent.
pub fn remove_reference(annotations: &mut BTreeMap<String, String>, target: &str) -> bool {
    annotations.remove(&reference_key(target)).is_some()
}
