// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-local lock table keyed by resource name.
//!
//! Mount, unmount and upgrade of the same mount resource serialize on the
//! resource's entry; different names never contend. Entries are created on
//! demand and pruned once no task holds or waits on them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a critical section on one name.
pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> NamedLockGuard {
        let entry = {
            let mut locks = self.locks.lock();
            // only the map references an idle entry
            locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        debug!(lock = %name, "acquiring resource lock");
        let guard = entry.lock_owned().await;
        NamedLockGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
