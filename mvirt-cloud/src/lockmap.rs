//! Per-key async locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of named async mutexes.
///
/// Locking a key returns an owned guard; dropping the guard unlocks the key.
/// Entries are created on first use and dropped again once no guard or waiter
/// references them.
#[derive(Default)]
pub struct LockMap {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guard for a key held in a [`LockMap`].
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only this map and idle entries hold a reference; prune them.
        entries.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for and take the lock on `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self.entry(key);
        KeyGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Take the lock on `key` if nobody holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let lock = self.entry(key);
        lock.try_lock_owned().ok().map(|guard| KeyGuard { _guard: guard })
    }
}
