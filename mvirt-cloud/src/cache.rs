//! Timed cache with read modes.
//!
//! Entries are refreshed by a loader supplied on each read. Refreshes of the
//! same key are serialized by a per-key lock; readers that find a usable entry
//! never wait for that lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::lockmap::LockMap;

/// How a cache read treats existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Return a fresh entry, refresh once it is past its TTL.
    Default,
    /// Return any loaded entry regardless of age.
    Unsafe,
    /// Always reload from the control plane.
    ForceRefresh,
}

struct Slot<V> {
    value: Option<Arc<V>>,
    refreshed_at: Instant,
}

/// A string-keyed cache whose entries expire after `ttl`.
pub struct TimedCache<V> {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot<V>>>,
    refresh_locks: LockMap,
}

impl<V> TimedCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
            refresh_locks: LockMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn usable(&self, key: &str, mode: ReadMode) -> Option<Arc<V>> {
        let slots = self.slots();
        let slot = slots.get(key)?;
        let value = slot.value.as_ref()?;
        match mode {
            ReadMode::Unsafe => Some(value.clone()),
            ReadMode::Default if slot.refreshed_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// Read `key`, calling `loader` with the previous value when a refresh is needed.
    ///
    /// A loader returning `Ok(None)` records that the key does not exist; the
    /// next read loads again.
    pub async fn get<F, Fut>(&self, key: &str, mode: ReadMode, loader: F) -> Result<Option<Arc<V>>>
    where
        F: FnOnce(Option<Arc<V>>) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if mode != ReadMode::ForceRefresh {
            if let Some(value) = self.usable(key, mode) {
                return Ok(Some(value));
            }
        }

        let _refresh = self.refresh_locks.lock(key).await;
        if mode != ReadMode::ForceRefresh {
            // Another task may have refreshed while we waited.
            if let Some(value) = self.usable(key, mode) {
                return Ok(Some(value));
            }
        }

        let previous = self.peek(key);
        let loaded = loader(previous).await?.map(Arc::new);
        self.slots().insert(
            key.to_string(),
            Slot {
                value: loaded.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(loaded)
    }

    /// Current value of `key` without refreshing.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        self.slots().get(key).and_then(|slot| slot.value.clone())
    }

    /// All loaded values without refreshing.
    pub fn peek_all(&self) -> Vec<(String, Arc<V>)> {
        self.slots()
            .iter()
            .filter_map(|(k, slot)| slot.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Replace the value of `key`, resetting its age.
    pub fn set(&self, key: &str, value: V) {
        self.slots().insert(
            key.to_string(),
            Slot {
                value: Some(Arc::new(value)),
                refreshed_at: Instant::now(),
            },
        );
    }

    /// Rewrite a loaded value in place, keeping its age. Returns false if `key` is not loaded.
    pub fn modify(&self, key: &str, f: impl FnOnce(&V) -> V) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(slot) => match slot.value.as_ref() {
                Some(value) => {
                    slot.value = Some(Arc::new(f(value)));
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn delete(&self, key: &str) {
        self.slots().remove(key);
    }

    /// Drop every key for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.slots().retain(|k, _| keep(k));
    }

    /// Keys of loaded entries.
    pub fn keys(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    /// Serialize refreshes of `key` with an outside critical section.
    pub async fn lock_key(&self, key: &str) -> crate::lockmap::KeyGuard {
        self.refresh_locks.lock(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn load(
        cache: &TimedCache<String>,
        calls: &AtomicUsize,
        mode: ReadMode,
    ) -> Option<Arc<String>> {
        cache
            .get("key", mode, |_| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(format!("value-{n}")))
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_refreshes_after_ttl() {
        let cache = TimedCache::new(Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        assert_eq!(load(&cache, &calls, ReadMode::Default).await.unwrap().as_str(), "value-0");
        assert_eq!(load(&cache, &calls, ReadMode::Default).await.unwrap().as_str(), "value-0");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(load(&cache, &calls, ReadMode::Default).await.unwrap().as_str(), "value-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_ignores_ttl() {
        let cache = TimedCache::new(Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        load(&cache, &calls, ReadMode::Default).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(load(&cache, &calls, ReadMode::Unsafe).await.unwrap().as_str(), "value-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_loads_missing_entry() {
        let cache = TimedCache::new(Duration::from_secs(10));
        let calls = AtomicUsize::new(0);
        assert!(load(&cache, &calls, ReadMode::Unsafe).await.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_always_loads() {
        let cache = TimedCache::new(Duration::from_secs(10));
        let calls = AtomicUsize::new(0);

        load(&cache, &calls, ReadMode::Default).await;
        assert_eq!(
            load(&cache, &calls, ReadMode::ForceRefresh).await.unwrap().as_str(),
            "value-1"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_sees_previous_value() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(10));
        cache.set("key", 41);
        let value = cache
            .get("key", ReadMode::ForceRefresh, |previous| async move {
                Ok(previous.map(|v| *v + 1))
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some(&42));
    }

    #[tokio::test]
    async fn test_missing_value_reloads() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(10));
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let value = cache
                .get("key", ReadMode::Default, |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_error_keeps_old_value() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(10));
        cache.set("key", 1);
        let result = cache
            .get("key", ReadMode::ForceRefresh, |_| async {
                Err(crate::error::CloudError::unexpected("boom"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.peek("key").as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn test_modify_delete_retain() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(10));
        cache.set("a/x", 1);
        cache.set("a/y", 2);
        assert!(cache.modify("a/x", |v| v + 10));
        assert!(!cache.modify("missing", |v| v + 10));
        assert_eq!(cache.peek("a/x").as_deref(), Some(&11));

        cache.retain(|k| k.ends_with("/y"));
        assert!(cache.peek("a/x").is_none());

        cache.delete("a/y");
        assert!(cache.keys().is_empty());
    }
}
