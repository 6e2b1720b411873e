//! Bounded, time-limited in-memory result cache.
//!
//! Entries live in an LRU map capped at a fixed number of entries, and each
//! carries its own TTL. A `get` that finds an expired entry removes it and
//! reports a miss. Every `set` also sweeps out expired entries, so a client
//! that keeps caching fresh images does not accumulate dead ones. When the
//! map is full, the least recently used entry is evicted.
//!
//! Time comes from `tokio::time::Instant`, which lets tests move the clock
//! with `tokio::time::advance` instead of sleeping.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Capacity used by [`CacheManager::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// One cached value with its insertion time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Visible only while `now - stored_at < ttl`.
    pub fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Key/value store with per-entry expiry and an entry cap.
#[derive(Debug)]
pub struct CacheManager<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V> Default for CacheManager<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity(DEFAULT_CACHE_CAPACITY))),
        }
    }
}

/// A zero capacity is treated as one.
fn capacity(max_entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)
}

impl<V: Clone> CacheManager<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity(max_entries))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value` under `key`, replacing any previous entry. Expired
    /// entries are dropped first; if the cache is still full, the least
    /// recently used entry makes room.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: now,
            ttl,
        };
        let mut entries = self.lock();
        sweep(&mut entries, now);
        entries.put(key, entry);
    }

    /// Fetch a live value; an expired entry is removed and reported absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        let found = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().pop(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Change the entry cap. Shrinking evicts least recently used entries.
    pub fn resize(&self, max_entries: usize) {
        self.lock().resize(capacity(max_entries));
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        sweep(&mut self.lock(), Instant::now())
    }
}

fn sweep<V>(entries: &mut LruCache<String, CacheEntry<V>>, now: Instant) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| !entry.is_live(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}
