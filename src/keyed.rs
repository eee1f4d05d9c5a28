//! Bounded map of per-key state.
//!
//! The outer lock only guards lookup and insertion; callers get an `Arc` to
//! the per-key value and take that value's own lock afterwards, so work on
//! different keys never serialises on a shared state lock. The map holds at
//! most `max_keys` entries and evicts the least recently used key.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_MAX_KEYS: usize = 10_000;

pub struct KeyedMap<V> {
    entries: Mutex<LruCache<String, Arc<V>>>,
}

impl<V> KeyedMap<V> {
    pub fn new(max_keys: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<V>>> {
        // LruCache operations never leave the map half-updated.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the value for `key`, creating it with `make` on first reference.
    pub fn get_or_insert_with(&self, key: &str, make: impl FnOnce() -> V) -> Arc<V> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            return Arc::clone(existing);
        }
        let value = Arc::new(make());
        if let Some((evicted, _)) = entries.push(key.to_owned(), Arc::clone(&value)) {
            tracing::trace!(evicted = %evicted, "per-key state evicted (capacity reached)");
        }
        value
    }

    /// Looks up `key`, marking it most recently used. Never inserts.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.lock().get(key).cloned()
    }

    /// Looks up `key` without touching its recency.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        self.lock().peek(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<V>> {
        self.lock().pop(key)
    }

    /// Drops every entry for which `keep` returns false; returns how many were dropped.
    ///
    /// Entries still referenced outside the map are always kept: a caller
    /// holding one may be about to update it.
    pub fn retain(&self, mut keep: impl FnMut(&str, &V) -> bool) -> usize {
        let mut entries = self.lock();
        let victims: Vec<String> = entries
            .iter()
            .filter(|(k, v)| Arc::strong_count(v) == 1 && !keep(k.as_str(), v.as_ref()))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &victims {
            entries.pop(k);
        }
        victims.len()
    }

    /// Snapshot of all entries, most recently used first.
    pub fn entries(&self) -> Vec<(String, Arc<V>)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<V> Default for KeyedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEYS)
    }
}
