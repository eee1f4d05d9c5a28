//! Cache backend implementations.

use super::key::CacheKey;
use crate::clock::{self, Clock};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A value read from a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub data: Bytes,
    /// How much longer the tier promises the value is fresh, if it knows.
    pub ttl_remaining: Option<Duration>,
}

impl CachedValue {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ttl_remaining: None,
        }
    }

    pub fn with_ttl_remaining(mut self, ttl: Duration) -> Self {
        self.ttl_remaining = Some(ttl);
        self
    }
}

/// Capability every cache tier exposes.
///
/// Implementations must never return an entry past its TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>>;
    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

#[derive(Clone)]
struct CacheEntry {
    data: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process LRU tier with per-entry TTL, expired lazily on access.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, clock::system())
    }

    pub fn with_clock(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let (data, expires_at) = match entries.get(key.as_str()) {
            Some(entry) if !entry.is_expired(now) => (entry.data.clone(), entry.expires_at),
            Some(_) => {
                entries.pop(key.as_str());
                return Ok(None);
            }
            None => return Ok(None),
        };
        Ok(Some(CachedValue {
            data,
            ttl_remaining: Some(expires_at.saturating_duration_since(now)),
        }))
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.lock();
        // a dead LRU tail goes first; anything else expired is dropped on its next read
        let tail_expired = entries
            .peek_lru()
            .map_or(false, |(_, tail)| tail.is_expired(now));
        if tail_expired {
            entries.pop_lru();
        }
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        entries.push(
            key.as_str().to_owned(),
            CacheEntry {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.lock().pop(key.as_str()).is_some())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .peek(key.as_str())
            .map(|e| !e.is_expired(now))
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Tier that stores nothing; every lookup misses.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<CachedValue>> {
        Ok(None)
    }
    async fn set(&self, _: &CacheKey, _: Bytes, _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
