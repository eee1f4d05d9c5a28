//! Tiered read-through cache manager.

use super::backend::{CacheBackend, CachedValue};
use super::key::CacheKey;
use super::loader::{NoOrigin, OriginLoader};
use crate::{Error, Result};
use bytes::Bytes;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Values larger than this are served but never cached.
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

/// One layer of the cache: a backend plus the TTL and timeout it is used with.
pub struct Tier {
    name: String,
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    timeout: Option<Duration>,
}

impl Tier {
    pub fn new(name: impl Into<String>, backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            backend,
            ttl,
            timeout: None,
        }
    }

    /// Bound every call into this tier; an expired call counts as a miss.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    async fn run<T, F>(&self, fut: F) -> std::result::Result<T, TierFailure>
    where
        F: Future<Output = Result<T>>,
    {
        let res = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| TierFailure::Timeout)?,
            None => fut.await,
        };
        res.map_err(TierFailure::Error)
    }
}

enum TierFailure {
    Timeout,
    Error(Error),
}

impl TierFailure {
    fn into_error(self, tier: &Tier) -> Error {
        match self {
            TierFailure::Timeout => Error::tier(tier.name(), "timed out"),
            TierFailure::Error(e) => e,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub requests: u64,
    pub origin_loads: u64,
    pub origin_not_found: u64,
    pub origin_errors: u64,
    pub sets: u64,
    pub invalidations: u64,
    pub tiers: Vec<TierStats>,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.tiers.iter().map(|t| t.hits).sum()
    }

    /// Share of requests answered by some tier.
    pub fn hit_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits() as f64 / self.requests as f64
        }
    }
}

#[derive(Default)]
struct AtomicTierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    writes: AtomicU64,
}

#[derive(Default)]
struct AtomicStats {
    requests: AtomicU64,
    origin_loads: AtomicU64,
    origin_not_found: AtomicU64,
    origin_errors: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
}

/// A looked-up value and how many leading tiers should receive a copy of it.
struct Resolved {
    value: CachedValue,
    fill_upto: usize,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Resolves keys through an ordered chain of tiers (fastest first) and an origin loader.
///
/// - Read-through: a hit in tier `i` is copied into tiers `0..i` before returning
/// - Write-through: [`set`](Self::set) writes every tier with that tier's TTL
/// - Tier errors and timeouts are misses; only origin outcomes reach the caller
pub struct TieredCache {
    config: CacheConfig,
    tiers: Vec<Tier>,
    loader: Arc<dyn OriginLoader>,
    stats: AtomicStats,
    tier_stats: Vec<AtomicTierStats>,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::new()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    fn prefix_key(&self, key: &CacheKey) -> CacheKey {
        match self.config.key_prefix {
            Some(ref p) => key.prefixed(p),
            None => key.clone(),
        }
    }

    /// Look `key` up through the tiers, falling back to the origin loader.
    ///
    /// Fails with [`Error::NotFound`] or [`Error::Load`] when every tier misses
    /// and the origin cannot supply a value; nothing is cached in that case.
    pub async fn get(&self, key: &CacheKey) -> Result<Bytes> {
        bump(&self.stats.requests);
        let stored = self.prefix_key(key);
        let resolved = self.resolve(key, &stored).await?;
        Ok(self.settle(&stored, resolved).await)
    }

    /// [`get`](Self::get) that returns [`Error::Cancelled`] as soon as `cancel` fires.
    ///
    /// Cancellation applies until the value is known. A cancelled call writes
    /// nothing to any tier; once the value is known the tier fill runs to
    /// completion, bounded by the tier timeouts.
    pub async fn get_with_cancel(&self, key: &CacheKey, cancel: &CancellationToken) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        bump(&self.stats.requests);
        let stored = self.prefix_key(key);
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = self.resolve(key, &stored) => res?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.settle(&stored, resolved).await)
    }

    /// Finds the value without writing to any tier.
    async fn resolve(&self, key: &CacheKey, stored: &CacheKey) -> Result<Resolved> {
        if self.config.enabled {
            for (idx, tier) in self.tiers.iter().enumerate() {
                let stats = &self.tier_stats[idx];
                match tier.run(tier.backend.get(stored)).await {
                    Ok(Some(found)) => {
                        bump(&stats.hits);
                        return Ok(Resolved { value: found, fill_upto: idx });
                    }
                    Ok(None) => bump(&stats.misses),
                    Err(TierFailure::Timeout) => {
                        bump(&stats.timeouts);
                        tracing::warn!(key = %key, tier = %tier.name, "tier lookup timed out, treating as miss");
                    }
                    Err(TierFailure::Error(e)) => {
                        bump(&stats.errors);
                        tracing::warn!(key = %key, tier = %tier.name, error = %e, "tier lookup failed, treating as miss");
                    }
                }
            }
        }

        let data = self.load(key).await?;
        let fill_upto = if self.config.enabled { self.tiers.len() } else { 0 };
        Ok(Resolved {
            value: CachedValue::new(data),
            fill_upto,
        })
    }

    /// Copies a resolved value into the tiers in front of where it was found.
    async fn settle(&self, stored: &CacheKey, resolved: Resolved) -> Bytes {
        if resolved.fill_upto > 0 {
            if resolved.fill_upto < self.tiers.len() {
                tracing::debug!(key = %stored, tier = %self.tiers[resolved.fill_upto].name, "promoting to faster tiers");
            }
            self.fill(stored, &resolved.value, resolved.fill_upto).await;
        }
        resolved.value.data
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<T> {
        let data = self.get(key).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn load(&self, key: &CacheKey) -> Result<Bytes> {
        match self.loader.load(key).await {
            Ok(Some(data)) => {
                bump(&self.stats.origin_loads);
                tracing::debug!(key = %key, bytes = data.len(), "loaded from origin");
                Ok(data)
            }
            Ok(None) => {
                bump(&self.stats.origin_not_found);
                Err(Error::NotFound {
                    key: key.to_string(),
                })
            }
            Err(source) => {
                bump(&self.stats.origin_errors);
                tracing::warn!(key = %key, error = %source, "origin load failed");
                Err(Error::Load {
                    key: key.to_string(),
                    source,
                })
            }
        }
    }

    /// Best-effort population of tiers `0..upto`; failures are logged only.
    async fn fill(&self, stored: &CacheKey, value: &CachedValue, upto: usize) {
        if value.data.len() > self.config.max_entry_size {
            tracing::debug!(key = %stored, bytes = value.data.len(), "value exceeds max_entry_size, not cached");
            return;
        }
        let writes = self.tiers[..upto]
            .iter()
            .enumerate()
            .filter_map(|(idx, tier)| {
                // never extend freshness past what the source tier promised
                let ttl = value
                    .ttl_remaining
                    .map_or(tier.ttl, |remaining| remaining.min(tier.ttl));
                if ttl.is_zero() {
                    return None;
                }
                Some(async move {
                    (
                        idx,
                        tier.run(tier.backend.set(stored, value.data.clone(), ttl))
                            .await,
                    )
                })
            });
        for (idx, res) in join_all(writes).await {
            self.record_write(idx, res);
        }
    }

    fn record_write(&self, idx: usize, res: std::result::Result<(), TierFailure>) -> Option<Error> {
        let tier = &self.tiers[idx];
        let stats = &self.tier_stats[idx];
        match res {
            Ok(()) => {
                bump(&stats.writes);
                None
            }
            Err(failure) => {
                if matches!(failure, TierFailure::Timeout) {
                    bump(&stats.timeouts);
                } else {
                    bump(&stats.errors);
                }
                let err = failure.into_error(tier);
                tracing::warn!(tier = %tier.name, error = %err, "tier write failed");
                Some(err)
            }
        }
    }

    /// Write `value` through every tier, each with its own TTL.
    ///
    /// Every tier is attempted; the first tier failure is returned afterwards so
    /// the caller knows the tiers may disagree.
    pub async fn set(&self, key: &CacheKey, value: impl Into<Bytes>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let value: Bytes = value.into();
        if value.len() > self.config.max_entry_size {
            // an oversized write must not leave the previous value behind
            self.invalidate(key).await?;
            return Ok(());
        }
        bump(&self.stats.sets);
        let stored = self.prefix_key(key);
        let writes = self.tiers.iter().enumerate().map(|(idx, tier)| {
            let value = value.clone();
            let stored = &stored;
            async move { (idx, tier.run(tier.backend.set(stored, value, tier.ttl)).await) }
        });
        let mut first_err = None;
        for (idx, res) in join_all(writes).await {
            if let Some(e) = self.record_write(idx, res) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub async fn set_json<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.set(key, data).await
    }

    /// Remove `key` from every tier. Returns whether any tier held it.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        bump(&self.stats.invalidations);
        let stored = self.prefix_key(key);
        let deletes = self
            .tiers
            .iter()
            .map(|tier| tier.run(tier.backend.delete(&stored)));
        let mut removed = false;
        let mut first_err = None;
        for (idx, res) in join_all(deletes).await.into_iter().enumerate() {
            match res {
                Ok(found) => removed |= found,
                Err(failure) => {
                    let tier = &self.tiers[idx];
                    bump(&self.tier_stats[idx].errors);
                    let err = failure.into_error(tier);
                    tracing::warn!(key = %key, tier = %tier.name, error = %err, "tier invalidation failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Empty every tier.
    pub async fn clear(&self) -> Result<()> {
        let clears = self.tiers.iter().map(|tier| tier.run(tier.backend.clear()));
        let mut first_err = None;
        for (tier, res) in self.tiers.iter().zip(join_all(clears).await) {
            if let Err(failure) = res {
                first_err.get_or_insert(failure.into_error(tier));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            requests: load(&self.stats.requests),
            origin_loads: load(&self.stats.origin_loads),
            origin_not_found: load(&self.stats.origin_not_found),
            origin_errors: load(&self.stats.origin_errors),
            sets: load(&self.stats.sets),
            invalidations: load(&self.stats.invalidations),
            tiers: self
                .tiers
                .iter()
                .zip(&self.tier_stats)
                .map(|(tier, s)| TierStats {
                    name: tier.name.clone(),
                    hits: load(&s.hits),
                    misses: load(&s.misses),
                    errors: load(&s.errors),
                    timeouts: load(&s.timeouts),
                    writes: load(&s.writes),
                })
                .collect(),
        }
    }
}

pub struct TieredCacheBuilder {
    config: CacheConfig,
    tiers: Vec<Tier>,
    loader: Option<Arc<dyn OriginLoader>>,
}

impl TieredCacheBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            tiers: Vec::new(),
            loader: None,
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a tier; tiers are consulted in insertion order.
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Origin consulted on a full miss. Defaults to [`NoOrigin`].
    pub fn loader(mut self, loader: Arc<dyn OriginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<TieredCache> {
        if self.tiers.is_empty() {
            return Err(Error::invalid_field(
                "cache.tiers",
                "a tiered cache needs at least one tier",
            ));
        }
        let mut seen = HashSet::new();
        for (idx, tier) in self.tiers.iter().enumerate() {
            if !seen.insert(tier.name.as_str()) {
                return Err(Error::invalid_field(
                    format!("cache.tiers[{}].name", idx),
                    format!("duplicate tier name '{}'", tier.name),
                ));
            }
            if tier.ttl.is_zero() {
                return Err(Error::invalid_field(
                    format!("cache.tiers[{}].ttl_ms", idx),
                    "tier ttl must be longer than zero",
                ));
            }
        }
        let tier_stats = self.tiers.iter().map(|_| AtomicTierStats::default()).collect();
        Ok(TieredCache {
            config: self.config,
            tiers: self.tiers,
            loader: self.loader.unwrap_or_else(|| Arc::new(NoOrigin)),
            stats: AtomicStats::default(),
            tier_stats,
        })
    }
}

impl Default for TieredCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
