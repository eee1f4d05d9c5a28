//! # Tiered Cache
//!
//! Read-through, write-through caching over an ordered chain of tiers.
//!
//! ## Overview
//!
//! A lookup walks the tiers fastest first. The first hit is returned and
//! copied into every faster tier it skipped. When all tiers miss, the
//! [`OriginLoader`] is asked; a value it supplies is written to every tier,
//! while "not found" and load failures are reported and never cached.
//!
//! A tier that errors or exceeds its timeout counts as a miss. The cache only
//! fails a read because of what the origin says.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TieredCache`] | Ordered tiers, promotion, write-through and statistics |
//! | [`Tier`] | A backend with its TTL and optional per-call timeout |
//! | [`CacheBackend`] | Trait every tier implements |
//! | [`MemoryCache`] | In-process LRU tier with per-entry TTL |
//! | [`HttpCache`] | Remote tier speaking a small HTTP key/value protocol |
//! | [`NullCache`] | Tier that never stores anything |
//! | [`OriginLoader`] | Source of truth consulted on a full miss |
//! | [`CacheKeyBuilder`] | Stable hashed keys from structured parameters |
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use resilience_kit::cache::{CacheKey, FnLoader, MemoryCache, Tier, TieredCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> resilience_kit::Result<()> {
//! let cache = TieredCache::builder()
//!     .tier(Tier::new("l1", Arc::new(MemoryCache::new(1_000)), Duration::from_secs(60)))
//!     .tier(Tier::new("l2", Arc::new(MemoryCache::new(100_000)), Duration::from_secs(3600)))
//!     .loader(Arc::new(FnLoader::new(|key: CacheKey| async move {
//!         Ok::<_, anyhow::Error>(Some(Bytes::from(format!("row for {}", key))))
//!     })))
//!     .build()?;
//!
//! let value = cache.get(&CacheKey::from("user:7")).await?;
//! assert_eq!(value, Bytes::from("row for user:7"));
//! # Ok(())
//! # }
//! ```

mod backend;
mod key;
mod loader;
mod manager;
pub mod remote;

pub use backend::{CacheBackend, CachedValue, MemoryCache, NullCache};
pub use key::{CacheKey, CacheKeyBuilder};
pub use loader::{FnLoader, NoOrigin, OriginLoader};
pub use manager::{CacheConfig, CacheStats, Tier, TierStats, TieredCache, TieredCacheBuilder};
pub use remote::HttpCache;
