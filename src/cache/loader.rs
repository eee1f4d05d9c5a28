//! Origin collaborator consulted when every tier misses.

use super::key::CacheKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;

#[async_trait]
pub trait OriginLoader: Send + Sync {
    /// Fetch `key` from the source of truth.
    ///
    /// `Ok(None)` means the key does not exist upstream; `Err` means the origin
    /// could not answer. Neither outcome is cached.
    async fn load(&self, key: &CacheKey) -> anyhow::Result<Option<Bytes>>;
}

/// Adapts an async closure into an [`OriginLoader`].
///
/// ```
/// use bytes::Bytes;
/// use resilience_kit::cache::{CacheKey, FnLoader, OriginLoader};
/// use std::sync::Arc;
///
/// let loader: Arc<dyn OriginLoader> = Arc::new(FnLoader::new(|key: CacheKey| async move {
///     Ok::<_, anyhow::Error>(Some(Bytes::from(format!("value for {}", key))))
/// }));
/// # let _ = loader;
/// ```
pub struct FnLoader<F> {
    f: F,
}

impl<F> FnLoader<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> OriginLoader for FnLoader<F>
where
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Bytes>>> + Send,
{
    async fn load(&self, key: &CacheKey) -> anyhow::Result<Option<Bytes>> {
        (self.f)(key.clone()).await
    }
}

/// Loader for caches with no backing source: every miss is `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOrigin;

#[async_trait]
impl OriginLoader for NoOrigin {
    async fn load(&self, _: &CacheKey) -> anyhow::Result<Option<Bytes>> {
        Ok(None)
    }
}
