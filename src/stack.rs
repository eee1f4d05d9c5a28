//! Explicitly wired container for the three components.

use crate::cache::{OriginLoader, TieredCache};
use crate::clock::{self, Clock};
use crate::config::ResilienceConfig;
use crate::resilience::circuit_breaker::{CallError, CircuitBreakerRegistry};
use crate::resilience::rate_limiter::RateLimiter;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Rate limiter, breaker registry and tiered cache built from one [`ResilienceConfig`].
///
/// Each component is present only when its config section is.
#[derive(Clone)]
pub struct Resilience {
    rate_limiter: Option<Arc<RateLimiter>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    cache: Option<Arc<TieredCache>>,
}

impl Resilience {
    pub fn builder(config: ResilienceConfig) -> ResilienceBuilder {
        ResilienceBuilder::new(config)
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn breakers(&self) -> Option<&Arc<CircuitBreakerRegistry>> {
        self.breakers.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<TieredCache>> {
        self.cache.as_ref()
    }

    /// Gate `op` on `subject`'s quota, then run it through the `operation` breaker.
    ///
    /// Waits for quota rather than rejecting; `cancel` aborts the wait or the call.
    /// Use [`try_execute`](Self::try_execute) to see rejections instead.
    pub async fn execute<F, Fut, T, E>(
        &self,
        subject: &str,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(rl) = &self.rate_limiter {
            // acquire only fails on cancellation
            rl.acquire(subject, cancel)
                .await
                .map_err(|_| CallError::Cancelled)?;
        }
        self.call(operation, cancel, op).await
    }

    /// Like [`execute`](Self::execute), but a subject over its quota is turned
    /// away with [`GuardError::RateLimited`] and `op` does not run.
    pub async fn try_execute<F, Fut, T, E>(
        &self,
        subject: &str,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(rl) = &self.rate_limiter {
            let decision = rl
                .check_and_consume_with_cancel(subject, cancel)
                .map_err(|_| GuardError::Call(CallError::Cancelled))?;
            if !decision.allowed {
                return Err(GuardError::RateLimited {
                    retry_after: decision.retry_after.unwrap_or_default(),
                });
            }
        }
        self.call(operation, cancel, op).await.map_err(GuardError::Call)
    }

    async fn call<F, Fut, T, E>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match &self.breakers {
            Some(b) => b.execute_with_cancel(operation, cancel, op).await,
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(CallError::Cancelled),
                    res = op() => res.map_err(CallError::Failed),
                }
            }
        }
    }
}

/// Failure of [`Resilience::try_execute`].
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    #[error(transparent)]
    Call(#[from] CallError<E>),
}

impl<E> GuardError<E> {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::RateLimited { retry_after } => Some(*retry_after),
            GuardError::Call(CallError::Open(e)) => e.retry_after,
            GuardError::Call(_) => None,
        }
    }
}

pub struct ResilienceBuilder {
    config: ResilienceConfig,
    loader: Option<Arc<dyn OriginLoader>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ResilienceBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            loader: None,
            clock: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn OriginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Time source shared by every component (defaults to the system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Resilience> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(clock::system);

        let rate_limiter = self
            .config
            .rate_limit
            .as_ref()
            .map(|s| Arc::new(RateLimiter::with_clock(s.to_config(), Arc::clone(&clock))));

        let breakers = self.config.circuit_breaker.as_ref().map(|s| {
            Arc::new(CircuitBreakerRegistry::with_clock(
                s.to_config(),
                s.max_keys(),
                Arc::clone(&clock),
            ))
        });

        let cache = match self.config.cache {
            Some(ref section) => {
                let mut builder = TieredCache::builder().config(section.to_config());
                for tier in &section.tiers {
                    builder = builder.tier(tier.build(Arc::clone(&clock))?);
                }
                if let Some(loader) = self.loader {
                    builder = builder.loader(loader);
                }
                Some(Arc::new(builder.build()?))
            }
            None => {
                if self.loader.is_some() {
                    tracing::warn!("origin loader supplied without a cache section, ignoring it");
                }
                None
            }
        };

        tracing::debug!(
            rate_limit = rate_limiter.is_some(),
            circuit_breaker = breakers.is_some(),
            cache = cache.is_some(),
            "resilience stack built"
        );
        Ok(Resilience {
            rate_limiter,
            breakers,
            cache,
        })
    }
}
