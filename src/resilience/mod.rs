//! # Resilience Primitives Module
//!
//! Admission control and failure isolation for calls to remote dependencies.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Per-subject quotas (token bucket or sliding window) |
//! | [`circuit_breaker`] | Three-state breaker and a per-operation registry |
//!
//! Both keep their state per key (subject or operation), each key behind its
//! own lock, created lazily and bounded by an LRU cap.
//!
//! ## Circuit Breaker
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Failures reached the threshold, calls fail fast
//! - **Half-Open**: Reset timeout elapsed, one trial call probes recovery
//!
//! ```rust
//! use resilience_kit::resilience::circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn fetch_quote() -> Result<u32, std::io::Error> { Ok(42) }
//! # async fn demo() {
//! let breaker = CircuitBreaker::named(
//!     "quotes",
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! );
//!
//! match breaker.execute(|| fetch_quote()).await {
//!     Ok(quote) => println!("quote: {}", quote),
//!     Err(CallError::Open(e)) => println!("skipped, retry in {:?}", e.retry_after),
//!     Err(e) => println!("upstream failed: {}", e),
//! }
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use resilience_kit::resilience::rate_limiter::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
//!
//! let limiter = RateLimiter::new(RateLimiterConfig::new(RateLimitPolicy::token_bucket(100.0, 10.0)));
//!
//! let decision = limiter.check_and_consume("api-key-42");
//! if !decision.allowed {
//!     println!("retry after {:?}", decision.retry_after);
//! }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerSnapshot, CircuitOpenError, CircuitState, Permit,
};
pub use rate_limiter::{
    Decision, RateLimitPolicy, RateLimiter, RateLimiterConfig, RateLimiterSnapshot,
};
