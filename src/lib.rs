//! # resilience-kit
//!
//! Admission control, failure isolation and read-through caching for services
//! that call slow or unreliable dependencies.
//!
//! ## Overview
//!
//! The crate bundles three independent components that share a time source,
//! an error type and a configuration format:
//!
//! - **Rate limiting**: per-subject token bucket or sliding window quotas via [`resilience::rate_limiter`]
//! - **Circuit breaking**: three-state breakers, one per protected operation, via [`resilience::circuit_breaker`]
//! - **Tiered caching**: ordered cache tiers with promotion and an origin loader via [`cache`]
//!
//! None of them spawn background tasks. State advances lazily when it is read,
//! against a [`clock::Clock`] that tests replace with [`clock::ManualClock`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_kit::{Resilience, ResilienceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> resilience_kit::Result<()> {
//!     resilience_kit::observability::init_tracing();
//!     let config = ResilienceConfig::load("resilience.yaml")?;
//!     let stack = Resilience::builder(config).build()?;
//!
//!     let cancel = CancellationToken::new();
//!     let answer = stack
//!         .execute("tenant-7", "inventory", &cancel, || async { Ok::<_, std::io::Error>(42) })
//!         .await;
//!     println!("{:?}", answer.ok());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Rate limiter and circuit breaker |
//! | [`cache`] | Tiered cache, tier backends, origin loaders, keys |
//! | [`config`] | YAML configuration with environment overrides |
//! | [`clock`] | Injectable time source |
//! | [`observability`] | Tracing subscriber bootstrap |

pub mod cache;
pub mod clock;
pub mod config;
pub mod keyed;
pub mod observability;
pub mod resilience;
pub mod stack;

pub use config::ResilienceConfig;
pub use stack::{GuardError, Resilience, ResilienceBuilder};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
