//! YAML configuration for the whole stack.
//!
//! ```yaml
//! rate_limit:
//!   algorithm: token_bucket
//!   capacity: 100
//!   refill_rate: 10
//! circuit_breaker:
//!   failure_threshold: 5
//!   reset_timeout_ms: 30000
//! cache:
//!   tiers:
//!     - { name: l1, kind: memory, ttl_ms: 60000, capacity: 1000 }
//!     - { name: l2, kind: http, ttl_ms: 3600000, timeout_ms: 50, base_url: "http://cache:8080/kv" }
//! ```
//!
//! Environment overrides (applied by [`ResilienceConfig::load`]):
//! - `RESILIENCE_BREAKER_FAILURE_THRESHOLD`
//! - `RESILIENCE_BREAKER_RESET_TIMEOUT_MS`
//! - `RESILIENCE_RPS` / `RESILIENCE_RPM` (token bucket refill rate)

use crate::cache::remote::DEFAULT_REQUEST_TIMEOUT;
use crate::cache::{CacheConfig, HttpCache, MemoryCache, NullCache, Tier};
use crate::clock::Clock;
use crate::keyed::DEFAULT_MAX_KEYS;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::{RateLimitPolicy, RateLimiterConfig};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(flatten)]
    pub policy: PolicySection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_keys: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicySection {
    TokenBucket { capacity: f64, refill_rate: f64 },
    SlidingWindow { max_requests: u32, window_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_keys: Option<usize>,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            max_keys: None,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entry_size: Option<usize>,
    pub tiers: Vec<TierSection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Memory,
    Http,
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSection {
    pub name: String,
    pub kind: TierKind,
    pub ttl_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Entry bound for `memory` tiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Service root for `http` tiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl RateLimitSection {
    pub fn policy(&self) -> RateLimitPolicy {
        match self.policy {
            PolicySection::TokenBucket {
                capacity,
                refill_rate,
            } => RateLimitPolicy::token_bucket(capacity, refill_rate),
            PolicySection::SlidingWindow {
                max_requests,
                window_ms,
            } => RateLimitPolicy::sliding_window(max_requests, Duration::from_millis(window_ms)),
        }
    }

    pub fn to_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new(self.policy()).with_max_keys(self.max_keys.unwrap_or(DEFAULT_MAX_KEYS))
    }
}

impl CircuitBreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys.unwrap_or(DEFAULT_MAX_KEYS)
    }
}

impl CacheSection {
    pub fn to_config(&self) -> CacheConfig {
        let mut cfg = CacheConfig::new().with_enabled(self.enabled);
        if let Some(ref prefix) = self.key_prefix {
            cfg = cfg.with_key_prefix(prefix.clone());
        }
        if let Some(max) = self.max_entry_size {
            cfg = cfg.with_max_entry_size(max);
        }
        cfg
    }
}

impl TierSection {
    /// Instantiate the backend this entry describes.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Result<Tier> {
        let backend: Arc<dyn crate::cache::CacheBackend> = match self.kind {
            TierKind::Memory => Arc::new(MemoryCache::with_clock(
                self.capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY),
                clock,
            )),
            TierKind::Http => {
                let base_url = self.base_url.as_deref().ok_or_else(|| {
                    Error::invalid_field(
                        "base_url",
                        format!("http tier '{}' needs a base_url", self.name),
                    )
                })?;
                Arc::new(HttpCache::with_timeout(base_url, self.timeout())?)
            }
            TierKind::Null => Arc::new(NullCache::new()),
        };
        let tier = Tier::new(self.name.clone(), backend, Duration::from_millis(self.ttl_ms));
        Ok(match (self.timeout_ms, self.kind) {
            (Some(_), _) | (None, TierKind::Http) => tier.with_timeout(self.timeout()),
            (None, _) => tier,
        })
    }

    /// Configured timeout; remote tiers fall back to [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ResilienceConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to parse {}", path.display()),
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    /// Read `path`, apply `RESILIENCE_*` environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parsed = |name: &str| -> Option<String> {
            let raw = lookup(name)?;
            let trimmed = raw.trim().to_owned();
            (!trimmed.is_empty()).then_some(trimmed)
        };

        if let Some(raw) = parsed("RESILIENCE_BREAKER_FAILURE_THRESHOLD") {
            match raw.parse::<u32>() {
                Ok(v) => self.circuit_breaker.get_or_insert_with(Default::default).failure_threshold = v,
                Err(_) => tracing::warn!(value = %raw, "ignoring RESILIENCE_BREAKER_FAILURE_THRESHOLD"),
            }
        }
        if let Some(raw) = parsed("RESILIENCE_BREAKER_RESET_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(v) => self.circuit_breaker.get_or_insert_with(Default::default).reset_timeout_ms = v,
                Err(_) => tracing::warn!(value = %raw, "ignoring RESILIENCE_BREAKER_RESET_TIMEOUT_MS"),
            }
        }

        let rps = parsed("RESILIENCE_RPS")
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| {
                parsed("RESILIENCE_RPM")
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|rpm| rpm / 60.0)
            });
        if let Some(rps) = rps {
            self.override_rps(rps);
        }
    }

    fn override_rps(&mut self, rps: f64) {
        if let Some(RateLimitSection {
            policy: PolicySection::TokenBucket { refill_rate, .. },
            ..
        }) = self.rate_limit.as_mut()
        {
            if rps.is_finite() && rps > 0.0 {
                *refill_rate = rps;
                return;
            }
        }
        let Some(RateLimitPolicy::TokenBucket {
            capacity,
            refill_rate,
        }) = RateLimitPolicy::from_rps(rps)
        else {
            tracing::warn!(rps, "ignoring non-positive rate override");
            return;
        };
        let max_keys = self.rate_limit.as_ref().and_then(|r| r.max_keys);
        self.rate_limit = Some(RateLimitSection {
            policy: PolicySection::TokenBucket {
                capacity,
                refill_rate,
            },
            max_keys,
        });
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref rl) = self.rate_limit {
            rl.policy().validate()?;
            if rl.max_keys == Some(0) {
                return Err(Error::invalid_field("rate_limit.max_keys", "max_keys must be at least 1"));
            }
        }
        if let Some(ref cb) = self.circuit_breaker {
            cb.to_config().validate()?;
            if cb.max_keys == Some(0) {
                return Err(Error::invalid_field(
                    "circuit_breaker.max_keys",
                    "max_keys must be at least 1",
                ));
            }
        }
        if let Some(ref cache) = self.cache {
            validate_tiers(&cache.tiers)?;
        }
        Ok(())
    }
}

fn validate_tiers(tiers: &[TierSection]) -> Result<()> {
    if tiers.is_empty() {
        return Err(Error::invalid_field("cache.tiers", "at least one tier is required"));
    }
    let mut names = HashSet::new();
    for (idx, tier) in tiers.iter().enumerate() {
        let field = |name: &str| format!("cache.tiers[{}].{}", idx, name);
        if tier.name.trim().is_empty() {
            return Err(Error::invalid_field(field("name"), "tier name must not be empty"));
        }
        if !names.insert(tier.name.as_str()) {
            return Err(Error::invalid_field(
                field("name"),
                format!("duplicate tier name '{}'", tier.name),
            ));
        }
        if tier.ttl_ms == 0 {
            return Err(Error::invalid_field(field("ttl_ms"), "ttl_ms must be at least 1"));
        }
        if tier.timeout_ms == Some(0) {
            return Err(Error::invalid_field(field("timeout_ms"), "timeout_ms must be at least 1"));
        }
        match tier.kind {
            TierKind::Memory if tier.capacity == Some(0) => {
                return Err(Error::invalid_field(field("capacity"), "capacity must be at least 1"));
            }
            TierKind::Http => match tier.base_url.as_deref() {
                None => {
                    return Err(Error::invalid_field(field("base_url"), "http tiers need a base_url"));
                }
                Some(url) => {
                    if let Err(e) = url::Url::parse(url) {
                        return Err(Error::configuration_with_context(
                            format!("invalid base_url '{}'", url),
                            ErrorContext::new()
                                .with_field_path(field("base_url"))
                                .with_details(e.to_string())
                                .with_source("config"),
                        ));
                    }
                }
            },
            _ => {}
        }
    }
    Ok(())
}
