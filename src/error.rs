use crate::resilience::circuit_breaker::CircuitOpenError;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Configuration key that caused the error (e.g., "cache.tiers[1].base_url", "rate_limit.capacity")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "config", "circuit_breaker", "tiered_cache")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the crate.
///
/// Rate limiting never surfaces here: a rejected request is a
/// [`Decision`](crate::resilience::rate_limiter::Decision), not an error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("key not found at origin: {key}")]
    NotFound { key: String },

    #[error("origin load failed for key {key}: {source}")]
    Load {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache tier '{tier}' failed: {message}")]
    Tier { tier: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Network transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Shorthand for a configuration error pointing at `field_path`.
    pub fn invalid_field(field_path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::configuration_with_context(
            msg,
            ErrorContext::new()
                .with_field_path(field_path)
                .with_source("config"),
        )
    }

    pub fn tier(tier: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Tier {
            tier: tier.into(),
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether a caller may reasonably try again later.
    ///
    /// Nothing in this crate retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen(_) | Error::Load { .. } | Error::Tier { .. } | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_rendering() {
        let err = Error::invalid_field("cache.tiers[0].ttl_ms", "ttl must be positive");
        let msg = err.to_string();
        assert!(msg.contains("ttl must be positive"));
        assert!(msg.contains("field: cache.tiers[0].ttl_ms"));
        assert!(msg.contains("source: config"));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("cache.tiers[0].ttl_ms")
        );
    }

    #[test]
    fn test_empty_context_renders_bare_message() {
        let err = Error::configuration_with_context("boom", ErrorContext::new());
        assert_eq!(err.to_string(), "Configuration error: boom");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::tier("redis", "connection refused").is_retryable());
        assert!(Error::Load {
            key: "k".into(),
            source: anyhow::anyhow!("upstream 503"),
        }
        .is_retryable());
        assert!(!Error::NotFound { key: "k".into() }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::invalid_field("x", "bad").is_retryable());
    }
}
