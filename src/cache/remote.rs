//! Distributed tier backed by a key/value HTTP service.
//!
//! Wire contract, relative to `base_url`:
//!
//! | Request | Meaning | Responses |
//! |---------|---------|-----------|
//! | `GET /{key}` | read | `200` body = value (optional `x-cache-ttl-ms`), `404` miss |
//! | `PUT /{key}` | write, `x-cache-ttl-ms` header carries the TTL | any `2xx` |
//! | `DELETE /{key}` | delete | `2xx` deleted, `404` absent |
//! | `DELETE /` | clear | any `2xx` |
//! | `GET /` | stats, JSON `{"entries": n}` | `200` |
//!
//! Any other status is reported as a tier error.

use super::backend::{CacheBackend, CachedValue};
use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const TTL_HEADER: &str = "x-cache-ttl-ms";

/// Request timeout used when the tier is built without an explicit one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct StatsBody {
    entries: usize,
}

pub struct HttpCache {
    client: Client,
    base_url: Url,
}

impl HttpCache {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Every request to the service is abandoned after `timeout`.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid cache base_url '{}'", base_url),
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("http_cache"),
            )
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::configuration_with_context(
                format!("cache base_url '{}' cannot carry a path", base_url),
                ErrorContext::new().with_source("http_cache"),
            ));
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn entry_url(&self, key: &CacheKey) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::tier(self.name(), "base_url cannot carry a path"))?
            .pop_if_empty()
            .push(key.as_str());
        Ok(url)
    }

    fn unexpected(&self, op: &str, status: StatusCode) -> Error {
        Error::tier(self.name(), format!("{} returned unexpected status {}", op, status))
    }
}

fn ttl_from_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(TTL_HEADER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

#[async_trait]
impl CacheBackend for HttpCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedValue>> {
        let resp = self.client.get(self.entry_url(key)?).send().await?;
        match resp.status() {
            StatusCode::OK => {
                let ttl_remaining = ttl_from_header(resp.headers());
                let data = resp.bytes().await?;
                Ok(Some(CachedValue {
                    data,
                    ttl_remaining,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(self.unexpected("GET", other)),
        }
    }

    async fn set(&self, key: &CacheKey, value: Bytes, ttl: Duration) -> Result<()> {
        let resp = self
            .client
            .put(self.entry_url(key)?)
            .header(TTL_HEADER, ttl.as_millis().to_string())
            .body(value)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.unexpected("PUT", resp.status()))
        }
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let resp = self.client.delete(self.entry_url(key)?).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(self.unexpected("DELETE", other)),
        }
    }

    async fn clear(&self) -> Result<()> {
        let resp = self.client.delete(self.base_url.clone()).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.unexpected("DELETE", resp.status()))
        }
    }

    async fn len(&self) -> Result<usize> {
        let resp = self.client.get(self.base_url.clone()).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(self.unexpected("GET", resp.status()));
        }
        let stats: StatsBody = resp.json().await?;
        Ok(stats.entries)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
