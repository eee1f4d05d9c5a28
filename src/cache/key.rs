//! Cache key generation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same key under `prefix:`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self(format!("{}:{}", prefix, self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Builds stable, fixed-length keys from structured lookup parameters.
///
/// Parts are order-sensitive and length-delimited before hashing, so
/// `["ab", "c"]` and `["a", "bc"]` never collide.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    salt: Option<String>,
    parts: Vec<String>,
}

impl CacheKeyBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            salt: None,
            parts: Vec::new(),
        }
    }

    /// Mixes a version string into the hash; changing it orphans all previous keys.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn part(mut self, part: impl fmt::Display) -> Self {
        self.parts.push(part.to_string());
        self
    }

    /// Adds a serializable value in canonical JSON form.
    pub fn json_part<T: Serialize>(self, value: &T) -> crate::Result<Self> {
        let encoded = serde_json::to_string(value)?;
        Ok(self.part(encoded))
    }

    pub fn build(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        if let Some(ref salt) = self.salt {
            hasher.update((salt.len() as u64).to_be_bytes());
            hasher.update(salt.as_bytes());
        }
        for part in &self.parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        CacheKey(format!("{}:{}", self.namespace, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_is_deterministic() {
        let a = CacheKeyBuilder::new("user").part(42).part("profile").build();
        let b = CacheKeyBuilder::new("user").part(42).part("profile").build();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("user:"));
        assert_eq!(a.as_str().len(), "user:".len() + 64);
    }

    #[test]
    fn test_part_boundaries_matter() {
        let a = CacheKeyBuilder::new("ns").part("ab").part("c").build();
        let b = CacheKeyBuilder::new("ns").part("a").part("bc").build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_changes_key() {
        let plain = CacheKeyBuilder::new("ns").part("x").build();
        let salted = CacheKeyBuilder::new("ns").with_salt("v2").part("x").build();
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_json_part() {
        let key = CacheKeyBuilder::new("search")
            .json_part(&serde_json::json!({"q": "rust", "page": 2}))
            .unwrap()
            .build();
        assert!(key.to_string().starts_with("search:"));
    }

    #[test]
    fn test_prefixed() {
        assert_eq!(CacheKey::from("k").prefixed("app").as_str(), "app:k");
    }
}
