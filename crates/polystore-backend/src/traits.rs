//! The storage backend contract consumed by the adapter registry.
//!
//! Backends store and retrieve opaque envelopes. All methods are async; a
//! backend call is the orchestrator's only suspension point besides the
//! cross-instance channel.

use async_trait::async_trait;
use polystore_codec::Envelope;
use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;
use crate::error::BackendError;

/// Aggregate size report for one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSize {
    /// Total stored bytes (payloads plus keys; backends may estimate).
    pub bytes: u64,
    /// Number of stored entries.
    pub count: u64,
}

/// Envelope-field filter a queryable backend can evaluate natively.
///
/// This is deliberately restricted to the indexable envelope fields; value
/// payloads stay opaque to backends. All set fields must match (AND).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeFilter {
    /// Entry must carry at least one of these tags.
    pub tags_any: Vec<String>,
    /// Entry must expire strictly before this time (milliseconds since epoch).
    pub expires_before: Option<u64>,
    /// Key must start with this prefix (used for namespace scoping).
    pub key_prefix: Option<String>,
}

impl EnvelopeFilter {
    /// Evaluates the filter against one entry. Shared by backends that index
    /// these fields and by the scan fallback in the registry.
    pub fn matches(&self, key: &str, envelope: &Envelope) -> bool {
        if let Some(prefix) = &self.key_prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(bound) = self.expires_before {
            match envelope.expires {
                Some(e) if e < bound => {}
                _ => return false,
            }
        }
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(|t| envelope.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Contract every physical backend implements.
///
/// Lifecycle: `is_available()` is probed once at registration; `initialize()`
/// runs before first use; `close()` ends the lifecycle deterministically and
/// further calls fail with [`BackendError::Closed`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Unique backend name used for registration and explicit targeting.
    fn name(&self) -> &str;

    /// Static capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Whether the backend can serve requests in this environment.
    async fn is_available(&self) -> bool;

    /// One-time setup (open files, rebuild indexes). Idempotent.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Fetch the envelope for a key. `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Envelope>, BackendError>;

    /// Store an envelope, overwriting any existing entry.
    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), BackendError>;

    /// Delete a key. Succeeds even if the key was absent.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Delete all entries, or only those whose key starts with `prefix`.
    async fn clear(&self, prefix: Option<&str>) -> Result<(), BackendError>;

    /// Whether a key exists (expiry not considered; that is the TTL manager's job).
    async fn has(&self, key: &str) -> Result<bool, BackendError>;

    /// List keys, optionally filtered by a `*`-wildcard pattern.
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, BackendError>;

    /// Aggregate size of stored data.
    async fn size(&self) -> Result<BackendSize, BackendError>;

    /// Full dump of all entries, used by the query evaluator's scan path and
    /// the TTL sweep on non-queryable backends.
    async fn scan(&self) -> Result<Vec<(String, Envelope)>, BackendError>;

    /// Native envelope-field query. `Ok(None)` means unsupported; the caller
    /// falls back to `scan()`. Backends advertising `queryable` must implement it.
    async fn query(
        &self,
        _filter: &EnvelopeFilter,
    ) -> Result<Option<Vec<(String, Envelope)>>, BackendError> {
        Ok(None)
    }

    /// Deterministic teardown.
    async fn close(&self) -> Result<(), BackendError>;
}

/// Matches a key against a `*`-wildcard pattern (`*` spans any run of
/// characters, everything else is literal).
pub fn key_matches_pattern(key: &str, pattern: &str) -> Result<bool, BackendError> {
    let escaped: Vec<String> = pattern.split('*').map(|p| regex::escape(p)).collect();
    let regex = format!("^{}$", escaped.join(".*"));
    let re = regex::Regex::new(&regex)
        .map_err(|_| BackendError::InvalidPattern(pattern.to_string()))?;
    Ok(re.is_match(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_literal() {
        assert!(key_matches_pattern("user:1", "user:1").unwrap());
        assert!(!key_matches_pattern("user:12", "user:1").unwrap());
    }

    #[test]
    fn test_pattern_wildcards() {
        assert!(key_matches_pattern("user:1", "user:*").unwrap());
        assert!(key_matches_pattern("user:1:profile", "user:*:profile").unwrap());
        assert!(!key_matches_pattern("session:1", "user:*").unwrap());
        assert!(key_matches_pattern("anything", "*").unwrap());
    }

    #[test]
    fn test_pattern_escapes_regex_metachars() {
        assert!(key_matches_pattern("a.b", "a.b").unwrap());
        assert!(!key_matches_pattern("axb", "a.b").unwrap());
    }

    #[test]
    fn test_filter_matches_tags_and_prefix() {
        let mut env = Envelope::new(vec![], false, false);
        env.tags.insert("hot".into());

        let filter = EnvelopeFilter {
            tags_any: vec!["hot".into(), "warm".into()],
            key_prefix: Some("cache:".into()),
            ..Default::default()
        };
        assert!(filter.matches("cache:a", &env));
        assert!(!filter.matches("other:a", &env));

        let filter = EnvelopeFilter {
            tags_any: vec!["cold".into()],
            ..Default::default()
        };
        assert!(!filter.matches("cache:a", &env));
    }

    #[test]
    fn test_filter_expires_before() {
        let mut env = Envelope::new(vec![], false, false);
        let filter = EnvelopeFilter {
            expires_before: Some(env.created + 10),
            ..Default::default()
        };
        // No expiry at all never matches an expiry bound.
        assert!(!filter.matches("k", &env));

        env.expires = Some(env.created + 5);
        assert!(filter.matches("k", &env));
        env.expires = Some(env.created + 20);
        assert!(!filter.matches("k", &env));
    }
}
