//! Per-call operation options and expiration resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::StoreError;

/// Options shared by every operation: backend targeting and namespacing.
#[derive(Debug, Clone, Default)]
pub struct CommonOptions {
    /// Explicit target backend(s), in order. Empty means use the configured
    /// default preference list. A multi-entry list on a write applies the
    /// write to every listed backend (redundancy).
    pub storage: Vec<String>,
    /// Key namespace; prefixes keys on the wire and scopes `keys`/`clear`.
    pub namespace: Option<String>,
}

impl CommonOptions {
    /// Targets a single named backend.
    pub fn on(backend: impl Into<String>) -> Self {
        Self {
            storage: vec![backend.into()],
            ..Default::default()
        }
    }
}

/// Options for `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Backend targeting and namespace.
    pub common: CommonOptions,
    /// Compress the serialized value (above the configured threshold).
    pub compress: bool,
    /// Encrypt with this password.
    pub password: Option<String>,
    /// Absolute expiration, milliseconds since epoch. Highest precedence.
    pub expire_at: Option<u64>,
    /// Relative TTL. Second precedence.
    pub ttl: Option<Duration>,
    /// Alias form of relative TTL. Lowest precedence.
    pub expire_after: Option<Duration>,
    /// Sliding expiration: every successful read resets the TTL. Applies to
    /// the winning relative TTL; ignored for `expire_at`.
    pub sliding: bool,
    /// Tags stored on the envelope, indexable by queryable backends.
    pub tags: BTreeSet<String>,
    /// Free-form metadata stored on the envelope.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Options for `get`, `has`, `get_ttl` and friends.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Backend targeting and namespace.
    pub common: CommonOptions,
    /// Password for encrypted payloads.
    pub password: Option<String>,
    /// Map decryption failures to `Ok(None)` instead of an error.
    pub ignore_decryption_errors: bool,
}

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Options for `query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Backend targeting and namespace.
    pub common: CommonOptions,
    /// Password used to decode encrypted envelopes during evaluation.
    /// Envelopes that cannot be decoded only match tag clauses.
    pub password: Option<String>,
    /// Sort by this dot-notation field path, applied once on the unioned set.
    pub sort_by: Option<String>,
    /// Sort direction.
    pub order: SortOrder,
    /// Results to skip after sorting.
    pub skip: usize,
    /// Maximum results to return after skipping.
    pub limit: Option<usize>,
}

/// Resolved expiration for a new envelope: `(expires, sliding)`.
pub type ResolvedExpiry = (Option<u64>, Option<u64>);

/// Applies the expiration precedence rule: `expire_at` > `ttl` > `expire_after`;
/// exactly one wins. Returns the absolute expiry plus the sliding TTL if the
/// winning form was relative and `sliding` was requested.
pub fn resolve_expiry(opts: &SetOptions, now: u64) -> Result<ResolvedExpiry, StoreError> {
    if let Some(at) = opts.expire_at {
        if at < now {
            return Err(StoreError::Validation(format!(
                "expire_at {at} is in the past (now {now})"
            )));
        }
        return Ok((Some(at), None));
    }
    let relative = opts.ttl.or(opts.expire_after);
    match relative {
        Some(ttl) => {
            let ttl_ms = ttl.as_millis() as u64;
            let sliding = opts.sliding.then_some(ttl_ms);
            Ok((Some(now + ttl_ms), sliding))
        }
        None => Ok((None, None)),
    }
}

/// Joins a namespace and a caller-visible key into the stored key.
pub fn namespaced_key(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}::{key}"),
        None => key.to_string(),
    }
}

/// Prefix that scopes `keys`/`clear` to a namespace.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{namespace}::")
}

/// Strips the namespace prefix from a stored key, if it belongs to the namespace.
pub fn strip_namespace<'a>(namespace: Option<&str>, stored_key: &'a str) -> Option<&'a str> {
    match namespace {
        Some(ns) => stored_key.strip_prefix(&namespace_prefix(ns)),
        None => Some(stored_key),
    }
}

/// Validates a caller-supplied key.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Validation("key must not be empty".into()));
    }
    Ok(())
}
