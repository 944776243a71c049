//! The storage envelope: the unit every backend stores and retrieves.
//!
//! Backends treat the payload as opaque bytes. The only fields a queryable
//! backend may index are `expires` and `tags`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Versioned wrapper around a stored value.
///
/// The `encrypted` and `compressed` flags truthfully describe the payload byte
/// layout, so decoding never needs hints from outside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Encoded value bytes: serialized, then optionally compressed, then optionally encrypted.
    pub payload: Vec<u8>,
    /// Creation time, milliseconds since epoch. Preserved across overwrites of the same key.
    pub created: u64,
    /// Last write time, milliseconds since epoch.
    pub updated: u64,
    /// Absolute expiration time. None means the entry never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    /// Original TTL for sliding expiration; a successful read resets
    /// `expires = now + sliding`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding: Option<u64>,
    /// Caller-assigned tags, indexable by queryable backends.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Free-form caller metadata. Never interpreted by the core.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// True if the payload was encrypted as the last encode step.
    #[serde(default)]
    pub encrypted: bool,
    /// True if the payload was compressed before any encryption.
    #[serde(default)]
    pub compressed: bool,
}

impl Envelope {
    /// Creates a fresh envelope around an already-encoded payload.
    pub fn new(payload: Vec<u8>, encrypted: bool, compressed: bool) -> Self {
        let now = now_millis();
        Self {
            payload,
            created: now,
            updated: now,
            expires: None,
            sliding: None,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            encrypted,
            compressed,
        }
    }

    /// Checks the envelope invariants. Called before an envelope is handed to a backend.
    pub fn validate(&self) -> Result<(), CodecError> {
        if let Some(expires) = self.expires {
            if expires < self.created {
                return Err(CodecError::InvalidEnvelope(format!(
                    "expires {} earlier than created {}",
                    expires, self.created
                )));
            }
        }
        Ok(())
    }

    /// True if the envelope has an expiration time at or before `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.expires, Some(e) if e <= now)
    }

    /// Remaining lifetime in milliseconds at `now`. None means no expiration.
    pub fn remaining_ttl(&self, now: u64) -> Option<u64> {
        self.expires.map(|e| e.saturating_sub(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_envelope_timestamps() {
        let env = Envelope::new(vec![1, 2, 3], false, false);
        assert_eq!(env.created, env.updated);
        assert!(env.expires.is_none());
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_expires_before_created_rejected() {
        let mut env = Envelope::new(vec![], false, false);
        env.expires = Some(env.created - 1);
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_is_expired_at() {
        let mut env = Envelope::new(vec![], false, false);
        assert!(!env.is_expired_at(u64::MAX));

        env.expires = Some(env.created + 100);
        assert!(!env.is_expired_at(env.created + 99));
        assert!(env.is_expired_at(env.created + 100));
        assert!(env.is_expired_at(env.created + 101));
    }

    #[test]
    fn test_remaining_ttl() {
        let mut env = Envelope::new(vec![], false, false);
        assert_eq!(env.remaining_ttl(env.created), None);

        env.expires = Some(env.created + 500);
        assert_eq!(env.remaining_ttl(env.created), Some(500));
        assert_eq!(env.remaining_ttl(env.created + 600), Some(0));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut env = Envelope::new(vec![0, 255, 128], true, true);
        env.tags.insert("session".to_string());
        env.metadata
            .insert("origin".to_string(), serde_json::json!("api"));
        env.expires = Some(env.created + 1000);

        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
