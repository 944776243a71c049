//! In-memory backend backed by a HashMap. Thread-safe via RwLock.
//!
//! Volatile, synchronous, queryable (tag/expiry pushdown). Supports an
//! optional byte quota so quota handling is exercisable without a real
//! bounded store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use polystore_codec::Envelope;

use crate::capability::Capabilities;
use crate::error::BackendError;
use crate::traits::{key_matches_pattern, BackendSize, EnvelopeFilter, StorageBackend};

/// In-memory reference backend.
pub struct MemoryBackend {
    name: String,
    data: RwLock<HashMap<String, Envelope>>,
    bytes: AtomicU64,
    max_bytes: Option<u64>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Creates an unbounded in-memory backend.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
            bytes: AtomicU64::new(0),
            max_bytes: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a backend that rejects writes once stored bytes would exceed `max_bytes`.
    pub fn with_quota(name: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::new(name)
        }
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn entry_bytes(key: &str, envelope: &Envelope) -> u64 {
        (key.len() + envelope.payload.len()) as u64
    }

    fn lock_err(&self) -> BackendError {
        BackendError::Unavailable(format!("{}: lock poisoned", self.name))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: false,
            synchronous: true,
            queryable: true,
            max_size: self.max_bytes,
            ..Capabilities::default()
        }
    }

    async fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.check_open()
    }

    async fn get(&self, key: &str) -> Result<Option<Envelope>, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), BackendError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| self.lock_err())?;

        let new_bytes = Self::entry_bytes(key, &envelope);
        let old_bytes = data
            .get(key)
            .map(|e| Self::entry_bytes(key, e))
            .unwrap_or(0);
        let total = self.bytes.load(Ordering::SeqCst) - old_bytes + new_bytes;
        if let Some(limit) = self.max_bytes {
            if total > limit {
                return Err(BackendError::QuotaExceeded {
                    backend: self.name.clone(),
                    needed: total,
                    limit,
                });
            }
        }

        data.insert(key.to_string(), envelope);
        self.bytes.store(total, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| self.lock_err())?;
        if let Some(old) = data.remove(key) {
            self.bytes
                .fetch_sub(Self::entry_bytes(key, &old), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<(), BackendError> {
        self.check_open()?;
        let mut data = self.data.write().map_err(|_| self.lock_err())?;
        match prefix {
            None => {
                data.clear();
                self.bytes.store(0, Ordering::SeqCst);
            }
            Some(prefix) => {
                let doomed: Vec<String> = data
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                for key in doomed {
                    if let Some(old) = data.remove(&key) {
                        self.bytes
                            .fetch_sub(Self::entry_bytes(&key, &old), Ordering::SeqCst);
                    }
                }
            }
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        Ok(data.contains_key(key))
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        let mut keys = Vec::new();
        for key in data.keys() {
            let matched = match pattern {
                Some(p) => key_matches_pattern(key, p)?,
                None => true,
            };
            if matched {
                keys.push(key.clone());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn size(&self) -> Result<BackendSize, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        Ok(BackendSize {
            bytes: self.bytes.load(Ordering::SeqCst),
            count: data.len() as u64,
        })
    }

    async fn scan(&self) -> Result<Vec<(String, Envelope)>, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn query(
        &self,
        filter: &EnvelopeFilter,
    ) -> Result<Option<Vec<(String, Envelope)>>, BackendError> {
        self.check_open()?;
        let data = self.data.read().map_err(|_| self.lock_err())?;
        let hits = data
            .iter()
            .filter(|(k, v)| filter.matches(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Some(hits))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(payload: &[u8]) -> Envelope {
        Envelope::new(payload.to_vec(), false, false)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let be = MemoryBackend::new("memory");
        be.set("k1", env(b"v1")).await.unwrap();
        assert_eq!(be.get("k1").await.unwrap().unwrap().payload, b"v1");
        assert!(be.has("k1").await.unwrap());

        be.remove("k1").await.unwrap();
        assert!(be.get("k1").await.unwrap().is_none());
        // Removing again is not an error.
        be.remove("k1").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_pattern() {
        let be = MemoryBackend::new("memory");
        be.set("user:1", env(b"a")).await.unwrap();
        be.set("user:2", env(b"b")).await.unwrap();
        be.set("session:1", env(b"c")).await.unwrap();

        let keys = be.keys(Some("user:*")).await.unwrap();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(be.keys(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_clear_with_prefix() {
        let be = MemoryBackend::new("memory");
        be.set("ns:a", env(b"1")).await.unwrap();
        be.set("ns:b", env(b"2")).await.unwrap();
        be.set("other", env(b"3")).await.unwrap();

        be.clear(Some("ns:")).await.unwrap();
        assert_eq!(be.keys(None).await.unwrap(), vec!["other".to_string()]);

        be.clear(None).await.unwrap();
        assert_eq!(be.size().await.unwrap(), BackendSize::default());
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let be = MemoryBackend::with_quota("memory", 16);
        be.set("k", env(b"12345")).await.unwrap();
        let err = be.set("k2", env(&[0u8; 32])).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));

        // Overwriting frees the old entry's bytes first.
        be.set("k", env(b"123456789")).await.unwrap();
    }

    #[tokio::test]
    async fn test_size_tracks_bytes() {
        let be = MemoryBackend::new("memory");
        be.set("k", env(b"1234")).await.unwrap();
        let size = be.size().await.unwrap();
        assert_eq!(size.count, 1);
        assert_eq!(size.bytes, 5); // 1 key byte + 4 payload bytes

        be.remove("k").await.unwrap();
        assert_eq!(be.size().await.unwrap().bytes, 0);
    }

    #[tokio::test]
    async fn test_query_pushdown() {
        let be = MemoryBackend::new("memory");
        let mut tagged = env(b"x");
        tagged.tags.insert("hot".into());
        be.set("a", tagged).await.unwrap();
        be.set("b", env(b"y")).await.unwrap();

        let hits = be
            .query(&EnvelopeFilter {
                tags_any: vec!["hot".into()],
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[tokio::test]
    async fn test_closed_backend_rejects() {
        let be = MemoryBackend::new("memory");
        be.close().await.unwrap();
        assert!(!be.is_available().await);
        assert!(matches!(
            be.get("k").await,
            Err(BackendError::Closed(_))
        ));
    }
}
