//! Filesystem backend: one JSON document per key under a root directory.
//!
//! File names are the BLAKE3 hex of the key, so lookups never touch the index;
//! the index (rebuilt by `initialize()`) only serves key listing and scans.
//! Writes go through a temp file + rename so a crash never leaves a torn
//! document behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use polystore_codec::Envelope;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::Capabilities;
use crate::error::BackendError;
use crate::traits::{key_matches_pattern, BackendSize, EnvelopeFilter, StorageBackend};

/// On-disk document: the original key travels with the envelope so the index
/// can be rebuilt from the directory alone.
#[derive(Debug, Serialize, Deserialize)]
struct Document {
    key: String,
    envelope: Envelope,
}

/// Filesystem reference backend.
pub struct FsBackend {
    name: String,
    root: PathBuf,
    /// key -> stored file size in bytes
    index: RwLock<HashMap<String, u64>>,
    bytes: AtomicU64,
    max_bytes: Option<u64>,
    closed: AtomicBool,
}

impl FsBackend {
    /// Creates a filesystem backend rooted at `root`. The directory is created
    /// by `initialize()`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            index: RwLock::new(HashMap::new()),
            bytes: AtomicU64::new(0),
            max_bytes: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Limits total stored bytes; writes beyond the limit fail with `QuotaExceeded`.
    pub fn with_quota(name: impl Into<String>, root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::new(name, root)
        }
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.root.join(format!("{}.json", digest.to_hex()))
    }

    fn lock_err(&self) -> BackendError {
        BackendError::Unavailable(format!("{}: lock poisoned", self.name))
    }

    async fn read_document(path: &Path) -> Result<Option<Document>, BackendError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| BackendError::Serialization(e.to_string()))?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys currently in the index, optionally prefix-filtered.
    fn indexed_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, BackendError> {
        let index = self.index.read().map_err(|_| self.lock_err())?;
        Ok(index
            .keys()
            .filter(|k| prefix.map(|p| k.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            persistent: true,
            synchronous: false,
            max_size: self.max_bytes,
            ..Capabilities::default()
        }
    }

    async fn is_available(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        tokio::fs::create_dir_all(&self.root).await.is_ok()
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.check_open()?;
        tokio::fs::create_dir_all(&self.root).await?;

        let mut rebuilt = HashMap::new();
        let mut total = 0u64;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(Some(doc)) => {
                    let len = entry.metadata().await?.len();
                    total += len;
                    rebuilt.insert(doc.key, len);
                }
                Ok(None) => {}
                Err(e) => {
                    // A single corrupt document must not take the backend down.
                    warn!(backend = %self.name, path = %path.display(), error = %e,
                        "skipping unreadable document during index rebuild");
                }
            }
        }

        let mut index = self.index.write().map_err(|_| self.lock_err())?;
        *index = rebuilt;
        self.bytes.store(total, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Envelope>, BackendError> {
        self.check_open()?;
        Ok(Self::read_document(&self.path_for(key))
            .await?
            .map(|doc| doc.envelope))
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), BackendError> {
        self.check_open()?;
        let doc = Document {
            key: key.to_string(),
            envelope,
        };
        let bytes =
            serde_json::to_vec(&doc).map_err(|e| BackendError::Serialization(e.to_string()))?;
        let new_len = bytes.len() as u64;

        let old_len = {
            let index = self.index.read().map_err(|_| self.lock_err())?;
            index.get(key).copied().unwrap_or(0)
        };
        let total = self.bytes.load(Ordering::SeqCst) - old_len + new_len;
        if let Some(limit) = self.max_bytes {
            if total > limit {
                return Err(BackendError::QuotaExceeded {
                    backend: self.name.clone(),
                    needed: total,
                    limit,
                });
            }
        }

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let mut index = self.index.write().map_err(|_| self.lock_err())?;
        index.insert(key.to_string(), new_len);
        self.bytes.store(total, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.check_open()?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut index = self.index.write().map_err(|_| self.lock_err())?;
        if let Some(len) = index.remove(key) {
            self.bytes.fetch_sub(len, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<(), BackendError> {
        self.check_open()?;
        for key in self.indexed_keys(prefix)? {
            self.remove(&key).await?;
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, BackendError> {
        self.check_open()?;
        let index = self.index.read().map_err(|_| self.lock_err())?;
        Ok(index.contains_key(key))
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, BackendError> {
        self.check_open()?;
        let mut keys = Vec::new();
        for key in self.indexed_keys(None)? {
            let matched = match pattern {
                Some(p) => key_matches_pattern(&key, p)?,
                None => true,
            };
            if matched {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn size(&self) -> Result<BackendSize, BackendError> {
        self.check_open()?;
        let index = self.index.read().map_err(|_| self.lock_err())?;
        Ok(BackendSize {
            bytes: self.bytes.load(Ordering::SeqCst),
            count: index.len() as u64,
        })
    }

    async fn scan(&self) -> Result<Vec<(String, Envelope)>, BackendError> {
        self.check_open()?;
        let mut out = Vec::new();
        for key in self.indexed_keys(None)? {
            if let Some(env) = self.get(&key).await? {
                out.push((key, env));
            }
        }
        Ok(out)
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

    async fn backend(dir: &tempfile::TempDir) -> FsBackend {
        let be = FsBackend::new("fs", dir.path());
        be.initialize().await.unwrap();
        be
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir).await;

        be.set("user:1", env(b"alice")).await.unwrap();
        assert_eq!(be.get("user:1").await.unwrap().unwrap().payload, b"alice");
        assert!(be.has("user:1").await.unwrap());
        assert!(be.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_rebuilt_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let be = backend(&dir).await;
            be.set("a", env(b"1")).await.unwrap();
            be.set("b", env(b"2")).await.unwrap();
        }

        // New instance over the same directory sees both entries.
        let be = backend(&dir).await;
        let keys = be.keys(None).await.unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(be.size().await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir).await;
        be.set("ns:a", env(b"1")).await.unwrap();
        be.set("ns:b", env(b"2")).await.unwrap();
        be.set("x", env(b"3")).await.unwrap();

        be.remove("ns:a").await.unwrap();
        assert!(!be.has("ns:a").await.unwrap());

        be.clear(Some("ns:")).await.unwrap();
        assert_eq!(be.keys(None).await.unwrap(), vec!["x".to_string()]);

        be.clear(None).await.unwrap();
        assert_eq!(be.size().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let be = FsBackend::with_quota("fs", dir.path(), 64);
        be.initialize().await.unwrap();

        let err = be.set("big", env(&[1u8; 256])).await.unwrap_err();
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));
        assert!(!be.has("big").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_document_skipped_on_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        {
            let be = backend(&dir).await;
            be.set("good", env(b"ok")).await.unwrap();
        }
        std::fs::write(dir.path().join("deadbeef.json"), b"{not json").unwrap();

        let be = backend(&dir).await;
        assert_eq!(be.keys(None).await.unwrap(), vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_returns_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let be = backend(&dir).await;
        let mut tagged = env(b"v");
        tagged.tags.insert("t".into());
        be.set("k", tagged.clone()).await.unwrap();

        let all = be.scan().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.tags, tagged.tags);
    }
}
