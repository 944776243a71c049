//! Fault-injecting backends for exercising registry fallback paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use polystore_backend::{
    BackendError, BackendSize, Capabilities, EnvelopeFilter, MemoryBackend, StorageBackend,
};
use polystore_codec::Envelope;

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A backend whose availability probe always fails. Registration succeeds but
/// the default preference list filters it out.
pub struct UnavailableBackend {
    name: String,
}

impl UnavailableBackend {
    /// Creates a permanently-down backend with the given name.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }

    fn down(&self) -> BackendError {
        BackendError::Unavailable(self.name.clone())
    }
}

#[async_trait]
impl StorageBackend for UnavailableBackend {
    fn name(&self) -> &str {
        &self.name
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
    async fn is_available(&self) -> bool {
        false
    }
    async fn initialize(&self) -> Result<(), BackendError> {
        Err(self.down())
    }
    async fn get(&self, _key: &str) -> Result<Option<Envelope>, BackendError> {
        Err(self.down())
    }
    async fn set(&self, _key: &str, _envelope: Envelope) -> Result<(), BackendError> {
        Err(self.down())
    }
    async fn remove(&self, _key: &str) -> Result<(), BackendError> {
        Err(self.down())
    }
    async fn clear(&self, _prefix: Option<&str>) -> Result<(), BackendError> {
        Err(self.down())
    }
    async fn has(&self, _key: &str) -> Result<bool, BackendError> {
        Err(self.down())
    }
    async fn keys(&self, _pattern: Option<&str>) -> Result<Vec<String>, BackendError> {
        Err(self.down())
    }
    async fn size(&self) -> Result<BackendSize, BackendError> {
        Err(self.down())
    }
    async fn scan(&self) -> Result<Vec<(String, Envelope)>, BackendError> {
        Err(self.down())
    }
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A memory backend that can be switched into an "unavailable" failure mode at
/// runtime, after it passed its registration probe.
pub struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

impl FlakyBackend {
    /// Creates a healthy flaky backend; flip it with [`FlakyBackend::set_failing`].
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(name),
            failing: AtomicBool::new(false),
        })
    }

    /// Turns runtime failure on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(self.inner.name().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
    async fn initialize(&self) -> Result<(), BackendError> {
        self.inner.initialize().await
    }
    async fn get(&self, key: &str) -> Result<Option<Envelope>, BackendError> {
        self.check()?;
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), BackendError> {
        self.check()?;
        self.inner.set(key, envelope).await
    }
    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.check()?;
        self.inner.remove(key).await
    }
    async fn clear(&self, prefix: Option<&str>) -> Result<(), BackendError> {
        self.check()?;
        self.inner.clear(prefix).await
    }
    async fn has(&self, key: &str) -> Result<bool, BackendError> {
        self.check()?;
        self.inner.has(key).await
    }
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>, BackendError> {
        self.check()?;
        self.inner.keys(pattern).await
    }
    async fn size(&self) -> Result<BackendSize, BackendError> {
        self.check()?;
        self.inner.size().await
    }
    async fn scan(&self) -> Result<Vec<(String, Envelope)>, BackendError> {
        self.check()?;
        self.inner.scan().await
    }
    async fn query(
        &self,
        filter: &EnvelopeFilter,
    ) -> Result<Option<Vec<(String, Envelope)>>, BackendError> {
        self.check()?;
        self.inner.query(filter).await
    }
    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }
}
