//! Adapter registry: tracks registered backends and picks candidates for an
//! operation, with availability-based fallback.
//!
//! Availability is probed exactly once, at registration. A candidate failing
//! with an availability error is skipped; any other error surfaces immediately
//! so data errors never trigger a silent fallback.

use std::sync::Arc;
use std::sync::RwLock;

use futures::future::BoxFuture;
use polystore_backend::StorageBackend;
use tracing::{debug, warn};

use crate::error::StoreError;

struct Entry {
    backend: Arc<dyn StorageBackend>,
    available: bool,
    closed: bool,
}

/// Registry of physical backends, in registration order.
pub struct AdapterRegistry {
    entries: RwLock<Vec<Entry>>,
    default_order: Vec<String>,
}

impl AdapterRegistry {
    /// Creates a registry. `default_order` is the preference list used when an
    /// operation does not target backends explicitly; empty means
    /// registration order.
    pub fn new(default_order: Vec<String>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            default_order,
        }
    }

    fn lock_err() -> StoreError {
        StoreError::Backend("registry lock poisoned".into())
    }

    /// Registers a backend: duplicate check, one-time `is_available()` probe,
    /// then `initialize()` when available.
    pub async fn register(&self, backend: Arc<dyn StorageBackend>) -> Result<(), StoreError> {
        let name = backend.name().to_string();
        {
            let entries = self.entries.read().map_err(|_| Self::lock_err())?;
            if entries.iter().any(|e| e.backend.name() == name && !e.closed) {
                return Err(StoreError::DuplicateBackend(name));
            }
        }

        let available = backend.is_available().await;
        if available {
            backend.initialize().await?;
        } else {
            debug!(backend = %name, "backend reported unavailable at registration");
        }

        let mut entries = self.entries.write().map_err(|_| Self::lock_err())?;
        if entries.iter().any(|e| e.backend.name() == name && !e.closed) {
            return Err(StoreError::DuplicateBackend(name));
        }
        entries.push(Entry {
            backend,
            available,
            closed: false,
        });
        Ok(())
    }

    /// Every registered backend name, registration order.
    pub fn registered_names(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| e.backend.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of backends that probed available, registration order.
    pub fn available_names(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.available && !e.closed)
                    .map(|e| e.backend.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up a backend by name, available or not.
    pub fn backend(&self, name: &str) -> Option<Arc<dyn StorageBackend>> {
        self.entries
            .read()
            .ok()?
            .iter()
            .find(|e| e.backend.name() == name && !e.closed)
            .map(|e| Arc::clone(&e.backend))
    }

    fn is_available(&self, name: &str) -> bool {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.backend.name() == name && e.available && !e.closed)
            })
            .unwrap_or(false)
    }

    /// Resolves the ordered candidate list for an operation. An explicit
    /// `storage` list is used verbatim; otherwise the default preference list
    /// (or registration order) filtered to available backends.
    pub fn resolve(&self, explicit: &[String]) -> Vec<String> {
        if !explicit.is_empty() {
            return explicit.to_vec();
        }
        if self.default_order.is_empty() {
            return self.available_names();
        }
        self.default_order
            .iter()
            .filter(|name| self.is_available(name))
            .cloned()
            .collect()
    }

    /// Runs `op` against candidates in order; the first that does not fail
    /// wins. Availability errors skip to the next candidate; anything else
    /// surfaces immediately.
    pub async fn first_success<T, F>(
        &self,
        candidates: &[String],
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(Arc<dyn StorageBackend>) -> BoxFuture<'static, Result<T, StoreError>>,
    {
        let mut attempted = Vec::new();
        for name in candidates {
            attempted.push(name.clone());
            let Some(backend) = self.backend(name) else {
                debug!(backend = %name, "candidate not registered, skipping");
                continue;
            };
            if !self.is_available(name) {
                debug!(backend = %name, "candidate unavailable, skipping");
                continue;
            }
            match op(backend).await {
                Ok(result) => return Ok(result),
                Err(StoreError::BackendUnavailable(skipped)) => {
                    debug!(backend = %skipped, "availability error, falling back");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        Err(StoreError::NoAvailableBackend {
            attempted,
            registered: self.registered_names(),
        })
    }

    /// Runs `op` against *every* listed backend, in order. Used by redundant
    /// multi-backend writes; any failure surfaces immediately with no rollback
    /// of earlier successes.
    pub async fn on_every<F>(&self, candidates: &[String], mut op: F) -> Result<(), StoreError>
    where
        F: FnMut(Arc<dyn StorageBackend>) -> BoxFuture<'static, Result<(), StoreError>>,
    {
        if candidates.is_empty() {
            return Err(StoreError::NoAvailableBackend {
                attempted: Vec::new(),
                registered: self.registered_names(),
            });
        }
        for (i, name) in candidates.iter().enumerate() {
            let Some(backend) = self.backend(name) else {
                warn!(backend = %name, completed = i, "multi-backend write hit unknown backend");
                return Err(StoreError::BackendUnavailable(name.clone()));
            };
            if let Err(e) = op(backend).await {
                warn!(backend = %name, completed = i, error = %e,
                    "multi-backend write failed partway, earlier writes kept");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Closes every registered backend once. Idempotent.
    pub async fn close_all(&self) {
        let backends: Vec<Arc<dyn StorageBackend>> = {
            let mut entries = match self.entries.write() {
                Ok(entries) => entries,
                Err(_) => return,
            };
            entries
                .iter_mut()
                .filter(|e| !e.closed)
                .map(|e| {
                    e.closed = true;
                    e.available = false;
                    Arc::clone(&e.backend)
                })
                .collect()
        };
        for backend in backends {
            if let Err(e) = backend.close().await {
                warn!(backend = %backend.name(), error = %e, "backend close failed");
            }
        }
    }
}
