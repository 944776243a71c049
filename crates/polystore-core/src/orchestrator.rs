//! The orchestrator facade: composes the adapter registry, codec pipeline,
//! TTL lifecycle and change bus behind one typed key/value API.
//!
//! Lifecycle is explicit: build with [`StoreBuilder`], operate, then
//! [`PolyStore::close`]. Close cancels the sweep task, detaches the sync
//! listener, closes every backend, and makes further operations fail with
//! [`StoreError::Closed`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polystore_backend::{BackendSize, EnvelopeFilter, StorageBackend};
use polystore_codec::{
    decode_value, encode_value, now_millis, DecodeOptions, EncodeOptions, Envelope,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{ChangeBus, ChangeEvent, SubscribeFilter, Subscription, SyncChannel};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::options::{
    namespace_prefix, namespaced_key, resolve_expiry, strip_namespace, validate_key,
    CommonOptions, GetOptions, QueryOptions, SetOptions,
};
use crate::query::{sort_and_page, Condition, QueryHit};
use crate::registry::AdapterRegistry;
use crate::ttl::{spawn_sweeper, ExpirationCallback, SweeperHandle};

/// Remaining lifetime of a key, as reported by [`PolyStore::get_ttl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist (or has already expired).
    Missing,
    /// Key exists and never expires.
    Persistent,
    /// Key expires after this duration.
    Expires(Duration),
}

/// One query result after deserialization.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
    /// Caller-visible key.
    pub key: String,
    /// Deserialized value.
    pub value: T,
    /// Backend that supplied the winning copy.
    pub backend: String,
}

/// Builder for a [`PolyStore`]. Backends register in the order given.
pub struct StoreBuilder {
    config: StoreConfig,
    backends: Vec<Arc<dyn StorageBackend>>,
    sync: Option<SyncChannel>,
    on_expiration: Option<ExpirationCallback>,
}

impl StoreBuilder {
    /// Starts a builder with the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            sync: None,
            on_expiration: None,
        }
    }

    /// Adds a backend. Registration (availability probe + initialize) happens
    /// in `build()`.
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Connects this instance to a cross-instance sync channel.
    pub fn sync_channel(mut self, channel: SyncChannel) -> Self {
        self.sync = Some(channel);
        self
    }

    /// Sets the callback invoked once per sweep cycle with the evicted keys.
    pub fn on_expiration(mut self, callback: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.on_expiration = Some(Arc::new(callback));
        self
    }

    /// Registers every backend, starts the sweep task and the sync listener.
    pub async fn build(self) -> Result<PolyStore, StoreError> {
        let registry = Arc::new(AdapterRegistry::new(self.config.default_order.clone()));
        for backend in self.backends {
            registry.register(backend).await?;
        }

        let bus = Arc::new(ChangeBus::new(self.sync.clone()));
        let sweeper = spawn_sweeper(
            Arc::clone(&registry),
            self.config.sweep.clone(),
            self.on_expiration,
        );
        let sync_task = self.sync.map(|channel| {
            let bus = Arc::clone(&bus);
            let mut rx = channel.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => bus.handle_sync(message),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "sync listener lagged, dropped messages");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        Ok(PolyStore {
            inner: Arc::new(Inner {
                registry,
                bus,
                config: self.config,
                closed: AtomicBool::new(false),
                background: Mutex::new(Some(Background { sweeper, sync_task })),
            }),
        })
    }
}

struct Background {
    sweeper: SweeperHandle,
    sync_task: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<AdapterRegistry>,
    bus: Arc<ChangeBus>,
    config: StoreConfig,
    closed: AtomicBool,
    background: Mutex<Option<Background>>,
}

/// The unified multi-backend key/value store. Cheap to clone.
#[derive(Clone)]
pub struct PolyStore {
    inner: Arc<Inner>,
}

impl PolyStore {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn encode_opts(&self, opts: &SetOptions) -> EncodeOptions {
        EncodeOptions {
            compress: opts.compress,
            compression_threshold: self.inner.config.compression_threshold,
            password: opts.password.clone(),
            kdf: self.inner.config.kdf,
        }
    }

    fn decode_opts(&self, password: Option<&str>, ignore_errors: bool) -> DecodeOptions {
        DecodeOptions {
            password: password.map(String::from),
            ignore_decryption_errors: ignore_errors,
            kdf: self.inner.config.kdf,
        }
    }

    /// Best-effort fetch of an existing envelope plus the backend holding it.
    /// Errors are swallowed; this only feeds `created` preservation and the
    /// `old_value` of change events.
    async fn peek(&self, candidates: &[String], stored_key: &str) -> Option<(String, Envelope)> {
        for name in candidates {
            let Some(backend) = self.inner.registry.backend(name) else {
                continue;
            };
            if let Ok(Some(env)) = backend.get(stored_key).await {
                return Some((name.clone(), env));
            }
        }
        None
    }

    fn decode_old_value(&self, env: &Envelope, password: Option<&str>) -> Option<Value> {
        decode_value(
            &env.payload,
            env.encrypted,
            env.compressed,
            &self.decode_opts(password, true),
        )
        .ok()
        .flatten()
    }

    /// Stores a value under `key`.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: T,
        opts: &SetOptions,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_key(key)?;
        let value = serde_json::to_value(value)
            .map_err(|e| StoreError::Validation(format!("value not serializable: {e}")))?;

        let now = now_millis();
        let (expires, sliding) = resolve_expiry(opts, now)?;
        let encoded = encode_value(&value, &self.encode_opts(opts))?;

        let ns = opts.common.namespace.as_deref();
        let stored_key = namespaced_key(ns, key);
        let candidates = self.inner.registry.resolve(&opts.common.storage);

        let previous = self.peek(&candidates, &stored_key).await;
        let mut envelope = Envelope::new(encoded.bytes, encoded.encrypted, encoded.compressed);
        if let Some((_, old)) = &previous {
            envelope.created = old.created.min(envelope.created);
        }
        envelope.expires = expires;
        envelope.sliding = sliding;
        envelope.tags = opts.tags.clone();
        envelope.metadata = opts.metadata.clone();
        envelope.validate()?;

        let backend_used = if opts.common.storage.len() > 1 {
            // Redundant write: every listed backend, in order.
            let env = envelope.clone();
            let key = stored_key.clone();
            self.inner
                .registry
                .on_every(&candidates, move |be| {
                    let env = env.clone();
                    let key = key.clone();
                    Box::pin(async move { be.set(&key, env).await.map_err(Into::into) })
                })
                .await?;
            candidates[0].clone()
        } else {
            let env = envelope.clone();
            let key = stored_key.clone();
            self.inner
                .registry
                .first_success(&candidates, move |be| {
                    let env = env.clone();
                    let key = key.clone();
                    Box::pin(async move {
                        let name = be.name().to_string();
                        be.set(&key, env).await?;
                        Ok(name)
                    })
                })
                .await?
        };

        let old_value = previous
            .as_ref()
            .and_then(|(_, env)| self.decode_old_value(env, opts.password.as_deref()));
        self.inner.bus.emit_local(ChangeEvent::local(
            key,
            opts.common.namespace.clone(),
            old_value,
            Some(value),
            backend_used,
        ));
        Ok(())
    }

    /// Reads the envelope behind a key, honoring fallback and lazy expiration.
    /// Returns the backend name alongside the envelope. Purely observational:
    /// sliding TTL resets are the value-returning read paths' job.
    async fn read_envelope(
        &self,
        key: &str,
        common: &CommonOptions,
    ) -> Result<Option<(String, Envelope)>, StoreError> {
        validate_key(key)?;
        let stored_key = namespaced_key(common.namespace.as_deref(), key);
        let candidates = self.inner.registry.resolve(&common.storage);

        let lookup_key = stored_key.clone();
        let found = self
            .inner
            .registry
            .first_success(&candidates, move |be| {
                let key = lookup_key.clone();
                Box::pin(async move {
                    let name = be.name().to_string();
                    let env = be.get(&key).await?;
                    Ok(env.map(|env| (name, env)))
                })
            })
            .await?;

        let Some((backend_name, envelope)) = found else {
            return Ok(None);
        };

        let now = now_millis();
        if envelope.is_expired_at(now) {
            // Lazy expiration: a read observes the expiry before any sweep.
            debug!(key = %stored_key, backend = %backend_name, "expired on read, evicting");
            if let Some(backend) = self.inner.registry.backend(&backend_name) {
                if let Err(e) = backend.remove(&stored_key).await {
                    warn!(key = %stored_key, error = %e, "lazy eviction failed");
                }
            }
            return Ok(None);
        }

        Ok(Some((backend_name, envelope)))
    }

    /// Sliding-expiration reset: pushes `expires` out by the original window
    /// and persists the envelope. Called only after a read actually returned
    /// the value; `has`, `get_ttl` and other probes never reset the window.
    async fn slide_expiry(
        &self,
        backend_name: &str,
        key: &str,
        common: &CommonOptions,
        envelope: &mut Envelope,
    ) -> Result<(), StoreError> {
        let Some(window) = envelope.sliding else {
            return Ok(());
        };
        envelope.expires = Some(now_millis() + window);
        self.write_back(backend_name, key, common, envelope.clone())
            .await
    }

    /// Fetches and decodes the value for a key. Missing or expired keys are
    /// `Ok(None)`, never an error.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        opts: &GetOptions,
    ) -> Result<Option<T>, StoreError> {
        self.ensure_open()?;
        let Some((backend_name, mut envelope)) = self.read_envelope(key, &opts.common).await?
        else {
            return Ok(None);
        };
        let decoded = decode_value(
            &envelope.payload,
            envelope.encrypted,
            envelope.compressed,
            &self.decode_opts(opts.password.as_deref(), opts.ignore_decryption_errors),
        )?;
        match decoded {
            None => Ok(None),
            Some(value) => {
                let typed = serde_json::from_value(value)
                    .map_err(|e| StoreError::Validation(format!("value shape mismatch: {e}")))?;
                self.slide_expiry(&backend_name, key, &opts.common, &mut envelope)
                    .await?;
                Ok(Some(typed))
            }
        }
    }

    /// Fetches the raw stored payload bytes without decrypting or
    /// decompressing. The counterpart of the codec's skip-decryption mode.
    pub async fn get_raw(&self, key: &str, opts: &GetOptions) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let Some((backend_name, mut envelope)) = self.read_envelope(key, &opts.common).await?
        else {
            return Ok(None);
        };
        self.slide_expiry(&backend_name, key, &opts.common, &mut envelope)
            .await?;
        Ok(Some(envelope.payload))
    }

    /// Deletes a key. Succeeds even if the key was absent.
    pub async fn remove(&self, key: &str, opts: &GetOptions) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_key(key)?;
        let ns = opts.common.namespace.as_deref();
        let stored_key = namespaced_key(ns, key);
        let candidates = self.inner.registry.resolve(&opts.common.storage);

        let previous = self.peek(&candidates, &stored_key).await;

        let backend_used = if opts.common.storage.len() > 1 {
            let key = stored_key.clone();
            self.inner
                .registry
                .on_every(&candidates, move |be| {
                    let key = key.clone();
                    Box::pin(async move { be.remove(&key).await.map_err(Into::into) })
                })
                .await?;
            candidates[0].clone()
        } else {
            let key = stored_key.clone();
            self.inner
                .registry
                .first_success(&candidates, move |be| {
                    let key = key.clone();
                    Box::pin(async move {
                        let name = be.name().to_string();
                        be.remove(&key).await?;
                        Ok(name)
                    })
                })
                .await?
        };

        let old_value = previous
            .as_ref()
            .and_then(|(_, env)| self.decode_old_value(env, opts.password.as_deref()));
        self.inner.bus.emit_local(ChangeEvent::local(
            key,
            opts.common.namespace.clone(),
            old_value,
            None,
            backend_used,
        ));
        Ok(())
    }

    /// Clears every resolved backend, scoped to the namespace when one is set.
    pub async fn clear(&self, opts: &CommonOptions) -> Result<(), StoreError> {
        self.ensure_open()?;
        let prefix = opts.namespace.as_deref().map(namespace_prefix);
        let candidates = self.inner.registry.resolve(&opts.storage);

        let mut cleared = 0usize;
        for name in &candidates {
            let Some(backend) = self.inner.registry.backend(name) else {
                continue;
            };
            backend.clear(prefix.as_deref()).await?;
            cleared += 1;
        }
        if cleared == 0 {
            return Err(StoreError::NoAvailableBackend {
                attempted: candidates,
                registered: self.inner.registry.registered_names(),
            });
        }
        Ok(())
    }

    /// Whether a key exists and has not expired.
    pub async fn has(&self, key: &str, opts: &GetOptions) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.read_envelope(key, &opts.common).await?.is_some())
    }

    /// Lists caller-visible keys across the resolved backends, deduplicated,
    /// optionally filtered by a `*`-wildcard pattern.
    pub async fn keys(
        &self,
        pattern: Option<&str>,
        opts: &CommonOptions,
    ) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let ns = opts.namespace.as_deref();
        let full_pattern = match (ns, pattern) {
            (Some(ns), Some(p)) => Some(format!("{}{p}", namespace_prefix(ns))),
            (Some(ns), None) => Some(format!("{}*", namespace_prefix(ns))),
            (None, Some(p)) => Some(p.to_string()),
            (None, None) => None,
        };

        let candidates = self.inner.registry.resolve(&opts.storage);
        let mut union = BTreeSet::new();
        let mut consulted = 0usize;
        for name in &candidates {
            let Some(backend) = self.inner.registry.backend(name) else {
                continue;
            };
            consulted += 1;
            for stored_key in backend.keys(full_pattern.as_deref()).await? {
                if let Some(visible) = strip_namespace(ns, &stored_key) {
                    union.insert(visible.to_string());
                }
            }
        }
        if consulted == 0 {
            return Err(StoreError::NoAvailableBackend {
                attempted: candidates,
                registered: self.inner.registry.registered_names(),
            });
        }
        Ok(union.into_iter().collect())
    }

    /// Evaluates a structured condition across the resolved backends.
    ///
    /// Results are unioned by key with first-writer-wins in preferred-backend
    /// order; sort and pagination apply exactly once on the unioned set.
    pub async fn query<T: DeserializeOwned>(
        &self,
        condition: &Value,
        opts: &QueryOptions,
    ) -> Result<Vec<QueryResult<T>>, StoreError> {
        self.ensure_open()?;
        let cond = Condition::parse(condition)?;
        let tags_pushdown = cond.required_tags_any();
        let ns = opts.common.namespace.as_deref();
        let prefix = ns.map(namespace_prefix);

        let candidates = self.inner.registry.resolve(&opts.common.storage);
        let now = now_millis();
        let mut seen = BTreeSet::new();
        let mut hits = Vec::new();
        let mut consulted = 0usize;

        for name in &candidates {
            let Some(backend) = self.inner.registry.backend(name) else {
                continue;
            };
            consulted += 1;

            let entries = if backend.capabilities().queryable {
                let filter = EnvelopeFilter {
                    tags_any: tags_pushdown.clone().unwrap_or_default(),
                    key_prefix: prefix.clone(),
                    expires_before: None,
                };
                match backend.query(&filter).await? {
                    Some(hits) => hits,
                    None => backend.scan().await?,
                }
            } else {
                backend.scan().await?
            };

            for (stored_key, envelope) in entries {
                if envelope.is_expired_at(now) {
                    continue;
                }
                let Some(visible) = strip_namespace(ns, &stored_key) else {
                    continue;
                };
                if seen.contains(visible) {
                    continue;
                }
                // Undecodable payloads (encrypted, no usable password) still
                // match pure tag conditions; value clauses see Null.
                let value = decode_value(
                    &envelope.payload,
                    envelope.encrypted,
                    envelope.compressed,
                    &self.decode_opts(opts.password.as_deref(), true),
                )
                .ok()
                .flatten()
                .unwrap_or(Value::Null);

                if cond.matches(&value, &envelope.tags) {
                    seen.insert(visible.to_string());
                    hits.push(QueryHit {
                        key: visible.to_string(),
                        value,
                        backend: name.clone(),
                    });
                }
            }
        }
        if consulted == 0 {
            return Err(StoreError::NoAvailableBackend {
                attempted: candidates,
                registered: self.inner.registry.registered_names(),
            });
        }

        sort_and_page(hits, opts)
            .into_iter()
            .map(|hit| {
                serde_json::from_value(hit.value)
                    .map(|value| QueryResult {
                        key: hit.key,
                        value,
                        backend: hit.backend,
                    })
                    .map_err(|e| StoreError::Validation(format!("value shape mismatch: {e}")))
            })
            .collect()
    }

    /// Total size across the resolved backends.
    pub async fn size(&self, opts: &CommonOptions) -> Result<BackendSize, StoreError> {
        let mut total = BackendSize::default();
        for (_, size) in self.size_detailed(opts).await? {
            total.bytes += size.bytes;
            total.count += size.count;
        }
        Ok(total)
    }

    /// Per-backend size breakdown.
    pub async fn size_detailed(
        &self,
        opts: &CommonOptions,
    ) -> Result<Vec<(String, BackendSize)>, StoreError> {
        self.ensure_open()?;
        let candidates = self.inner.registry.resolve(&opts.storage);
        let mut out = Vec::new();
        for name in &candidates {
            let Some(backend) = self.inner.registry.backend(name) else {
                continue;
            };
            out.push((name.clone(), backend.size().await?));
        }
        if out.is_empty() {
            return Err(StoreError::NoAvailableBackend {
                attempted: candidates,
                registered: self.inner.registry.registered_names(),
            });
        }
        Ok(out)
    }

    /// Remaining TTL for a key.
    pub async fn get_ttl(&self, key: &str, opts: &GetOptions) -> Result<TtlStatus, StoreError> {
        self.ensure_open()?;
        let Some((_, envelope)) = self.read_envelope(key, &opts.common).await? else {
            return Ok(TtlStatus::Missing);
        };
        Ok(match envelope.remaining_ttl(now_millis()) {
            None => TtlStatus::Persistent,
            Some(ms) => TtlStatus::Expires(Duration::from_millis(ms)),
        })
    }

    /// Adds `delta` to the key's expiration, creating one from the default TTL
    /// if the entry had none. Returns false if the key does not exist.
    pub async fn extend_ttl(
        &self,
        key: &str,
        delta: Duration,
        opts: &GetOptions,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let Some((backend_name, mut envelope)) = self.read_envelope(key, &opts.common).await?
        else {
            return Ok(false);
        };
        let now = now_millis();
        let base = envelope.expires.unwrap_or_else(|| {
            now + self
                .inner
                .config
                .default_ttl
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        });
        envelope.expires = Some(base + delta.as_millis() as u64);
        envelope.validate()?;
        self.write_back(&backend_name, key, &opts.common, envelope)
            .await?;
        Ok(true)
    }

    /// Removes the key's expiration entirely, making it permanent. Returns
    /// false if the key does not exist.
    pub async fn persist(&self, key: &str, opts: &GetOptions) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let Some((backend_name, mut envelope)) = self.read_envelope(key, &opts.common).await?
        else {
            return Ok(false);
        };
        envelope.expires = None;
        envelope.sliding = None;
        self.write_back(&backend_name, key, &opts.common, envelope)
            .await?;
        Ok(true)
    }

    async fn write_back(
        &self,
        backend_name: &str,
        key: &str,
        common: &CommonOptions,
        mut envelope: Envelope,
    ) -> Result<(), StoreError> {
        envelope.updated = now_millis();
        let stored_key = namespaced_key(common.namespace.as_deref(), key);
        let backend = self
            .inner
            .registry
            .backend(backend_name)
            .ok_or_else(|| StoreError::BackendUnavailable(backend_name.to_string()))?;
        backend.set(&stored_key, envelope).await?;
        Ok(())
    }

    /// Registers a change callback. Dropping the guard unsubscribes.
    pub fn subscribe(
        &self,
        filter: SubscribeFilter,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.bus.subscribe(filter, callback))
    }

    /// This instance's origin identifier on the sync channel.
    pub fn origin(&self) -> uuid::Uuid {
        self.inner.bus.origin()
    }

    /// Closes the store: stops the sweep task, detaches the sync listener and
    /// closes every backend. Idempotent; operations afterward fail with
    /// [`StoreError::Closed`].
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let background = self
            .inner
            .background
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(background) = background {
            background.sweeper.shutdown().await;
            if let Some(task) = background.sync_task {
                task.abort();
            }
        }
        self.inner.registry.close_all().await;
        Ok(())
    }
}
