//! Change bus: synchronous local fan-out of mutations plus an origin-tagged
//! cross-instance sync channel with echo de-duplication.
//!
//! Local subscribers run in the mutating task, so per-key local ordering
//! follows issuance order. Cross-instance ordering is best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use polystore_codec::now_millis;

/// Where a change event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    /// Mutation issued on this instance.
    Local,
    /// Mutation observed from another instance over the sync channel.
    Remote,
    /// Synthetic event injected by the sync layer itself (e.g. hydration).
    Sync,
}

/// Immutable record of one mutation. Subscribers never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Caller-visible key (namespace already stripped).
    pub key: String,
    /// Namespace the mutation was scoped to, if any.
    pub namespace: Option<String>,
    /// Previous value, when it was cheaply recoverable.
    pub old_value: Option<serde_json::Value>,
    /// New value; `None` for removals.
    pub new_value: Option<serde_json::Value>,
    /// Origin of the event.
    pub source: ChangeSource,
    /// Backend the mutation landed on.
    pub backend: String,
    /// Emission time, milliseconds since epoch.
    pub timestamp: u64,
}

impl ChangeEvent {
    /// Builds a `Local` event stamped with the current time.
    pub fn local(
        key: impl Into<String>,
        namespace: Option<String>,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            namespace,
            old_value,
            new_value,
            source: ChangeSource::Local,
            backend: backend.into(),
            timestamp: now_millis(),
        }
    }
}

/// Subscriber-side filter, applied before the callback is invoked.
#[derive(Debug, Clone, Default)]
pub struct SubscribeFilter {
    /// Only events from this backend.
    pub backend: Option<String>,
    /// Only events in this namespace.
    pub namespace: Option<String>,
}

impl SubscribeFilter {
    fn accepts(&self, event: &ChangeEvent) -> bool {
        if let Some(backend) = &self.backend {
            if backend != &event.backend {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if event.namespace.as_deref() != Some(namespace.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Envelope broadcast over the cross-instance channel: the event plus the
/// origin identifier used to suppress self-echo.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    /// Origin instance that issued the mutation.
    pub origin: Uuid,
    /// The event as emitted locally on the origin.
    pub event: ChangeEvent,
}

/// Origin-tagged pub/sub channel shared by instances of one logical store.
///
/// Backed by `tokio::sync::broadcast`, which preserves per-sender ordering,
/// the only ordering the contract asks for. Any transport with that property
/// could replace it.
#[derive(Clone)]
pub struct SyncChannel {
    tx: broadcast::Sender<SyncMessage>,
}

impl SyncChannel {
    /// Creates a channel buffering up to `capacity` in-flight messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes a message; lagging or absent receivers are not an error.
    pub fn publish(&self, message: SyncMessage) {
        let _ = self.tx.send(message);
    }

    /// Subscribes a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Fans mutations out to local subscribers and the sync channel.
pub struct ChangeBus {
    origin: Uuid,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, (SubscribeFilter, Callback)>>,
    sync: Option<SyncChannel>,
}

impl ChangeBus {
    /// Creates a bus with a fresh origin identifier. `sync` connects it to a
    /// cross-instance channel; `None` keeps fan-out purely local.
    pub fn new(sync: Option<SyncChannel>) -> Self {
        Self {
            origin: Uuid::new_v4(),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
            sync,
        }
    }

    /// This instance's origin identifier.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Registers a callback. Dropping the returned guard unsubscribes.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: SubscribeFilter,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.write() {
            subs.insert(id, (filter, Arc::new(callback)));
        }
        Subscription {
            id,
            bus: Arc::downgrade(self),
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        let callbacks: Vec<Callback> = {
            let Ok(subs) = self.subscribers.read() else {
                return;
            };
            subs.values()
                .filter(|(filter, _)| filter.accepts(event))
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Emits a local mutation: exactly one synchronous local fan-out, then a
    /// broadcast tagged with this instance's origin.
    pub fn emit_local(&self, event: ChangeEvent) {
        debug_assert_eq!(event.source, ChangeSource::Local);
        self.deliver(&event);
        if let Some(sync) = &self.sync {
            sync.publish(SyncMessage {
                origin: self.origin,
                event,
            });
        }
    }

    /// Handles a message received from the sync channel. Self-originated
    /// messages are dropped; others re-emit locally as `Remote`.
    pub fn handle_sync(&self, message: SyncMessage) {
        if message.origin == self.origin {
            return;
        }
        debug!(origin = %message.origin, key = %message.event.key, "re-emitting remote change");
        let mut event = message.event;
        event.source = ChangeSource::Remote;
        self.deliver(&event);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.remove(&id);
        }
    }
}

/// Guard for one subscription; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    bus: Weak<ChangeBus>,
}

impl Subscription {
    /// Explicitly ends the subscription.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
