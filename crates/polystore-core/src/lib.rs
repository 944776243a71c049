#![warn(missing_docs)]

//! Polystore orchestration layer: one logical key/value API over multiple
//! interchangeable physical backends.
//!
//! Write path: value → codec (serialize → compress → encrypt) → registry
//! (resolve + fallback) → backend.set → change bus fan-out.
//! Read path: backend.get → codec decode → TTL check (lazy eviction,
//! sliding reset) → value.

pub mod bus;
pub mod config;
pub mod error;
pub mod options;
pub mod orchestrator;
pub mod query;
pub mod registry;
pub mod ttl;

pub use bus::{ChangeBus, ChangeEvent, ChangeSource, SubscribeFilter, Subscription, SyncChannel};
pub use config::StoreConfig;
pub use error::StoreError;
pub use options::{CommonOptions, GetOptions, QueryOptions, SetOptions, SortOrder};
pub use orchestrator::{PolyStore, QueryResult, StoreBuilder, TtlStatus};
pub use query::{Condition, QueryHit};
pub use registry::AdapterRegistry;
pub use ttl::{ExpirationCallback, SweepConfig, SweeperHandle};

pub use polystore_backend::{
    BackendError, BackendSize, Capabilities, EnvelopeFilter, FsBackend, MemoryBackend,
    StorageBackend,
};
pub use polystore_codec::{CodecError, Envelope, KdfParams};
