#![warn(missing_docs)]

//! Polystore backend layer: the `StorageBackend` trait every physical store
//! implements, plus the two in-tree reference backends (memory, filesystem).
//!
//! Backends are thin CRUD shims. They never interpret envelope payload bytes;
//! the only fields a queryable backend may index are `expires` and `tags`.

pub mod capability;
pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use capability::Capabilities;
pub use error::BackendError;
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use traits::{key_matches_pattern, BackendSize, EnvelopeFilter, StorageBackend};
