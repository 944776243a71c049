//! Static capability descriptors for registered backends.
//!
//! The registry reads these once at registration to rank candidates and for
//! diagnostics; behavior is never probed at runtime beyond `is_available()`.

use serde::{Deserialize, Serialize};

/// Static facts about a backend implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Data survives process restart.
    pub persistent: bool,
    /// Operations complete without real I/O suspension.
    pub synchronous: bool,
    /// Backend can push change notifications of its own.
    pub observable: bool,
    /// Backend supports multi-operation transactions.
    pub transactional: bool,
    /// Backend can evaluate envelope-field filters natively (tags, expiry).
    pub queryable: bool,
    /// Size limit in bytes. None means unbounded.
    pub max_size: Option<u64>,
    /// Stores arbitrary bytes without escaping.
    pub binary_safe: bool,
    /// Backend encrypts at rest by itself.
    pub natively_encrypted: bool,
    /// Writes are visible to other instances of the same logical store.
    pub cross_instance_visible: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            persistent: false,
            synchronous: true,
            observable: false,
            transactional: false,
            queryable: false,
            max_size: None,
            binary_safe: true,
            natively_encrypted: false,
            cross_instance_visible: false,
        }
    }
}
