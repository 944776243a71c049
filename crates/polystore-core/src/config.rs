//! Store-wide configuration.

use std::time::Duration;

use polystore_codec::KdfParams;

use crate::ttl::SweepConfig;

/// Configuration for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Default backend preference order for operations that do not target
    /// backends explicitly. Empty means registration order.
    pub default_order: Vec<String>,
    /// Minimum serialized size before compression applies. None uses the
    /// codec default.
    pub compression_threshold: Option<usize>,
    /// Key-derivation parameters for password-based encryption.
    pub kdf: KdfParams,
    /// TTL assumed by `extend_ttl` when an entry has no expiration yet.
    pub default_ttl: Option<Duration>,
    /// Background sweep scheduling.
    pub sweep: SweepConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_order: Vec::new(),
            compression_threshold: None,
            kdf: KdfParams::default(),
            default_ttl: None,
            sweep: SweepConfig::default(),
        }
    }
}
