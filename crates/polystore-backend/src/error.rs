//! Error types for the polystore-backend subsystem

/// All errors a storage backend can raise.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Backend is (temporarily or permanently) unavailable. The registry
    /// treats this as a fallback trigger, not a data error.
    #[error("Backend '{0}' unavailable")]
    Unavailable(String),
    /// Write rejected because it would exceed the backend's size limit.
    #[error("Quota exceeded on backend '{backend}': {needed} bytes needed, {limit} allowed")]
    QuotaExceeded {
        /// Backend that rejected the write.
        backend: String,
        /// Total bytes the write would have required.
        needed: u64,
        /// Configured limit in bytes.
        limit: u64,
    },
    /// Operation on a backend that was already closed.
    #[error("Backend '{0}' is closed")]
    Closed(String),
    /// Stored document could not be serialized or parsed.
    #[error("Backend serialization error: {0}")]
    Serialization(String),
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed key pattern passed to `keys()`.
    #[error("Invalid key pattern '{0}'")]
    InvalidPattern(String),
}
