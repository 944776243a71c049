//! Error taxonomy for the polystore orchestration layer.
//!
//! Availability failures (`BackendUnavailable`) are recovered locally via
//! registry fallback and only surface as `NoAvailableBackend` once every
//! candidate is exhausted. Data-integrity and validation failures are never
//! silently swallowed.

use polystore_backend::BackendError;
use polystore_codec::CodecError;

/// All errors a public store operation can reject with.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed key, value or options. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),
    /// A backend with this name is already registered and not closed.
    #[error("Backend '{0}' is already registered")]
    DuplicateBackend(String),
    /// One backend refused with an availability error; internal fallback trigger.
    #[error("Backend '{0}' unavailable")]
    BackendUnavailable(String),
    /// Every candidate backend was exhausted.
    #[error("No available backend: attempted [{}], registered [{}]",
        attempted.join(", "), registered.join(", "))]
    NoAvailableBackend {
        /// Backends tried for this operation, in order.
        attempted: Vec<String>,
        /// Every backend name known to the registry.
        registered: Vec<String>,
    },
    /// Wrong password or corrupted ciphertext.
    #[error("Decryption failed: wrong password or corrupted ciphertext")]
    Decryption,
    /// Write rejected by a backend size limit.
    #[error("Quota exceeded on backend '{backend}'")]
    QuotaExceeded {
        /// Backend that rejected the write.
        backend: String,
    },
    /// Malformed query condition grammar.
    #[error("Query error: {0}")]
    Query(String),
    /// Operation issued after `close()`.
    #[error("Store is closed")]
    Closed,
    /// Codec failure other than decryption (serialization, compression).
    #[error("Codec error: {0}")]
    Codec(CodecError),
    /// Backend failure other than availability or quota.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::DecryptionFailed | CodecError::TruncatedCiphertext(_) => {
                StoreError::Decryption
            }
            CodecError::MissingPassword => {
                StoreError::Validation("payload is encrypted but no password was provided".into())
            }
            other => StoreError::Codec(other),
        }
    }
}

impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(name) => StoreError::BackendUnavailable(name),
            BackendError::QuotaExceeded { backend, .. } => StoreError::QuotaExceeded { backend },
            BackendError::Closed(name) => StoreError::BackendUnavailable(name),
            BackendError::InvalidPattern(p) => {
                StoreError::Validation(format!("invalid key pattern '{p}'"))
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}
