//! The encode/decode pipeline tying serialization, compression and encryption
//! together in a fixed, order-sensitive sequence.
//!
//! Encode: serialize → compress (above threshold) → encrypt.
//! Decode is the exact inverse; the envelope flags say which steps to undo.

use serde_json::Value;

use crate::compression;
use crate::encryption::{self, KdfParams};
use crate::error::CodecError;

/// Per-call encode configuration.
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Compress the serialized value when it meets the threshold.
    pub compress: bool,
    /// Minimum serialized size for compression to apply. None uses
    /// [`compression::DEFAULT_COMPRESSION_THRESHOLD`].
    pub compression_threshold: Option<usize>,
    /// Encrypt with this password after any compression.
    pub password: Option<String>,
    /// Key-derivation parameters for encryption.
    pub kdf: KdfParams,
}

/// Per-call decode configuration.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Password for encrypted payloads.
    pub password: Option<String>,
    /// Map decryption failures to `Ok(None)` instead of an error.
    pub ignore_decryption_errors: bool,
    /// Key-derivation parameters, must match the ones used at encode time.
    pub kdf: KdfParams,
}

/// Result of encoding: payload bytes plus the flags describing their layout.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    /// The bytes a backend will store.
    pub bytes: Vec<u8>,
    /// True if the compression step ran.
    pub compressed: bool,
    /// True if the encryption step ran.
    pub encrypted: bool,
}

/// Encode a value into storable payload bytes.
pub fn encode_value(value: &Value, opts: &EncodeOptions) -> Result<EncodedPayload, CodecError> {
    let serialized =
        serde_json::to_vec(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))?;

    let threshold = opts
        .compression_threshold
        .unwrap_or(compression::DEFAULT_COMPRESSION_THRESHOLD);
    let (bytes, compressed) = if opts.compress && compression::should_compress(serialized.len(), threshold)
    {
        (compression::compress(&serialized), true)
    } else {
        (serialized, false)
    };

    let (bytes, encrypted) = match &opts.password {
        Some(password) => (
            encryption::encrypt_with_password(&bytes, password, opts.kdf)?,
            true,
        ),
        None => (bytes, false),
    };

    Ok(EncodedPayload {
        bytes,
        compressed,
        encrypted,
    })
}

/// Decode payload bytes back into a value.
///
/// `Ok(None)` is returned only when `ignore_decryption_errors` is set and
/// decryption failed; every other failure is a typed error.
pub fn decode_value(
    payload: &[u8],
    encrypted: bool,
    compressed: bool,
    opts: &DecodeOptions,
) -> Result<Option<Value>, CodecError> {
    let decrypted;
    let mut bytes: &[u8] = payload;

    if encrypted {
        let password = match &opts.password {
            Some(p) => p,
            None if opts.ignore_decryption_errors => return Ok(None),
            None => return Err(CodecError::MissingPassword),
        };
        match encryption::decrypt_with_password(bytes, password, opts.kdf) {
            Ok(plain) => {
                decrypted = plain;
                bytes = &decrypted;
            }
            Err(CodecError::DecryptionFailed) | Err(CodecError::TruncatedCiphertext(_))
                if opts.ignore_decryption_errors =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }

    let decompressed;
    if compressed {
        decompressed = compression::decompress(bytes)?;
        bytes = &decompressed;
    }

    let value = serde_json::from_slice(bytes)
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
    Ok(Some(value))
}
