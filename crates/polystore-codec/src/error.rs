//! Error types for the polystore-codec subsystem

/// All errors that can occur while encoding or decoding a stored value
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Value could not be serialized to bytes
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    /// Stored bytes could not be deserialized back into a value
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Authentication tag mismatch: wrong password, or data corrupted/tampered
    #[error("Decryption failed: wrong password or corrupted ciphertext")]
    DecryptionFailed,
    /// Payload is encrypted but no password was provided for decode
    #[error("Missing password: payload is encrypted but no password was provided")]
    MissingPassword,
    /// Encrypted payload is too short to contain salt, nonce and ciphertext
    #[error("Malformed encrypted payload: {0} bytes is too short")]
    TruncatedCiphertext(usize),
    /// Envelope invariant violated (e.g. expires earlier than created)
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}
