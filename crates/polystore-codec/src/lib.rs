#![warn(missing_docs)]

//! Polystore value codec: envelope model, compression, password-based encryption
//!
//! Encode path: Value → serialize (JSON) → compress (LZ4, above threshold) → encrypt (AES-GCM)
//! Decode path: decrypt → decompress → deserialize

pub mod compression;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod pipeline;

pub use compression::{compress, decompress, should_compress, DEFAULT_COMPRESSION_THRESHOLD};
pub use encryption::{decrypt_with_password, encrypt_with_password, KdfParams};
pub use envelope::{now_millis, Envelope};
pub use error::CodecError;
pub use pipeline::{decode_value, encode_value, DecodeOptions, EncodeOptions, EncodedPayload};
