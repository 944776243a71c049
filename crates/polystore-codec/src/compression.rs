//! LZ4 compression for stored payloads.
//!
//! The codec is length-prefixed (`compress_prepend_size`), so decompression is
//! self-describing: the envelope's `compressed` flag is the only external hint.

use crate::error::CodecError;

/// Payloads smaller than this are stored uncompressed; LZ4 framing would
/// expand them.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 128;

/// Whether a payload of `len` bytes should be compressed given `threshold`.
pub fn should_compress(len: usize, threshold: usize) -> bool {
    len >= threshold
}

/// Compress payload bytes. The uncompressed length is prepended to the output.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompress a length-prefixed LZ4 payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| CodecError::DecompressionFailed(e.to_string()))
}
