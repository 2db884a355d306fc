//! LZ4 compression for large message bodies
//!
//! Journal records carry the body compressed when it exceeds a threshold
//! and compression actually saves space.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Minimum body size in bytes before compression is attempted
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Compress data if it exceeds the threshold
/// Returns None if the data should be stored as-is
pub fn compress_if_needed(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESSION_THRESHOLD {
        return None;
    }

    let compressed = compress_prepend_size(data);

    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress LZ4-compressed data
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, lz4_flex::block::DecompressError> {
    decompress_size_prepended(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_body_left_alone() {
        assert!(compress_if_needed(b"m1").is_none());
    }

    #[test]
    fn test_large_body_round_trips() {
        let large = "order-created ".repeat(40);
        let compressed = compress_if_needed(large.as_bytes()).unwrap();
        assert!(compressed.len() < large.len());
        assert_eq!(decompress(&compressed).unwrap(), large.as_bytes());
    }
}
