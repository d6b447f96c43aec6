//! Transparent compression for quota-limited storage.
//!
//! Uses zstd compression with magic-bytes detection so chunks written as
//! plain JSON (feature disabled, or older data) still decode.
//!
//! # Feature Flag
//!
//! Compression is behind the default `compression` feature. Without it,
//! chunks are written as plain JSON and compressed chunks fail to decode.
//!
//! # Why the quota tier only?
//!
//! The quota tier has a hard byte ceiling; a month of schedule JSON
//! compresses by 80-90%, which is the difference between fitting and being
//! abandoned. The indexed tier has no meaningful ceiling and keeps plain
//! JSON so it stays inspectable.
//!
//! # Example
//!
//! ```rust,ignore
//! use flight_sync::compression::{encode_records, decode_records};
//!
//! let bytes = encode_records(&records)?;
//! assert_eq!(decode_records(&bytes)?, records);
//! ```

use crate::record::FlightRecord;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("JSON parse failed: {0}")]
    JsonParseFailed(#[from] serde_json::Error),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Serialize a chunk of records, compressed when the feature is on.
pub fn encode_records(records: &[FlightRecord]) -> Result<Vec<u8>, CompressionError> {
    let json_bytes = serde_json::to_vec(records)?;
    compress_bytes(&json_bytes)
}

/// Inverse of [`encode_records`]; accepts plain JSON as well.
pub fn decode_records(data: &[u8]) -> Result<Vec<FlightRecord>, CompressionError> {
    let bytes = decompress_bytes(data)?;
    serde_json::from_slice(&bytes).map_err(CompressionError::from)
}

#[cfg(feature = "compression")]
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

#[cfg(not(feature = "compression"))]
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Ok(data.to_vec())
}

/// Returns original bytes if not compressed.
#[cfg(feature = "compression")]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data)
            .map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(not(feature = "compression"))]
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        Err(CompressionError::DecompressFailed(
            "zstd data but compression feature is disabled".to_string(),
        ))
    } else {
        Ok(data.to_vec())
    }
}

/// Compression statistics for a single operation.
#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
    /// Space saved as percentage (0.0 - 1.0)
    pub savings: f64,
}

impl CompressionStats {
    #[must_use]
    pub fn new(original_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if compressed_bytes > 0 {
            original_bytes as f64 / compressed_bytes as f64
        } else {
            0.0
        };
        let savings = if original_bytes > 0 {
            1.0 - (compressed_bytes as f64 / original_bytes as f64)
        } else {
            0.0
        };
        Self {
            original_bytes,
            compressed_bytes,
            ratio,
            savings,
        }
    }
}

/// Encode and return stats.
pub fn encode_with_stats(records: &[FlightRecord]) -> Result<(Vec<u8>, CompressionStats), CompressionError> {
    let json_bytes = serde_json::to_vec(records)?;
    let original_size = json_bytes.len();
    let encoded = compress_bytes(&json_bytes)?;
    let stats = CompressionStats::new(original_size, encoded.len());
    Ok((encoded, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn month_of_records(n: u32) -> Vec<FlightRecord> {
        (1..=n)
            .map(|d| {
                FlightRecord::new(
                    format!("f-{}", d),
                    "OZ101",
                    NaiveDate::from_ymd_opt(2024, 5, d).unwrap(),
                )
                .with_route("ICN-NRT")
                .with_times("09:00", "11:20")
            })
            .collect()
    }

    #[test]
    fn test_encode_decode_records() {
        let records = month_of_records(5);
        let bytes = encode_records(&records).unwrap();
        assert_eq!(decode_records(&bytes).unwrap(), records);
    }

    #[test]
    fn test_decode_plain_json() {
        let records = month_of_records(2);
        let plain = serde_json::to_vec(&records).unwrap();
        assert!(!is_compressed(&plain));
        assert_eq!(decode_records(&plain).unwrap(), records);
    }

    #[test]
    fn test_is_compressed_detection() {
        assert!(!is_compressed(b"[]"));
        assert!(!is_compressed(b""));
        assert!(is_compressed(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_records(b"not json at all").is_err());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_schedule_compresses_well() {
        let (bytes, stats) = encode_with_stats(&month_of_records(28)).unwrap();
        assert!(is_compressed(&bytes));
        assert!(stats.savings > 0.5, "Expected >50% savings, got {:.1}%", stats.savings * 100.0);
    }

    #[test]
    fn test_compression_stats() {
        let stats = CompressionStats::new(1000, 250);
        assert_eq!(stats.ratio, 4.0);
        assert_eq!(stats.savings, 0.75);

        let empty = CompressionStats::new(0, 0);
        assert_eq!(empty.ratio, 0.0);
        assert_eq!(empty.savings, 0.0);
    }
}
