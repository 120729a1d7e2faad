//! Gzip helpers for cached payloads and storage snapshots
//!
//! Cache entries are persisted as JSON, so compressed payloads travel as
//! base64 text; backups stay binary.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CommonError, CommonResult};

/// Default gzip level; favours speed over ratio
pub const DEFAULT_LEVEL: u32 = 6;

/// Gzip-compress `data` at `level` (clamped to 0..=9)
pub fn gzip(data: &[u8], level: u32) -> CommonResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| CommonError::internal_with_context(e.to_string(), "gzip compress"))?;
    encoder
        .finish()
        .map_err(|e| CommonError::internal_with_context(e.to_string(), "gzip finish"))
}

/// Inflate a gzip stream
pub fn gunzip(data: &[u8]) -> CommonResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| CommonError::serialization_format("gzip", e.to_string()))?;
    Ok(inflated)
}

/// Gzip then base64-encode, for embedding in JSON records
pub fn compress_to_text(data: &[u8]) -> CommonResult<String> {
    Ok(STANDARD.encode(gzip(data, DEFAULT_LEVEL)?))
}

/// Reverse of [`compress_to_text`]
pub fn decompress_text(text: &str) -> CommonResult<Vec<u8>> {
    let raw = STANDARD
        .decode(text)
        .map_err(|e| CommonError::serialization_format("base64", e.to_string()))?;
    gunzip(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_encoding_restores_bytes() {
        let payload = br#"{"city":"Lisbon","forecast":["sun","sun","rain"]}"#;
        let text = compress_to_text(payload).unwrap();
        assert!(!text.is_empty());
        assert_eq!(decompress_text(&text).unwrap(), payload.to_vec());
    }

    #[test]
    fn repetitive_input_shrinks() {
        let payload = "tide ".repeat(2_000);
        let compressed = gzip(payload.as_bytes(), 9).unwrap();
        assert!(compressed.len() < payload.len() / 10);
    }

    #[test]
    fn corrupt_input_is_a_serialization_error() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert_eq!(err.error_type_name(), "serialization");

        let err = decompress_text("***").unwrap_err();
        assert!(err.to_string().contains("base64"));
    }
}
