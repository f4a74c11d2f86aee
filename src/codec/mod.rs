// ============================================================================
// Codec
// ============================================================================
//
// Reversible transform applied to values before they reach the store:
//
//   value -> serde_json text -> raw DEFLATE -> base64
//
// Encoded text uses only the base64 alphabet: no quotes, separators or
// control characters.
//
// ============================================================================

use crate::core::{HotCloseError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;

/// Text-to-text transform with an exact round trip.
pub trait Codec: Send + Sync {
    fn encode_text(&self, plain: &str) -> Result<String>;

    /// Fails with `CorruptData`; never returns a partial result.
    fn decode_text(&self, encoded: &str) -> Result<String>;
}

/// Serialize `value` to JSON and push it through `codec`.
pub fn encode_value<T: Serialize + ?Sized>(codec: &dyn Codec, value: &T) -> Result<String> {
    let json = serde_json::to_string(value)
        .map_err(|e| HotCloseError::CorruptData(format!("Failed to serialize value: {}", e)))?;
    codec.encode_text(&json)
}

pub fn decode_value<T: DeserializeOwned>(codec: &dyn Codec, encoded: &str) -> Result<T> {
    let json = codec.decode_text(encoded)?;
    serde_json::from_str(&json)
        .map_err(|e| HotCloseError::CorruptData(format!("Failed to deserialize value: {}", e)))
}

#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: Compression,
}

impl DeflateCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for DeflateCodec {
    fn encode_text(&self, plain: &str) -> Result<String> {
        let mut encoder = DeflateEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(plain.as_bytes())
            .map_err(|e| HotCloseError::CorruptData(format!("Failed to compress: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| HotCloseError::CorruptData(format!("Failed to finish compression: {}", e)))?;
        Ok(STANDARD.encode(compressed))
    }

    fn decode_text(&self, encoded: &str) -> Result<String> {
        let compressed = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| HotCloseError::CorruptData(format!("Invalid base64: {}", e)))?;
        let bytes = inflate(&compressed)?;
        String::from_utf8(bytes)
            .map_err(|e| HotCloseError::CorruptData(format!("Decoded bytes are not UTF-8: {}", e)))
    }
}

// A stream that stops before its end marker is an error, not a short read.
fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(compressed.len().saturating_mul(4).max(64));

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(256));
        }
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let offset = usize::try_from(before_in)
            .map_err(|_| HotCloseError::CorruptData("Deflate stream too large".to_string()))?;

        let status = inflater
            .decompress_vec(&compressed[offset..], &mut out, FlushDecompress::None)
            .map_err(|e| HotCloseError::CorruptData(format!("Invalid deflate stream: {}", e)))?;

        match status {
            Status::StreamEnd => break,
            _ if inflater.total_in() == before_in && inflater.total_out() == before_out => {
                return Err(HotCloseError::CorruptData("Truncated deflate stream".to_string()));
            }
            _ => {}
        }
    }

    if inflater.total_in() != compressed.len() as u64 {
        return Err(HotCloseError::CorruptData(
            "Trailing bytes after deflate stream".to_string(),
        ));
    }
    Ok(out)
}
