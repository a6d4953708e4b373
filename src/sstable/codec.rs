//! Value encoding per level.
//!
//! Level 0 stores values verbatim. Deeper levels store live values as LZ4
//! (size-prepended) wrapped in standard base64, which keeps each value a
//! single whitespace-free token. The tombstone literal is stored as-is at
//! every level.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::SstError;
use crate::memtable::{TOMBSTONE, Value};

pub fn is_compressed_level(level: usize) -> bool {
    level >= 1
}

pub fn encode_value(level: usize, value: &Value) -> String {
    match value {
        Value::Tombstone => TOMBSTONE.to_string(),
        Value::Put(v) if is_compressed_level(level) => {
            STANDARD.encode(lz4_flex::compress_prepend_size(v.as_bytes()))
        }
        Value::Put(v) => v.clone(),
    }
}

pub fn decode_value(level: usize, raw: &str) -> Result<Value, SstError> {
    if raw == TOMBSTONE {
        return Ok(Value::Tombstone);
    }
    if !is_compressed_level(level) {
        return Ok(Value::Put(raw.to_string()));
    }

    let packed = STANDARD
        .decode(raw)
        .map_err(|e| SstError::Codec(e.to_string()))?;
    let bytes = lz4_flex::decompress_size_prepended(&packed)
        .map_err(|e| SstError::Codec(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| SstError::Codec(e.to_string()))?;
    Ok(Value::Put(text))
}
