// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value encoding for both cache tiers.
//!
//! JSON is preferred so cached values stay inspectable in the shared store.
//! Values JSON can't represent (maps with non-string keys, for one) fall back
//! to bincode behind a magic prefix that no JSON document can start with.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::CacheError;

/// Marks a bincode payload. JSON text never starts with a NUL byte.
pub const BINARY_MAGIC: &[u8; 4] = b"\x00BIN";

/// Encoding chosen for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Binary,
}

/// Encode `value`, preferring JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Ok(bytes),
        Err(json_err) => {
            let mut out = BINARY_MAGIC.to_vec();
            bincode::serialize_into(&mut out, value).map_err(|bin_err| {
                CacheError::Serialization(format!("json: {json_err}; binary: {bin_err}"))
            })?;
            Ok(out)
        }
    }
}

/// Decode bytes produced by [`encode`]: JSON first, then the binary form.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(json_err) => match bytes.strip_prefix(BINARY_MAGIC.as_slice()) {
            Some(payload) => bincode::deserialize(payload)
                .map_err(|e| CacheError::Deserialization(format!("binary: {e}"))),
            None => Err(CacheError::Deserialization(format!("json: {json_err}"))),
        },
    }
}

#[must_use]
pub fn encoding_of(bytes: &[u8]) -> Encoding {
    if bytes.starts_with(BINARY_MAGIC) {
        Encoding::Binary
    } else {
        Encoding::Json
    }
}
