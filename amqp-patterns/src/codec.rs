//! Fail-soft JSON codec for message bodies.
//!
//! Consumer loops must never stop on a bad payload, so decoding substitutes an
//! empty object and encoding falls back to `{}`.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Content type stamped on every encoded body
pub const CONTENT_TYPE: &str = "application/json";

/// The value substituted for undecodable payloads
pub fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Decode a body, returning an empty object when the bytes are not valid JSON
pub fn decode(bytes: &[u8]) -> Value {
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!("Substituting empty payload for undecodable body ({} bytes): {}", bytes.len(), e);
            empty_payload()
        }
    }
}

/// Encode a value, returning `{}` when it cannot be represented as JSON
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Substituting empty payload for unencodable value: {}", e);
            b"{}".to_vec()
        }
    }
}
