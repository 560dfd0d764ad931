//! Canonical JSON and SHA-256 digests.
//!
//! Manifests, lineage tags and promotion ids all hash canonical JSON:
//! object keys sorted by UTF-16 code units, arrays in order, compact output.
//! Non-finite floats are rejected rather than silently turned into `null`.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::error::{CrucibleError, Result};

fn canonicalize(value: &Value) -> Result<Value> {
    Ok(match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()])?);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(canonicalize)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CrucibleError::Internal(
                        "non-finite number in canonical JSON".to_string(),
                    ));
                }
            }
            Value::Number(n.clone())
        }
        other => other.clone(),
    })
}

/// Serialize `value` to canonical JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(&raw)?)?)
}

/// SHA-256 hex of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex of the canonical JSON form of `value`.
pub fn compute_digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_digest() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
        assert_eq!(canonical_json(&a).unwrap(), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn array_order_matters() {
        let a = json!({"v": [1, 2]});
        let b = json!({"v": [2, 1]});
        assert_ne!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn int_and_float_stay_distinct() {
        assert_eq!(canonical_json(&json!({"v": 1})).unwrap(), r#"{"v":1}"#);
        assert_eq!(canonical_json(&json!({"v": 1.5})).unwrap(), r#"{"v":1.5}"#);
    }

    #[test]
    fn digest_is_64_hex() {
        let d = compute_digest(&json!({"name": "x"})).unwrap();
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
