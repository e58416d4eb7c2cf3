//! Canonical argument serialization and call-identity digests.
//!
//! Loop signatures and idempotency keys must be stable across semantically
//! identical calls, so arguments are serialized with recursively sorted
//! object keys before hashing. Array order is preserved (it is meaningful).

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys and render compact JSON.
pub(crate) fn canonical_json(value: &Value) -> String {
    fn sort_keys(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = serde_json::Map::new();
                for key in keys {
                    if let Some(v) = map.get(key) {
                        sorted.insert(key.clone(), sort_keys(v));
                    }
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
            other => other.clone(),
        }
    }

    sort_keys(value).to_string()
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of the canonical arguments alone.
pub(crate) fn args_digest(args: &Value) -> String {
    sha256_hex(&[&canonical_json(args)])
}

/// Loop signature: identifies "the same call" for repetition counting.
pub(crate) fn loop_signature(tool_name: &str, args: &Value) -> String {
    sha256_hex(&[tool_name, &canonical_json(args)])
}

/// Idempotency key: scopes cached results to (tool, run, arguments).
pub(crate) fn idempotency_key(tool_name: &str, run_key: &str, args: &Value) -> String {
    sha256_hex(&[tool_name, run_key, &canonical_json(args)])
}
