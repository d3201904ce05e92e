//! Order-independent fingerprint of checkout parameters.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort object keys; arrays keep their order.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), normalize(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 of the compact JSON encoding of the normalized params.
pub fn params_hash(params: &Value) -> String {
    let canonical = normalize(params).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
