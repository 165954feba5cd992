//! Query identifiers and their canonicalization into hashed keys.

mod hash;

pub use hash::{hash, HashError};

use serde::Serialize;
use serde_json::Value;

/// Convenience trait for query key requirements.
///
/// Any `Debug + Clone + Serialize` type works as a key — typically a tuple
/// or small struct, e.g. `("users", user_id)`. Serde serializes tuples and
/// structs as JSON arrays/objects, which is exactly the "ordered sequence of
/// arbitrary structured values" spec.md §3 describes.
pub trait QueryKey: std::fmt::Debug + Clone {
    fn to_value(&self) -> Value;
}

impl<K> QueryKey for K
where
    K: std::fmt::Debug + Clone + Serialize,
{
    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Normalizes a query identifier value into its ordered-sequence form.
///
/// The `{key: [...], params: {...}}` object form becomes `[key, params]`;
/// every other shape (already a sequence, or a bare scalar) passes through
/// unchanged, per spec.md §3.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Object(ref map) if map.len() == 2 && map.contains_key("key") && map.contains_key("params") => {
            let key = map.get("key").cloned().unwrap_or(Value::Null);
            let params = map.get("params").cloned().unwrap_or(Value::Null);
            Value::Array(vec![key, params])
        }
        other => other,
    }
}

/// Normalizes and hashes a query key in one step.
pub fn hashed_key<K: QueryKey>(key: &K) -> Result<String, HashError> {
    hash(&normalize(key.to_value()))
}
