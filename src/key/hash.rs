use serde_json::Value;
use thiserror::Error;

/// Recursion limit for canonicalizing a query identifier. Identifiers nested
/// deeper than this are rejected rather than hashed, per spec.md §4.1.
const MAX_DEPTH: usize = 15;

/// Stringifications of a single primitive longer than this are truncated so
/// the resulting hash stays bounded regardless of payload size.
const MAX_PRIMITIVE_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HashError {
    #[error("query key nesting exceeds the maximum depth of {MAX_DEPTH}")]
    KeyTooDeep,
}

/// Deterministic structural hash of a normalized query identifier.
///
/// `value` should already be the normalized sequence form (see
/// `key::normalize`), wrapped as a JSON array. The result is a canonical
/// string: equal structures always hash identically regardless of object-key
/// insertion order, and distinct primitive types never collide (`"123"` and
/// `123` hash differently).
pub fn hash(value: &Value) -> Result<String, HashError> {
    canonicalize(value, 0)
}

fn canonicalize(value: &Value, depth: usize) -> Result<String, HashError> {
    if depth > MAX_DEPTH {
        return Err(HashError::KeyTooDeep);
    }

    let out = match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("b:{b}"),
        Value::Number(n) => format!("n:{}", truncate(&n.to_string())),
        Value::String(s) => format!("s:{}", truncate(s)),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(canonicalize(item, depth + 1)?);
            }
            format!("array:{}:[{}]", parts.len(), parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut parts = Vec::with_capacity(keys.len());
            for key in keys {
                let v = canonicalize(&map[key], depth + 1)?;
                parts.push(format!("{}={}", truncate(key), v));
            }
            format!("object:{}:{{{}}}", parts.len(), parts.join(","))
        }
    };

    Ok(out)
}

/// Truncates an over-long primitive stringification, appending a stable tag
/// (the original length) so truncated values still hash deterministically
/// without growing the output unboundedly.
fn truncate(s: &str) -> String {
    if s.len() <= MAX_PRIMITIVE_LEN {
        return s.to_string();
    }
    let boundary = (0..=MAX_PRIMITIVE_LEN)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    format!("{}...trunc:{}", &s[..boundary], s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structurally_equal_values_hash_identically() {
        let a = json!(["users", 1, {"active": true, "role": "admin"}]);
        let b = json!(["users", 1, {"role": "admin", "active": true}]);
        assert_eq!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn string_and_number_never_collide() {
        let s = hash(&json!(["123"])).unwrap();
        let n = hash(&json!([123])).unwrap();
        assert_ne!(s, n);
    }

    #[test]
    fn reordering_object_keys_is_a_no_op() {
        let a = hash(&json!([{"a": 1, "b": 2, "c": 3}])).unwrap();
        let b = hash(&json!([{"c": 3, "a": 1, "b": 2}])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prefix_collision_is_avoided() {
        let user = hash(&json!(["user"])).unwrap();
        let users = hash(&json!(["users"])).unwrap();
        assert_ne!(user, users);
        assert!(!users.starts_with(&user));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut value = json!("leaf");
        for _ in 0..20 {
            value = json!([value]);
        }
        assert_eq!(hash(&value), Err(HashError::KeyTooDeep));
    }

    #[test]
    fn long_primitives_are_truncated_but_deterministic() {
        let long = "x".repeat(5000);
        let value = json!([long]);
        let first = hash(&value).unwrap();
        let second = hash(&value).unwrap();
        assert_eq!(first, second);
        assert!(first.len() < 2000);
    }

    #[test]
    fn determinism_is_independent_of_value_construction_order() {
        let a = hash(&json!([1, "a", [true, Value::Null]])).unwrap();
        let b = hash(&json!([1, "a", [true, Value::Null]])).unwrap();
        assert_eq!(a, b);
    }
}
