//! Optional response validation, applied after a successful transport call.

use serde_json::Value;

use crate::error::QueryError;

/// Validates (and typically deserializes) a raw transport payload into `V`.
///
/// A validation failure is surfaced as a [`crate::error::QueryErrorKind::Validation`]
/// error, exactly as if the fetch itself had failed (spec.md §4.5 step 5).
pub trait SchemaValidator<V> {
    fn parse(&self, raw: Value) -> Result<V, QueryError>;
}

/// Validates via `V`'s own `serde::Deserialize` impl — the common case.
pub struct SerdeSchema;

impl<V> SchemaValidator<V> for SerdeSchema
where
    V: serde::de::DeserializeOwned,
{
    fn parse(&self, raw: Value) -> Result<V, QueryError> {
        serde_json::from_value(raw).map_err(QueryError::validation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Widget {
        id: u32,
    }

    #[test]
    fn serde_schema_parses_matching_shape() {
        let result: Result<Widget, _> = SerdeSchema.parse(json!({"id": 7}));
        assert_eq!(result.unwrap(), Widget { id: 7 });
    }

    #[test]
    fn serde_schema_surfaces_mismatch_as_validation_error() {
        let result: Result<Widget, _> = SerdeSchema.parse(json!({"id": "not-a-number"}));
        let err = result.unwrap_err();
        assert_eq!(err.kind, crate::error::QueryErrorKind::Validation);
    }
}
