//! Structured-output schema validation.
//!
//! The engine honors a deliberately small slice of JSON Schema: required
//! fields, primitive type matches, literal `const` constraints (including
//! single-value `enum`), one level of `$ref` into `$defs`, and recursion
//! into object properties and array items. Anything else in a schema
//! document is ignored rather than rejected.

use crate::error::ConfigError;
use serde_json::Value as JsonValue;
use std::path::Path;

/// One violation, anchored to a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A loaded JSON Schema document with `$defs`.
#[derive(Debug, Clone)]
pub struct SchemaDocument {
    raw: JsonValue,
}

impl SchemaDocument {
    pub fn new(raw: JsonValue) -> Self {
        Self { raw }
    }

    /// Reads a schema document from disk.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(raw))
    }

    /// Extracts the named schema: a top-level key, or an entry in `$defs`.
    pub fn named(&self, name: &str) -> Option<&JsonValue> {
        self.raw
            .pointer(&format!("/$defs/{name}"))
            .or_else(|| self.raw.get(name))
            .or(if name.is_empty() { Some(&self.raw) } else { None })
    }

    /// Validates `value` against the named schema. An unknown schema name
    /// is a single violation rather than a panic.
    pub fn validate(&self, name: &str, value: &JsonValue) -> Vec<SchemaViolation> {
        let Some(schema) = self.named(name) else {
            return vec![SchemaViolation {
                path: "$".to_string(),
                message: format!("schema {name} not found in document"),
            }];
        };
        let mut violations = Vec::new();
        self.check(schema, value, "$", &mut violations);
        violations
    }

    fn resolve<'a>(&'a self, schema: &'a JsonValue) -> &'a JsonValue {
        if let Some(reference) = schema.get("$ref").and_then(JsonValue::as_str) {
            if let Some(resolved) = reference
                .strip_prefix("#/$defs/")
                .and_then(|name| self.raw.pointer(&format!("/$defs/{name}")))
            {
                return resolved;
            }
        }
        schema
    }

    fn check(
        &self,
        schema: &JsonValue,
        value: &JsonValue,
        path: &str,
        violations: &mut Vec<SchemaViolation>,
    ) {
        let schema = self.resolve(schema);

        if let Some(expected) = schema.get("const") {
            if value != expected {
                violations.push(SchemaViolation {
                    path: path.to_string(),
                    message: format!("expected literal {expected}, got {value}"),
                });
                return;
            }
        }
        if let Some(options) = schema.get("enum").and_then(JsonValue::as_array) {
            if options.len() == 1 && value != &options[0] {
                violations.push(SchemaViolation {
                    path: path.to_string(),
                    message: format!("expected literal {}, got {value}", options[0]),
                });
                return;
            }
        }

        if let Some(expected_type) = schema.get("type").and_then(JsonValue::as_str) {
            if !type_matches(expected_type, value) {
                violations.push(SchemaViolation {
                    path: path.to_string(),
                    message: format!("expected {expected_type}, got {}", type_name(value)),
                });
                return;
            }
        }

        if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
            for name in required.iter().filter_map(JsonValue::as_str) {
                if value.get(name).is_none() {
                    violations.push(SchemaViolation {
                        path: format!("{path}.{name}"),
                        message: "required field missing".to_string(),
                    });
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) {
            for (name, property_schema) in properties {
                if let Some(property_value) = value.get(name) {
                    self.check(
                        property_schema,
                        property_value,
                        &format!("{path}.{name}"),
                        violations,
                    );
                }
            }
        }

        if let Some(item_schema) = schema.get("items") {
            if let Some(items) = value.as_array() {
                for (i, item) in items.iter().enumerate() {
                    self.check(item_schema, item, &format!("{path}[{i}]"), violations);
                }
            }
        }
    }
}

fn type_matches(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> SchemaDocument {
        SchemaDocument::new(json!({
            "$defs": {
                "CloseAction": {
                    "type": "object",
                    "required": ["action", "issue"],
                    "properties": {
                        "action": {"const": "close"},
                        "issue": {"type": "integer"},
                        "labels": {"type": "array", "items": {"type": "string"}},
                        "detail": {"$ref": "#/$defs/Detail"}
                    }
                },
                "Detail": {
                    "type": "object",
                    "required": ["reason"],
                    "properties": {"reason": {"type": "string"}}
                }
            }
        }))
    }

    #[test]
    fn test_valid_value_produces_no_violations() {
        let doc = document();
        let value = json!({"action": "close", "issue": 42, "labels": ["bug"]});
        assert!(doc.validate("CloseAction", &value).is_empty());
    }

    #[test]
    fn test_missing_required_field_is_reported_with_path() {
        let doc = document();
        let value = json!({"action": "close"});
        let violations = doc.validate("CloseAction", &value);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "$.issue");
        assert_eq!(violations[0].message, "required field missing");
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let doc = document();
        let value = json!({"action": "close", "issue": "forty-two"});
        let violations = doc.validate("CloseAction", &value);
        assert!(
            violations
                .iter()
                .any(|v| v.path == "$.issue" && v.message.contains("expected integer")),
            "violations: {violations:?}"
        );
    }

    #[test]
    fn test_literal_constraint_is_honored() {
        let doc = document();
        let value = json!({"action": "reopen", "issue": 1});
        let violations = doc.validate("CloseAction", &value);
        assert!(
            violations
                .iter()
                .any(|v| v.path == "$.action" && v.message.contains("expected literal")),
            "violations: {violations:?}"
        );
    }

    #[test]
    fn test_ref_into_defs_is_resolved() {
        let doc = document();
        let value = json!({"action": "close", "issue": 1, "detail": {}});
        let violations = doc.validate("CloseAction", &value);
        assert!(
            violations.iter().any(|v| v.path == "$.detail.reason"),
            "nested $ref schemas are applied: {violations:?}"
        );
    }

    #[test]
    fn test_array_items_are_checked() {
        let doc = document();
        let value = json!({"action": "close", "issue": 1, "labels": ["ok", 7]});
        let violations = doc.validate("CloseAction", &value);
        assert!(
            violations.iter().any(|v| v.path == "$.labels[1]"),
            "violations: {violations:?}"
        );
    }

    #[test]
    fn test_unknown_schema_name_is_a_violation() {
        let doc = document();
        let violations = doc.validate("Nope", &json!({}));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("not found"));
    }
}
