//! Tool argument validation.
//!
//! Arguments are validated against the tool's declared input schema before
//! any request is written, so malformed calls never reach the server.
//! Schemas are compiled with `jsonschema` once per capability snapshot and
//! cached in [`ToolSchemas`].
//!
//! A schema that fails to compile is logged and not enforced; the server
//! still validates on its side.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use jsonschema::Validator;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::ToolInfo;

// ============================================================================
// Public API
// ============================================================================

/// Validates `arguments` against the input schema of `tool`.
///
/// Compiles the schema on every call. Pools validate through the cached
/// [`ToolSchemas`] of their capability snapshot instead.
///
/// # Errors
///
/// Returns [`Error::Schema`] naming the first offending location.
pub fn validate_arguments(tool: &ToolInfo, arguments: &Value) -> Result<()> {
    match compile(tool) {
        Some(validator) => check(&validator, tool, arguments),
        None => Ok(()),
    }
}

// ============================================================================
// ToolSchemas
// ============================================================================

/// Compiled input schemas, keyed by tool name.
#[derive(Clone, Default)]
pub struct ToolSchemas {
    /// `None` marks a schema that did not compile.
    validators: FxHashMap<String, Option<Arc<Validator>>>,
}

impl ToolSchemas {
    /// Compiles the input schema of every tool.
    #[must_use]
    pub fn compile(tools: &[ToolInfo]) -> Self {
        let validators = tools
            .iter()
            .map(|tool| (tool.name.clone(), compile(tool).map(Arc::new)))
            .collect();
        Self { validators }
    }

    /// Number of tools with a cached entry.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns `true` if nothing is cached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validates `arguments` for `tool`, compiling on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] naming the first offending location.
    pub fn validate(&self, tool: &ToolInfo, arguments: &Value) -> Result<()> {
        match self.validators.get(&tool.name) {
            Some(Some(validator)) => check(validator, tool, arguments),
            Some(None) => Ok(()),
            None => validate_arguments(tool, arguments),
        }
    }
}

impl std::fmt::Debug for ToolSchemas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

// ============================================================================
// Validation
// ============================================================================

fn compile(tool: &ToolInfo) -> Option<Validator> {
    match jsonschema::validator_for(&tool.input_schema) {
        Ok(validator) => Some(validator),
        Err(e) => {
            warn!(tool = %tool.name, error = %e, "Input schema does not compile, skipping validation");
            None
        }
    }
}

fn check(validator: &Validator, tool: &ToolInfo, arguments: &Value) -> Result<()> {
    let Some(violation) = validator.iter_errors(arguments).next() else {
        return Ok(());
    };

    let path = violation.instance_path.to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };
    Err(Error::schema(&tool.name, path, violation.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn tool(schema: Value) -> ToolInfo {
        ToolInfo {
            name: "add".to_string(),
            title: None,
            description: None,
            input_schema: schema,
        }
    }

    fn add_tool() -> ToolInfo {
        tool(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate_arguments(&add_tool(), &json!({"a": 1, "b": 2})).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate_arguments(&add_tool(), &json!({"a": 1})).unwrap_err();
        match err {
            Error::Schema { tool, path, message } => {
                assert_eq!(tool, "add");
                assert_eq!(path, "/");
                assert!(message.contains("\"b\""), "{message}");
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let err = validate_arguments(&add_tool(), &json!({"a": 1, "b": "two"})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/b"));
    }

    #[test]
    fn test_additional_properties_rejected() {
        let err =
            validate_arguments(&add_tool(), &json!({"a": 1, "b": 2, "c": 3})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/"));
    }

    #[test]
    fn test_fractional_number_is_not_integer() {
        assert!(validate_arguments(&add_tool(), &json!({"a": 1.5, "b": 2})).is_err());
    }

    #[test]
    fn test_nested_items_and_bounds() {
        let schema = tool(json!({
            "type": "object",
            "properties": {
                "tags": {
                    "type": "array",
                    "items": {"type": "string", "minLength": 1},
                    "maxItems": 2
                },
                "score": {"type": "number", "minimum": 0, "maximum": 1}
            }
        }));
        assert!(validate_arguments(&schema, &json!({"tags": ["x"], "score": 0.5})).is_ok());

        let err = validate_arguments(&schema, &json!({"tags": ["x", ""]})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/tags/1"));

        assert!(validate_arguments(&schema, &json!({"tags": ["a", "b", "c"]})).is_err());
        assert!(validate_arguments(&schema, &json!({"score": 2})).is_err());
    }

    #[test]
    fn test_enum_const_and_union_types() {
        let schema = tool(json!({
            "type": "object",
            "properties": {
                "mode": {"enum": ["fast", "slow"]},
                "version": {"const": 2},
                "limit": {"type": ["integer", "null"]}
            }
        }));
        assert!(validate_arguments(&schema, &json!({"mode": "fast", "limit": null})).is_ok());
        assert!(validate_arguments(&schema, &json!({"mode": "medium"})).is_err());
        assert!(validate_arguments(&schema, &json!({"version": 3})).is_err());
        assert!(validate_arguments(&schema, &json!({"limit": "ten"})).is_err());
    }

    #[test]
    fn test_pattern_any_of_and_exclusive_bounds() {
        let schema = tool(json!({
            "type": "object",
            "properties": {
                "q": {"type": "string", "pattern": "^[a-z]+$"},
                "n": {"anyOf": [{"type": "integer"}, {"type": "null"}]},
                "x": {"type": "number", "exclusiveMinimum": 0}
            }
        }));
        assert!(validate_arguments(&schema, &json!({"q": "abc", "n": null, "x": 0.5})).is_ok());

        let err = validate_arguments(&schema, &json!({"q": "ABC!"})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/q"));

        let err = validate_arguments(&schema, &json!({"n": "str"})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/n"));

        let err = validate_arguments(&schema, &json!({"x": 0})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/x"));
    }

    #[test]
    fn test_local_refs_are_resolved() {
        let schema = tool(json!({
            "type": "object",
            "$defs": {"port": {"type": "integer", "minimum": 1, "maximum": 65535}},
            "properties": {"port": {"$ref": "#/$defs/port"}}
        }));
        assert!(validate_arguments(&schema, &json!({"port": 8080})).is_ok());

        let err = validate_arguments(&schema, &json!({"port": 0})).unwrap_err();
        assert!(matches!(err, Error::Schema { ref path, .. } if path == "/port"));
    }

    #[test]
    fn test_permissive_schema() {
        let schema = tool(json!({}));
        assert!(validate_arguments(&schema, &json!({"anything": [1, "two", null]})).is_ok());
    }

    #[test]
    fn test_uncompilable_schema_is_not_enforced() {
        let schema = tool(json!({"type": "no-such-type"}));
        assert!(validate_arguments(&schema, &json!({"a": 1})).is_ok());

        let schemas = ToolSchemas::compile(std::slice::from_ref(&schema));
        assert_eq!(schemas.len(), 1);
        assert!(schemas.validate(&schema, &json!({"a": 1})).is_ok());
    }

    #[test]
    fn test_cached_schemas_validate_and_fall_back() {
        let add = add_tool();
        let schemas = ToolSchemas::compile(std::slice::from_ref(&add));

        assert!(schemas.validate(&add, &json!({"a": 1, "b": 2})).is_ok());
        assert!(schemas.validate(&add, &json!({"a": 1})).is_err());

        let other = ToolInfo {
            name: "echo".to_string(),
            ..tool(json!({"type": "object", "required": ["text"]}))
        };
        assert!(schemas.validate(&other, &json!({})).is_err());
    }
}
