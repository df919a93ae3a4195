//! Schema pipeline: converts internal parameter descriptors into
//! MCP-compliant JSON Schema, sanitizes outgoing schemas, and validates
//! inbound tool arguments (`spec.md` §4.3).

use std::collections::BTreeMap;

use jsonschema::{Draft, JSONSchema};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// A single named parameter a tool or prompt accepts.
///
/// This is the "rich descriptor" the spec's distillation refers to: named
/// fields with a primitive/enum/array/nested-object type, a required flag,
/// a description and an optional default.
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    /// Parameter name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// The parameter's type.
    pub kind: ParamKind,
    /// Whether the caller must supply this parameter.
    pub required: bool,
    /// Default value applied when the caller omits the parameter.
    pub default: Option<Value>,
}

/// The type of a tool/prompt parameter.
#[derive(Debug, Clone)]
pub enum ParamKind {
    /// A string, optionally constrained to an enum of allowed values.
    String { enum_values: Option<Vec<String>> },
    /// A number, optionally bounded.
    Number {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    /// A boolean.
    Boolean,
    /// An array of items all sharing one item schema.
    Array { items: Box<ParamKind> },
    /// A nested object with its own named fields.
    Object { fields: Vec<ParamDescriptor> },
}

/// Build a draft-07, MCP-compliant JSON Schema object from a flat list of
/// top-level parameters. This is the pre-sanitization schema used to
/// validate inbound arguments (it retains `$schema`/defaults); call
/// [`sanitize`] on the result before exposing it via `tools/list`.
pub fn build_schema(params: &[ParamDescriptor]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for p in params {
        properties.insert(p.name.clone(), param_schema(p));
        if p.required {
            required.push(Value::String(p.name.clone()));
        }
    }

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
        "additionalProperties": false,
    })
}

fn param_schema(p: &ParamDescriptor) -> Value {
    let mut schema = kind_schema(&p.kind);
    if let Value::Object(map) = &mut schema {
        map.insert("description".into(), Value::String(p.description.clone()));
        if let Some(default) = &p.default {
            map.insert("default".into(), default.clone());
        }
    }
    schema
}

fn kind_schema(kind: &ParamKind) -> Value {
    match kind {
        ParamKind::String { enum_values } => {
            let mut obj = json!({ "type": "string" });
            if let Some(values) = enum_values {
                obj["enum"] = Value::Array(values.iter().cloned().map(Value::String).collect());
            }
            obj
        }
        ParamKind::Number { minimum, maximum } => {
            let mut obj = json!({ "type": "number" });
            if let Some(min) = minimum {
                obj["minimum"] = json!(min);
            }
            if let Some(max) = maximum {
                obj["maximum"] = json!(max);
            }
            obj
        }
        ParamKind::Boolean => json!({ "type": "boolean" }),
        ParamKind::Array { items } => json!({ "type": "array", "items": kind_schema(items) }),
        ParamKind::Object { fields } => build_schema(fields),
    }
}

/// Strip implementation-specific meta properties and enforce the MCP
/// outbound invariants (`spec.md` §4.3, testable property 2):
/// `type: "object"`, `properties` present, `additionalProperties: false`.
/// `enum`, numeric bounds, `required` and array item schemas are preserved.
pub fn sanitize(schema: &Value) -> Value {
    let mut out = match schema.as_object() {
        Some(map) => map.clone(),
        None => Map::new(),
    };

    out.remove("$schema");
    out.remove("$defs");
    out.remove("definitions");

    out.insert("type".into(), Value::String("object".into()));
    out.entry("properties").or_insert_with(|| Value::Object(Map::new()));
    out.insert("additionalProperties".into(), Value::Bool(false));

    Value::Object(out)
}

/// Errors raised while validating inbound tool/prompt arguments.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The schema itself failed to compile (a registration-time bug).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    /// The arguments did not satisfy the schema.
    #[error("{field}: {message}")]
    Invalid {
        /// Offending field path, e.g. `"/host"`.
        field: String,
        /// Human-readable explanation.
        message: String,
    },
}

/// Validate `args` against the *pre-sanitization* schema, applying defaults
/// for any field the caller omitted. Unknown keys are rejected because the
/// schema always carries `additionalProperties: false`.
pub fn validate_and_apply_defaults(
    schema: &Value,
    params: &[ParamDescriptor],
    mut args: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ValidationError> {
    for p in params {
        if !args.contains_key(&p.name) {
            if let Some(default) = &p.default {
                args.insert(p.name.clone(), default.clone());
            }
        }
    }

    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;

    let value = Value::Object(args.clone().into_iter().collect());
    if let Err(mut errors) = compiled.validate(&value) {
        let first = errors.next().expect("validate() Err implies at least one error");
        return Err(ValidationError::Invalid {
            field: first.instance_path.to_string(),
            message: first.to_string(),
        });
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_params() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor {
                name: "host".into(),
                description: "target host".into(),
                kind: ParamKind::String { enum_values: None },
                required: true,
                default: None,
            },
            ParamDescriptor {
                name: "count".into(),
                description: "packet count".into(),
                kind: ParamKind::Number {
                    minimum: Some(1.0),
                    maximum: Some(10.0),
                },
                required: false,
                default: Some(json!(4)),
            },
        ]
    }

    #[test]
    fn sanitize_strips_meta_and_forces_object() {
        let schema = build_schema(&host_params());
        let sanitized = sanitize(&schema);
        assert_eq!(sanitized["type"], "object");
        assert_eq!(sanitized["additionalProperties"], false);
        assert!(sanitized.get("$schema").is_none());
        assert_eq!(sanitized["properties"]["count"]["minimum"], 1.0);
        assert_eq!(sanitized["properties"]["count"]["maximum"], 10.0);
    }

    #[test]
    fn validate_applies_defaults() {
        let schema = build_schema(&host_params());
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        let filled = validate_and_apply_defaults(&schema, &host_params(), args).unwrap();
        assert_eq!(filled["count"], 4);
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = build_schema(&host_params());
        let args = BTreeMap::new();
        let err = validate_and_apply_defaults(&schema, &host_params(), args).unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { .. }));
    }

    #[test]
    fn validate_rejects_unknown_keys() {
        let schema = build_schema(&host_params());
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        args.insert("evil".to_string(), json!("x"));
        let err = validate_and_apply_defaults(&schema, &host_params(), args).unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_number() {
        let schema = build_schema(&host_params());
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        args.insert("count".to_string(), json!(99));
        let err = validate_and_apply_defaults(&schema, &host_params(), args).unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { .. }));
    }
}
