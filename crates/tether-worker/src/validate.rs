//! Payload validation against the worker's JSON schemas.

use serde_json::Value;

/// Checks a payload against a schema.
pub trait SchemaValidator: Send + Sync {
    /// `Err` carries one message per violation.
    fn validate(&self, payload: &Value, schema: &Value) -> Result<(), Vec<String>>;
}

/// Structural validator for the common JSON Schema keywords:
/// `type`, `required`, `properties`, `additionalProperties: false`,
/// `items` and `enum`. Unknown keywords are ignored and an empty schema
/// accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

impl SchemaValidator for BasicValidator {
    fn validate(&self, payload: &Value, schema: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        check(payload, schema, "$", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check(value: &Value, schema: &Value, at: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(name) => vec![name.as_str()],
            Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|name| has_type(value, name)) {
            errors.push(format!("{at}: expected {}, got {}", allowed.join(" or "), type_name(value)));
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            errors.push(format!("{at}: value is not one of the allowed values"));
        }
    }

    if let Value::Object(object) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    errors.push(format!("{at}: missing required property `{name}`"));
                }
            }
        }
        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, sub_schema) in properties {
                if let Some(sub_value) = object.get(name) {
                    check(sub_value, sub_schema, &format!("{at}.{name}"), errors);
                }
            }
        }
        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in object.keys() {
                if !properties.is_some_and(|p| p.contains_key(name)) {
                    errors.push(format!("{at}: unexpected property `{name}`"));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{at}[{i}]"), errors);
        }
    }
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
