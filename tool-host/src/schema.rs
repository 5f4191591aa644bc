//! Validation of invocation params against the JSON-schema subset tool
//! adapters advertise: `type`, `required`, `enum` and nested `properties`.

use common::error::RagError;
use serde_json::Value;

pub fn validate(params: &Value, schema: &Value) -> Result<(), RagError> {
    let mut errors = Vec::new();
    validate_at("$", params, schema, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RagError::SchemaInvalid(errors.join("; ")))
    }
}

fn validate_at(path: &str, value: &Value, schema: &Value, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            errors.push(format!("{path}: expected {expected}"));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    errors.push(format!("{path}.{field}: missing required field"));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, child_schema) in properties {
                if let Some(child) = object.get(name) {
                    validate_at(&format!("{path}.{name}"), child, child_schema, errors);
                }
            }
        }
    }
}
