//! Minimal JSON Schema validation.
//!
//! Covers the subset tool contracts use: `type` (single or list), `properties`,
//! `required`, `enum`, `items` and `additionalProperties: false`. Unknown keywords
//! are ignored, so an empty schema accepts any value.

use serde_json::Value;

/// Validate `value` against `schema`. The error names the offending path.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    check(schema, value, "$")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(|t| t.as_str()).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            return Err(format!(
                "{}: expected {}, got {}",
                path,
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(format!("{}: {} is not one of the allowed values", path, value));
        }
    }

    if let Value::Object(map) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !map.contains_key(key) {
                    return Err(format!("{}: missing required property '{}'", path, key));
                }
            }
        }

        let properties = schema.get("properties").and_then(|p| p.as_object());
        if let Some(properties) = properties {
            for (key, sub) in properties {
                if let Some(v) = map.get(key) {
                    check(sub, v, &format!("{}.{}", path, key))?;
                }
            }
        }

        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for key in map.keys() {
                if !properties.is_some_and(|p| p.contains_key(key)) {
                    return Err(format!("{}: unexpected property '{}'", path, key));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{}[{}]", path, i))?;
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "patient_id": { "type": "string" },
                "severity": { "type": "string", "enum": ["low", "high"] },
                "scores": { "type": "array", "items": { "type": "integer" } }
            },
            "required": ["patient_id"],
            "additionalProperties": false
        })
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate(&json!({}), &json!([1, "two", null])).is_ok());
    }

    #[test]
    fn accepts_valid_object() {
        let value = json!({"patient_id": "p1", "severity": "high", "scores": [1, 2]});
        assert!(validate(&patient_schema(), &value).is_ok());
    }

    #[test]
    fn reports_missing_required() {
        let err = validate(&patient_schema(), &json!({"severity": "low"})).unwrap_err();
        assert!(err.contains("patient_id"), "{}", err);
    }

    #[test]
    fn reports_enum_and_type_mismatch() {
        let err = validate(&patient_schema(), &json!({"patient_id": "p", "severity": "mid"}))
            .unwrap_err();
        assert!(err.starts_with("$.severity"), "{}", err);

        let err = validate(&patient_schema(), &json!({"patient_id": 7})).unwrap_err();
        assert!(err.contains("expected string"), "{}", err);
    }

    #[test]
    fn checks_array_items_and_extra_properties() {
        let err = validate(&patient_schema(), &json!({"patient_id": "p", "scores": [1, 1.5]}))
            .unwrap_err();
        assert!(err.starts_with("$.scores[1]"), "{}", err);

        let err = validate(&patient_schema(), &json!({"patient_id": "p", "extra": 1}))
            .unwrap_err();
        assert!(err.contains("unexpected property 'extra'"), "{}", err);
    }

    #[test]
    fn type_lists() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(&schema, &json!(null)).is_ok());
        assert!(validate(&schema, &json!("x")).is_ok());
        assert!(validate(&schema, &json!(1)).is_err());
    }
}
