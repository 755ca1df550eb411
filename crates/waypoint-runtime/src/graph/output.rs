use std::collections::HashMap;

use serde_json::Value;

/// Checks node output against a node's `output_schema`.
///
/// Understands the `required` array and per-property `type` names of a JSON
/// Schema object; everything else in the schema is ignored.
#[derive(Debug, Clone, Default)]
pub struct OutputValidator {
    pub required_keys: Vec<String>,
    pub property_types: HashMap<String, String>,
}

impl OutputValidator {
    pub fn from_schema(schema: &Value) -> Self {
        let required_keys = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let property_types = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(name, spec)| {
                        spec.get("type")
                            .and_then(|t| t.as_str())
                            .map(|t| (name.clone(), t.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            required_keys,
            property_types,
        }
    }

    /// Every issue found; empty means valid.
    pub fn validate(&self, output: &HashMap<String, Value>) -> Vec<String> {
        let mut issues = Vec::new();

        for key in &self.required_keys {
            if !output.contains_key(key) {
                issues.push(format!("Missing required key: '{}'", key));
            }
        }

        let mut typed: Vec<_> = self.property_types.iter().collect();
        typed.sort();
        for (key, expected) in typed {
            if let Some(value) = output.get(key) {
                if !type_matches(expected, value) {
                    issues.push(format!(
                        "Key '{}' should be {} but is {}",
                        key,
                        expected,
                        json_type(value)
                    ));
                }
            }
        }

        issues
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
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

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
