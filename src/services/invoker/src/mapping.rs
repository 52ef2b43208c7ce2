//! Response field extraction
//!
//! Endpoint configurations carry `response_mappings`, a table of output key
//! to JSONPath expression. The mapper evaluates each path against the parsed
//! response and builds the caller-facing output object. Extraction never
//! fails an invocation: a path that matches nothing, or does not parse,
//! yields `null` for that key.

use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Extracts configured fields from parsed endpoint responses
#[derive(Debug, Clone, Default)]
pub struct ResponseMapper;

impl ResponseMapper {
    pub fn new() -> Self {
        Self
    }

    /// Apply a mapping table to a parsed response
    ///
    /// Returns one entry per mapping key, in the order serde_json preserves
    /// them. Paths may be written with or without the `$.` root prefix.
    pub fn apply(
        &self,
        mappings: &HashMap<String, String>,
        response: &Value,
    ) -> Map<String, Value> {
        let mut output = Map::with_capacity(mappings.len());
        for (key, path) in mappings {
            output.insert(key.clone(), self.extract(path, response));
        }
        output
    }

    /// Extract the first value matching a JSONPath expression
    pub fn extract(&self, path: &str, response: &Value) -> Value {
        let normalized = normalize_path(path);
        match jsonpath_lib::select(response, &normalized) {
            Ok(selected) => match selected.first() {
                Some(value) => (*value).clone(),
                None => Value::Null,
            },
            Err(e) => {
                debug!(path = %normalized, error = %e, "JSONPath selection failed");
                Value::Null
            }
        }
    }
}

/// Prefix bare paths with the JSONPath root selector
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('$') {
        trimmed.to_string()
    } else {
        format!("$.{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mappings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extracts_nested_fields() {
        let mapper = ResponseMapper::new();
        let response = json!({
            "choices": [{"message": {"content": "hi there"}}],
            "usage": {"total_tokens": 12}
        });

        let output = mapper.apply(
            &mappings(&[
                ("output", "$.choices[0].message.content"),
                ("tokens", "usage.total_tokens"),
            ]),
            &response,
        );

        assert_eq!(output.get("output"), Some(&json!("hi there")));
        assert_eq!(output.get("tokens"), Some(&json!(12)));
    }

    #[test]
    fn test_missing_path_yields_null() {
        let mapper = ResponseMapper::new();
        let response = json!({"data": {}});

        let output = mapper.apply(&mappings(&[("answer", "$.data.answer")]), &response);
        assert_eq!(output.get("answer"), Some(&Value::Null));
    }

    #[test]
    fn test_invalid_path_yields_null() {
        let mapper = ResponseMapper::new();
        let response = json!({"data": 1});

        let output = mapper.apply(&mappings(&[("broken", "$..[")]), &response);
        assert_eq!(output.get("broken"), Some(&Value::Null));
    }

    #[test]
    fn test_bare_path_gets_root_prefix() {
        assert_eq!(normalize_path("data.value"), "$.data.value");
        assert_eq!(normalize_path("$.data.value"), "$.data.value");
        assert_eq!(normalize_path("  spaced.path  "), "$.spaced.path");
    }

    #[test]
    fn test_extracts_structured_values() {
        let mapper = ResponseMapper::new();
        let response = json!({"result": {"items": [1, 2, 3]}});

        let output = mapper.apply(&mappings(&[("items", "$.result.items")]), &response);
        assert_eq!(output.get("items"), Some(&json!([1, 2, 3])));
    }
}
