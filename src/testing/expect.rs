//! Expectation evaluation
//!
//! A step's outcome is judged against its expectation in a fixed order:
//! polarity, expected-error text, response substrings, then JSON-path
//! equality against a JSON object recovered from the typed response.

use serde_json::Value;

use super::config::TestExpectation;
use super::protocol::CallToolResult;

/// Check `expected` against one call outcome
///
/// `response` is the envelope when the call completed (tool-level errors
/// included); `transport_error` is set when the call itself failed.
/// Returns the reason the expectation is unmet.
pub fn check_expectation(
    expected: &TestExpectation,
    response: Option<&CallToolResult>,
    transport_error: Option<&str>,
) -> Result<(), String> {
    let tool_error = response.map(|r| r.is_error).unwrap_or(false);
    let failed = transport_error.is_some() || tool_error;

    if expected.success && failed {
        let detail = transport_error
            .map(str::to_string)
            .or_else(|| response.map(CallToolResult::joined_text))
            .unwrap_or_default();
        return Err(format!("expected success but the call failed: {}", detail));
    }
    if !expected.success && !failed {
        return Err("expected failure but the call succeeded".to_string());
    }

    if !expected.success {
        let error_text = match transport_error {
            Some(text) => text.to_string(),
            None => response.map(CallToolResult::joined_text).unwrap_or_default(),
        };
        let haystack = error_text.to_lowercase();
        for needle in &expected.error_contains {
            if !haystack.contains(&needle.to_lowercase()) {
                return Err(format!(
                    "error text does not contain '{}'. Got: '{}'",
                    needle,
                    crate::common::truncate(&error_text, 200)
                ));
            }
        }
    }

    let rendered = response.map(CallToolResult::rendered).unwrap_or_default();
    for needle in &expected.contains {
        if !rendered.contains(needle.as_str()) {
            return Err(format!(
                "response does not contain '{}'. Got: '{}'",
                needle,
                crate::common::truncate(&rendered, 200)
            ));
        }
    }
    for needle in &expected.not_contains {
        if rendered.contains(needle.as_str()) {
            return Err(format!("response unexpectedly contains '{}'", needle));
        }
    }

    if !expected.json_path.is_empty() {
        let document = response
            .and_then(recover_json)
            .ok_or_else(|| "json_path checks need a JSON response, none found".to_string())?;
        for (path, want) in &expected.json_path {
            match lookup_path(&document, path) {
                Some(actual) if loosely_equal(actual, want) => {}
                Some(actual) => {
                    return Err(format!(
                        "json_path '{}': expected {}, got {}",
                        path, want, actual
                    ))
                }
                None => return Err(format!("json_path '{}' not found in response", path)),
            }
        }
    }

    Ok(())
}

/// Recover a JSON document from a typed tool result
///
/// Structured content wins; otherwise each text item is decoded in turn and
/// the first object or array is used.
pub fn recover_json(result: &CallToolResult) -> Option<Value> {
    if let Some(structured) = &result.structured_content {
        if structured.is_object() || structured.is_array() {
            return Some(structured.clone());
        }
    }

    result.texts().find_map(|text| {
        let decoded: Value = serde_json::from_str(text.trim()).ok()?;
        match decoded {
            Value::Object(_) | Value::Array(_) => Some(decoded),
            // A JSON-encoded string holding JSON
            Value::String(inner) => serde_json::from_str::<Value>(&inner)
                .ok()
                .filter(|v| v.is_object() || v.is_array()),
            _ => None,
        }
    })
}

/// Look up a dot path like `items.0.name`, `items[0].name` or `$.status`
pub fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let mut current = document;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = split_indexes(segment)?;
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for index in indexes {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// `name[1][2]` -> ("name", [1, 2])
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..open];
    let mut indexes = Vec::new();
    for part in segment[open..].split('[').filter(|p| !p.is_empty()) {
        indexes.push(part.strip_suffix(']')?.parse().ok()?);
    }
    Some((key, indexes))
}

/// Compare with coercion between booleans, strings and numbers
pub fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .zip(n.as_f64())
            .map(|(a, b)| a == b)
            .unwrap_or(false),
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s == "null",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expectation(yaml: &str) -> TestExpectation {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_success_polarity() {
        let ok = CallToolResult::text("done");
        let tool_err = CallToolResult::error("bad input");

        let want_success = TestExpectation::default();
        assert!(check_expectation(&want_success, Some(&ok), None).is_ok());
        assert!(check_expectation(&want_success, Some(&tool_err), None).is_err());
        assert!(check_expectation(&want_success, None, Some("connection reset")).is_err());

        let want_failure = expectation("success: false");
        assert!(check_expectation(&want_failure, Some(&ok), None).is_err());
        assert!(check_expectation(&want_failure, Some(&tool_err), None).is_ok());
        assert!(check_expectation(&want_failure, None, Some("boom")).is_ok());
    }

    #[test]
    fn test_error_contains_uses_transport_then_envelope_text() {
        let want = expectation("success: false\nerror_contains: [\"Not Found\"]");
        assert!(check_expectation(&want, None, Some("tool 'x' not found")).is_ok());
        assert!(check_expectation(&want, Some(&CallToolResult::error("resource not found")), None).is_ok());

        let err = check_expectation(&want, Some(&CallToolResult::error("denied")), None).unwrap_err();
        assert!(err.contains("Not Found"));
    }

    #[test]
    fn test_contains_and_not_contains() {
        let want = expectation("contains: [created]\nnot_contains: [error]");
        assert!(check_expectation(&want, Some(&CallToolResult::text("resource created")), None).is_ok());
        assert!(check_expectation(&want, Some(&CallToolResult::text("resource updated")), None).is_err());
        assert!(check_expectation(&want, Some(&CallToolResult::text("created with error")), None).is_err());
    }

    #[test]
    fn test_json_path_same_for_object_and_text_wrapped() {
        let want = expectation("json_path:\n  status: created");

        let object = CallToolResult {
            content: Vec::new(),
            is_error: false,
            structured_content: Some(json!({"status": "created"})),
        };
        let wrapped = CallToolResult::text(r#"{"status": "created"}"#);
        let double_wrapped = CallToolResult::text(json!(r#"{"status":"created"}"#).to_string());

        assert!(check_expectation(&want, Some(&object), None).is_ok());
        assert!(check_expectation(&want, Some(&wrapped), None).is_ok());
        assert!(check_expectation(&want, Some(&double_wrapped), None).is_ok());
    }

    #[test]
    fn test_json_recovery_tolerates_braces_in_strings() {
        let result = CallToolResult {
            content: vec![
                super::super::protocol::Content::Text {
                    text: "Result follows {not json}".to_string(),
                },
                super::super::protocol::Content::Text {
                    text: r#"{"message": "use {name} } here", "count": 2}"#.to_string(),
                },
            ],
            is_error: false,
            structured_content: None,
        };
        let doc = recover_json(&result).unwrap();
        assert_eq!(doc["message"], "use {name} } here");
        assert_eq!(doc["count"], 2);
    }

    #[test]
    fn test_json_path_missing_document_or_path() {
        let want = expectation("json_path:\n  status: created");
        let err = check_expectation(&want, Some(&CallToolResult::text("plain")), None).unwrap_err();
        assert!(err.contains("none found"));

        let err = check_expectation(&want, Some(&CallToolResult::text("{\"other\": 1}")), None)
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"items": [{"name": "a"}, {"name": "b", "tags": ["x", "y"]}], "meta": {"ok": true}});
        assert_eq!(lookup_path(&doc, "items.1.name"), Some(&json!("b")));
        assert_eq!(lookup_path(&doc, "items[1].tags[0]"), Some(&json!("x")));
        assert_eq!(lookup_path(&doc, "$.meta.ok"), Some(&json!(true)));
        assert_eq!(lookup_path(&doc, "items.5"), None);
        assert_eq!(lookup_path(&doc, "meta.ok.deeper"), None);
        assert_eq!(lookup_path(&doc, "items[x]"), None);
    }

    #[test]
    fn test_loose_equality() {
        assert!(loosely_equal(&json!(true), &json!("true")));
        assert!(loosely_equal(&json!("FALSE"), &json!(false)));
        assert!(loosely_equal(&json!(3), &json!("3")));
        assert!(loosely_equal(&json!("2.5"), &json!(2.5)));
        assert!(loosely_equal(&json!(1), &json!(1.0)));
        assert!(loosely_equal(&json!(null), &json!("null")));
        assert!(!loosely_equal(&json!(1), &json!(true)));
        assert!(!loosely_equal(&json!("yes"), &json!(true)));
        assert!(!loosely_equal(&json!({"a": 1}), &json!("{\"a\":1}")));
    }
}
