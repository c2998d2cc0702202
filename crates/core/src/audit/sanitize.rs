use serde_json::{Map, Value};

pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Key fragments that mark a parameter as sensitive. Matching is a
/// case-insensitive substring test against the parameter name.
pub const SENSITIVE_KEY_PATTERNS: [&str; 9] = [
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "auth",
    "private_key",
    "access_key",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
}

/// Returns a copy of `parameters` with sensitive values replaced by
/// [`REDACTION_MARKER`], plus whether anything was redacted. Nested objects,
/// including objects inside arrays, are inspected at every depth.
pub fn sanitize_parameters(parameters: &Map<String, Value>) -> (Map<String, Value>, bool) {
    let mut sanitized = false;
    let copy = redact_object(parameters, &mut sanitized);
    (copy, sanitized)
}

fn redact_object(object: &Map<String, Value>, sanitized: &mut bool) -> Map<String, Value> {
    object
        .iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                *sanitized = true;
                (key.clone(), Value::String(REDACTION_MARKER.to_string()))
            } else {
                (key.clone(), redact_value(value, sanitized))
            }
        })
        .collect()
}

fn redact_value(value: &Value, sanitized: &mut bool) -> Value {
    match value {
        Value::Object(object) => Value::Object(redact_object(object, sanitized)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| redact_value(item, sanitized)).collect())
        }
        other => other.clone(),
    }
}
