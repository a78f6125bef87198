use serde_json::Value;
use std::collections::HashMap;

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let sanitized = match key.to_lowercase().as_str() {
                    "authorization" | "x-hub-signature-256" | "x-hub-signature" | "cookie" => {
                        REDACTED.to_string()
                    }
                    _ => value.clone(),
                };
                (key.clone(), sanitized)
            })
            .collect()
    }

    /// Replace token-like fields anywhere in a JSON document.
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, val)| {
                        let sanitized = match key.as_str() {
                            "token" | "private_key" | "secret" | "password" => {
                                Value::String(REDACTED.to_string())
                            }
                            _ => Self::sanitize_json(val),
                        };
                        (key.clone(), sanitized)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }
}
