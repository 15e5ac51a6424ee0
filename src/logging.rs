//! Logging setup and structured-payload redaction.
//!
//! Logs go to stderr because stdout carries the MCP protocol in stdio mode.
//! Payloads logged for diagnostics pass through [`redact_json`] first so that
//! secret-bearing fields never reach the log sink.

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogLevel;

/// Field-name fragments that mark a value as sensitive.
const SENSITIVE_MARKERS: &[&str] = &["key", "token", "secret", "password", "credential"];

const REDACTED: &str = "[REDACTED]";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(level: LogLevel) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("gemini_mcp={}", level.as_str()))),
        )
        .init();
}

fn is_sensitive(field: &str) -> bool {
    let field = field.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| field.contains(marker))
}

/// Recursively mask values stored under secret-like field names.
pub fn redact_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (field, entry) in map.iter_mut() {
                if is_sensitive(field) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_json(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_json(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_key_like_fields() {
        let mut value = json!({
            "apiKey": "abc",
            "auth_token": "def",
            "clientSecret": "ghi",
            "password": "jkl",
            "prompt": "hello"
        });
        redact_json(&mut value);
        assert_eq!(value["apiKey"], "[REDACTED]");
        assert_eq!(value["auth_token"], "[REDACTED]");
        assert_eq!(value["clientSecret"], "[REDACTED]");
        assert_eq!(value["password"], "[REDACTED]");
        assert_eq!(value["prompt"], "hello");
    }

    #[test]
    fn recurses_into_nested_structures() {
        let mut value = json!({
            "params": {
                "arguments": [{"access_token": "abc", "model": "gemini"}]
            }
        });
        redact_json(&mut value);
        assert_eq!(value["params"]["arguments"][0]["access_token"], "[REDACTED]");
        assert_eq!(value["params"]["arguments"][0]["model"], "gemini");
    }

    #[test]
    fn leaves_scalars_untouched() {
        let mut value = json!("just a string");
        redact_json(&mut value);
        assert_eq!(value, "just a string");
    }
}
