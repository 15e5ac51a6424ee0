//! Environment-based server configuration.
//!
//! All configuration is read from the process environment once at startup and
//! validated before anything is constructed from it. A bad value is a
//! [`ConfigError`] and the process exits with status 1 without serving a
//! single request.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default outbound request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Upper bound for the outbound request timeout.
pub const MAX_TIMEOUT_MS: u64 = 60_000;
/// Default Gemini API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Placeholder value shipped in setup docs; treated the same as an unset key.
pub const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost,http://127.0.0.1";

/// Startup configuration failures. All of these are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    #[error("GEMINI_API_KEY is set to the placeholder value; supply a real key")]
    PlaceholderApiKey,

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Log verbosity, ordered from least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!(
                "unknown log level {other:?} (expected error, warn, info, or debug)"
            )),
        }
    }
}

/// Validated server configuration.
#[derive(Clone)]
pub struct Config {
    /// Gemini API key. Never logged; see the manual `Debug` impl.
    pub api_key: String,
    /// HTTP listen port (`MCP_PORT`).
    pub port: u16,
    /// Outbound Gemini request timeout (`GEMINI_TIMEOUT_MS`).
    pub request_timeout: Duration,
    /// Log verbosity (`LOG_LEVEL`).
    pub log_level: LogLevel,
    /// Gemini API endpoint (`GEMINI_BASE_URL`).
    pub base_url: String,
    /// Origin values accepted on the HTTP surface (`MCP_ALLOWED_ORIGINS`).
    pub allowed_origins: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"[REDACTED]")
            .field("port", &self.port)
            .field("request_timeout", &self.request_timeout)
            .field("log_level", &self.log_level)
            .field("base_url", &self.base_url)
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = match lookup("GEMINI_API_KEY") {
            None => return Err(ConfigError::MissingApiKey),
            Some(key) if key.trim().is_empty() => return Err(ConfigError::MissingApiKey),
            Some(key) if key == API_KEY_PLACEHOLDER => {
                return Err(ConfigError::PlaceholderApiKey)
            }
            Some(key) => key,
        };

        let port = match lookup("MCP_PORT") {
            None => DEFAULT_PORT,
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port >= 1 => port,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "MCP_PORT",
                        reason: format!("expected a port in 1-65535, got {raw:?}"),
                    })
                }
            },
        };

        let timeout_ms = match lookup("GEMINI_TIMEOUT_MS") {
            None => DEFAULT_TIMEOUT_MS,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if (1..=MAX_TIMEOUT_MS).contains(&ms) => ms,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "GEMINI_TIMEOUT_MS",
                        reason: format!(
                            "expected milliseconds in 1-{MAX_TIMEOUT_MS}, got {raw:?}"
                        ),
                    })
                }
            },
        };

        let log_level = match lookup("LOG_LEVEL") {
            None => LogLevel::Info,
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "LOG_LEVEL",
                reason,
            })?,
        };

        let base_url = lookup("GEMINI_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let allowed_origins = lookup("MCP_ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            api_key,
            port,
            request_timeout: Duration::from_millis(timeout_ms),
            log_level,
            base_url,
            allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_with_only_api_key() {
        let config = Config::from_lookup(lookup_from(&[("GEMINI_API_KEY", "abc123")]))
            .expect("should succeed");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.allowed_origins.len(), 2);
    }

    #[test]
    fn missing_api_key_fails() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey));
    }

    #[test]
    fn placeholder_api_key_fails() {
        let err = Config::from_lookup(lookup_from(&[("GEMINI_API_KEY", API_KEY_PLACEHOLDER)]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::PlaceholderApiKey));
    }

    #[test]
    fn port_out_of_range_fails() {
        let err = Config::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "abc123"),
            ("MCP_PORT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MCP_PORT", .. }));

        let err = Config::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "abc123"),
            ("MCP_PORT", "70000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MCP_PORT", .. }));
    }

    #[test]
    fn timeout_above_cap_fails() {
        let err = Config::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "abc123"),
            ("GEMINI_TIMEOUT_MS", "60001"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "GEMINI_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn log_level_parses_and_orders() {
        let config = Config::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "abc123"),
            ("LOG_LEVEL", "DEBUG"),
        ]))
        .expect("should succeed");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
    }

    #[test]
    fn debug_output_never_contains_key() {
        let config = Config::from_lookup(lookup_from(&[(
            "GEMINI_API_KEY",
            "super-secret-value",
        )]))
        .expect("should succeed");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
