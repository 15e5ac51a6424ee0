//! Outbound Google Gemini client.
//!
//! One [`GeminiClient`] is constructed at startup, after configuration has
//! been validated, and shared by every server instance. Failures never
//! propagate as panics or protocol errors; they surface as [`GeminiError`]
//! values that the tool boundary renders into error results.

pub mod types;

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::server::GenerationParams;
use types::{
    GenerateContentRequest, GenerateContentResponse, GeminiContent, GeminiTool,
    GenerationConfig, GoogleSearch,
};

/// Models this server has been exercised against. Advisory only: unknown
/// names are forwarded so that newly released models work without a redeploy.
pub const KNOWN_MODELS: &[&str] = &[
    "gemini-1.5-flash-latest",
    "gemini-1.5-flash",
    "gemini-1.5-pro-latest",
    "gemini-1.5-pro",
    "gemini-1.0-pro",
    "gemini-2.0-flash",
];

/// Outbound API failures. Carries the HTTP status where one exists.
#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("API request failed (status 408): Request timed out after {0}ms")]
    Timeout(u64),

    #[error("API request failed (status {status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("API request failed: No candidates returned in response")]
    NoCandidates,

    #[error("API request failed: Prompt was blocked by the API ({0})")]
    PromptBlocked(String),

    #[error("API request failed: Malformed response from the API: {0}")]
    MalformedResponse(String),

    #[error("API request failed: {0}")]
    Request(String),
}

impl GeminiError {
    /// HTTP status associated with this failure, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            GeminiError::Timeout(_) => Some(408),
            GeminiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw detail string, when one was captured.
    pub fn detail(&self) -> Option<&str> {
        match self {
            GeminiError::Api { detail, .. } => Some(detail),
            GeminiError::PromptBlocked(detail)
            | GeminiError::MalformedResponse(detail)
            | GeminiError::Request(detail) => Some(detail),
            _ => None,
        }
    }
}

/// HTTP client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    timeout_ms: u64,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Result<Self, GeminiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GeminiError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            timeout_ms: config.request_timeout.as_millis() as u64,
        })
    }

    /// Run one generation request and return the candidate text.
    pub async fn generate(&self, params: &GenerationParams) -> Result<String, GeminiError> {
        let request = GenerateContentRequest {
            contents: vec![GeminiContent::user_text(&params.prompt)],
            generation_config: Some(GenerationConfig {
                temperature: Some(params.temperature),
                top_p: params.top_p,
                top_k: params.top_k,
                max_output_tokens: Some(params.max_output_tokens),
            }),
            tools: if params.grounding {
                vec![GeminiTool {
                    google_search: GoogleSearch::default(),
                }]
            } else {
                Vec::new()
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, params.model, self.api_key
        );

        debug!(
            model = %params.model,
            grounding = params.grounding,
            "Sending generateContent request"
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeminiError::Api {
                status: status.as_u16(),
                detail: summarize_error_body(&body),
            });
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GeminiError::MalformedResponse(self.scrub(e.to_string())))?;

        if let Some(reason) = body
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
        {
            return Err(GeminiError::PromptBlocked(reason.to_string()));
        }

        let candidate = body
            .candidates
            .into_iter()
            .next()
            .ok_or(GeminiError::NoCandidates)?;

        let text = candidate
            .content
            .map(|content| content.text())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(GeminiError::MalformedResponse(
                "candidate contained no text parts".to_string(),
            ));
        }

        Ok(text)
    }

    fn map_send_error(&self, error: reqwest::Error) -> GeminiError {
        if error.is_timeout() {
            GeminiError::Timeout(self.timeout_ms)
        } else {
            GeminiError::Request(self.scrub(error.to_string()))
        }
    }

    /// reqwest error messages can embed the request URL, which carries the
    /// key as a query parameter.
    fn scrub(&self, message: String) -> String {
        message.replace(&self.api_key, "[REDACTED]")
    }
}

/// Reduce an error response body to its message. Gemini errors arrive as
/// `{"error": {"code": .., "message": .., "status": ..}}`.
fn summarize_error_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error detail".to_string()
    } else if trimmed.len() > 200 {
        format!("{}...", &trimmed[..200])
    } else {
        trimmed.to_string()
    }
}
