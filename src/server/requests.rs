//! MCP tool request types.
//!
//! These structs define the parameters for each MCP tool exposed by the server.

use rmcp::schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use crate::error::ToolError;
use crate::gemini::KNOWN_MODELS;

/// Model used when the caller does not name one.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";
/// Sampling temperature used when the caller does not supply one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Output token cap used when the caller does not supply one.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;
/// Hard upper bound on requested output tokens.
pub const MAX_OUTPUT_TOKENS_LIMIT: u32 = 8192;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GenerateTextRequest {
    #[schemars(description = "Gemini model name (default: gemini-1.5-flash-latest)")]
    pub model: Option<String>,
    #[schemars(description = "Prompt text to send to the model")]
    pub prompt: String,
    #[schemars(description = "Sampling temperature, 0.0-1.0 (default: 0.7)")]
    pub temperature: Option<f64>,
    #[schemars(description = "Maximum tokens to generate, 1-8192 (default: 2048)")]
    #[serde(alias = "maxOutputTokens")]
    pub max_output_tokens: Option<u32>,
    #[schemars(description = "Top-k sampling cutoff, positive (optional)")]
    #[serde(alias = "topK")]
    pub top_k: Option<u32>,
    #[schemars(description = "Nucleus sampling probability mass, 0.0-1.0 (optional)")]
    #[serde(alias = "topP")]
    pub top_p: Option<f64>,
    #[schemars(
        description = "Augment the request with live web-search grounding \
        (default: on for stdio servers, off for HTTP)"
    )]
    #[serde(alias = "enableGrounding")]
    pub enable_grounding: Option<bool>,
}

/// Fully validated parameter set handed to the Gemini client. Scoped to one
/// request/response exchange; never stored.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub top_k: Option<u32>,
    pub top_p: Option<f64>,
    pub grounding: bool,
}

impl GenerateTextRequest {
    /// Apply defaults and domain constraints. The model list is advisory:
    /// unknown names are forwarded with a warning so new releases work
    /// without a redeploy.
    pub fn validate(self, grounding_default: bool) -> Result<GenerationParams, ToolError> {
        let model = match self.model {
            None => DEFAULT_MODEL.to_string(),
            Some(model) if model.trim().is_empty() => {
                return Err(ToolError::InvalidParams(
                    "model must be a non-empty string".to_string(),
                ))
            }
            Some(model) => model,
        };
        if !KNOWN_MODELS.contains(&model.as_str()) {
            warn!(model = %model, "Model is not in the known model list; forwarding anyway");
        }

        if self.prompt.is_empty() {
            return Err(ToolError::InvalidParams(
                "prompt must not be empty".to_string(),
            ));
        }

        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ToolError::InvalidParams(format!(
                "temperature must be between 0.0 and 1.0, got {temperature}"
            )));
        }

        let max_output_tokens = self.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
        if max_output_tokens == 0 || max_output_tokens > MAX_OUTPUT_TOKENS_LIMIT {
            return Err(ToolError::InvalidParams(format!(
                "max_output_tokens must be between 1 and {MAX_OUTPUT_TOKENS_LIMIT}, got {max_output_tokens}"
            )));
        }

        if let Some(top_k) = self.top_k {
            if top_k == 0 {
                return Err(ToolError::InvalidParams(
                    "top_k must be positive".to_string(),
                ));
            }
        }

        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ToolError::InvalidParams(format!(
                    "top_p must be between 0.0 and 1.0, got {top_p}"
                )));
            }
        }

        Ok(GenerationParams {
            model,
            prompt: self.prompt,
            temperature,
            max_output_tokens,
            top_k: self.top_k,
            top_p: self.top_p,
            grounding: self.enable_grounding.unwrap_or(grounding_default),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerateTextRequest {
        GenerateTextRequest {
            model: None,
            prompt: prompt.to_string(),
            temperature: None,
            max_output_tokens: None,
            top_k: None,
            top_p: None,
            enable_grounding: None,
        }
    }

    #[test]
    fn defaults_applied() {
        let params = request("hello").validate(true).expect("valid");
        assert_eq!(params.model, DEFAULT_MODEL);
        assert_eq!(params.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(params.max_output_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
        assert!(params.top_k.is_none());
        assert!(params.top_p.is_none());
        assert!(params.grounding);
    }

    #[test]
    fn empty_prompt_rejected() {
        let err = request("").validate(true).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[test]
    fn temperature_out_of_range_rejected() {
        let mut req = request("hello");
        req.temperature = Some(1.5);
        let err = req.validate(true).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn max_output_tokens_out_of_range_rejected() {
        let mut req = request("hello");
        req.max_output_tokens = Some(9000);
        let err = req.validate(true).unwrap_err();
        assert!(err.to_string().contains("max_output_tokens"));

        let mut req = request("hello");
        req.max_output_tokens = Some(0);
        assert!(req.validate(true).is_err());
    }

    #[test]
    fn zero_top_k_rejected() {
        let mut req = request("hello");
        req.top_k = Some(0);
        assert!(req.validate(true).is_err());
    }

    #[test]
    fn top_p_out_of_range_rejected() {
        let mut req = request("hello");
        req.top_p = Some(1.2);
        assert!(req.validate(true).is_err());
    }

    #[test]
    fn unknown_model_is_forwarded() {
        let mut req = request("hello");
        req.model = Some("gemini-99-ultra".to_string());
        let params = req.validate(false).expect("permissive");
        assert_eq!(params.model, "gemini-99-ultra");
    }

    #[test]
    fn grounding_default_follows_mode() {
        assert!(request("hello").validate(true).expect("valid").grounding);
        assert!(!request("hello").validate(false).expect("valid").grounding);

        let mut req = request("hello");
        req.enable_grounding = Some(true);
        assert!(req.validate(false).expect("valid").grounding);
    }
}
