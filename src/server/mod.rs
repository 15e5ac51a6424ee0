//! MCP server implementation exposing Gemini text generation.

mod requests;

pub use requests::*;

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use tracing::{debug, error, info, instrument};

use crate::error::ToolError;
use crate::gemini::GeminiClient;

/// MCP server for Gemini text generation.
#[derive(Clone)]
pub struct GeminiMcpServer {
    client: Arc<GeminiClient>,
    tool_router: ToolRouter<GeminiMcpServer>,
    mode: ServerMode,
}

#[derive(Clone, Copy, Debug)]
pub enum ServerMode {
    Stdio,
    Http,
}

impl GeminiMcpServer {
    pub fn new(client: Arc<GeminiClient>, mode: ServerMode) -> Self {
        info!("Creating Gemini MCP server");
        Self {
            client,
            tool_router: Self::tool_router(),
            mode,
        }
    }

    fn instructions(&self) -> String {
        format!(
            "Google Gemini text generation server. \
             \n\nWorkflow: \
             \n1. generate_text: Send a prompt, optionally choosing a model and \
             sampling parameters (temperature, top_k, top_p, max_output_tokens). \
             \n2. Set enable_grounding to augment the request with live web-search \
             retrieval when answers need current information. \
             \n\n{grounding_hint} \
             \nTip: model names outside the known list are forwarded as-is, so newly \
             released Gemini models can be used immediately.",
            grounding_hint = self.grounding_hint()
        )
    }

    fn grounding_hint(&self) -> &'static str {
        match self.mode {
            ServerMode::Stdio => "Grounding is on by default; pass enable_grounding=false to opt out.",
            ServerMode::Http => "Grounding is off by default; pass enable_grounding=true to opt in.",
        }
    }

    fn grounding_default(&self) -> bool {
        matches!(self.mode, ServerMode::Stdio)
    }
}

// Tool implementations using the #[tool_router] attribute

#[tool_router]
impl GeminiMcpServer {
    #[tool(
        description = "Generate text with a Google Gemini model. \
        Takes a prompt plus optional model name and sampling parameters \
        (temperature 0-1, max_output_tokens 1-8192, top_k, top_p). \
        Set enable_grounding to augment the request with live web-search retrieval. \
        Returns the generated text as a single content item."
    )]
    #[instrument(skip(self, req))]
    async fn generate_text(
        &self,
        Parameters(req): Parameters<GenerateTextRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: generate_text");
        let params = match req.validate(self.grounding_default()) {
            Ok(params) => params,
            Err(e) => return Ok(e.to_tool_result()),
        };

        match self.client.generate(&params).await {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(e) => {
                // Full detail goes to the log; the caller sees ToolError's
                // sanitized one-liner.
                error!(
                    model = %params.model,
                    status = ?e.status(),
                    detail = ?e.detail(),
                    "Gemini API call failed"
                );
                Ok(ToolError::Api(e).to_tool_result())
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for GeminiMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(self.instructions()),
            ..Default::default()
        }
    }
}
