//! Gemini MCP Server
//!
//! This library exposes Google Gemini text generation as an MCP (Model
//! Context Protocol) tool, served over two transports:
//!
//! - **stdio**: one connection on stdin/stdout, for editor/agent hosts that
//!   spawn the server as a child process.
//! - **streamable HTTP**: one endpoint (`/mcp`) multiplexing many logical
//!   sessions, each identified by an `Mcp-Session-Id` header issued on the
//!   initialize handshake.
//!
//! # Architecture
//!
//! - **[`config`]**: environment configuration, validated before anything
//!   else runs. A missing or placeholder API key stops startup.
//!
//! - **[`gemini`]**: the outbound `generateContent` client. Constructed once
//!   at startup and shared; failures become [`GeminiError`] values, never
//!   panics.
//!
//! - **[`server`]**: the MCP server handler built on `rmcp`, exposing the
//!   `generate_text` tool with validated parameters.
//!
//! - **[`session`]**: the HTTP transport core. A registry maps session ids
//!   to per-session transports, a router classifies every request into
//!   continue/begin/reject, and a shutdown controller tears everything down
//!   exactly once on signals or fatal errors.
//!
//! # Tools
//!
//! - `generate_text`: run one Gemini generation. Parameters: `prompt`
//!   (required), `model`, `temperature`, `max_output_tokens`, `top_k`,
//!   `top_p`, `enable_grounding` (live web-search grounding).

pub mod config;
pub mod error;
pub mod gemini;
pub mod logging;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, LogLevel};
pub use error::ToolError;
pub use gemini::{GeminiClient, GeminiError};
pub use server::{GeminiMcpServer, ServerMode};
pub use session::{
    serve_http, McpRouter, RouterConfig, SessionRegistry, SessionTransport,
    ShutdownController, TransportRegistry,
};
