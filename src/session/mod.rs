//! Per-client session management for the streamable HTTP transport.
//!
//! Stateless HTTP calls are multiplexed into logical sessions: the first
//! initialize request opens one, a header carries its id on every later
//! call, and a DELETE (or disconnect, or process shutdown) tears it down.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      HTTP surface (/mcp)                   │
//! │                                                            │
//! │  Client ──▶ McpRouter                                      │
//! │   (POST/GET/   ├─ known id      → continue session         │
//! │    DELETE)     ├─ POST + init   → begin session            │
//! │                └─ anything else → 400                      │
//! │                                                            │
//! │             SessionRegistry                                │
//! │             └─ sessions: HashMap<String, SessionTransport> │
//! │                                                            │
//! │             ShutdownController                             │
//! │             └─ running → shutting-down → stopped           │
//! └────────────────────────────────────────────────────────────┘
//!                    │ one duplex pipe per session
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ rmcp       │ │ rmcp       │ │ rmcp       │
//! │ service    │ │ service    │ │ service    │
//! │ (session A)│ │ (session B)│ │ (session N)│
//! └────────────┘ └────────────┘ └────────────┘
//! ```

mod lifecycle;
mod registry;
mod router;
mod transport;

pub use lifecycle::ShutdownController;
pub use registry::{SessionRegistry, TransportRegistry};
pub use router::{
    classify, is_initialize_request, serve_http, McpRouter, RouteAction, RouterConfig,
    SessionPresence, MCP_PATH, RESPONSE_GRACE, SESSION_ID_HEADER,
};
pub use transport::{SessionTransport, TransportError};
