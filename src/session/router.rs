//! Single-endpoint HTTP router for the streamable transport.
//!
//! Every request to the MCP path is classified into exactly one of three
//! actions, evaluated in fixed order:
//!
//! 1. carries a registered session id -> continue that session,
//! 2. carries no id, is a POST, and the body is an initialize request ->
//!    begin a new session,
//! 3. anything else -> reject with 400.
//!
//! The ordering matters: a request bearing an unknown or expired id must
//! never be promoted to a fresh session, so it fails branch 1 and, still
//! carrying an id, can never satisfy branch 2.

use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::http::{
    header::{ALLOW, CACHE_CONTROL, CONTENT_TYPE, ORIGIN},
    Method, Request, Response, StatusCode,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_service::Service;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::logging::redact_json;
use crate::server::GeminiMcpServer;

use super::registry::TransportRegistry;
use super::transport::{SessionTransport, TransportError};

/// The one protocol route.
pub const MCP_PATH: &str = "/mcp";
/// Header carrying the session id (header lookup is case-insensitive).
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Margin added on top of the outbound timeout when waiting for the protocol
/// service to answer, so the service's own timeout always fires first.
pub const RESPONSE_GRACE: Duration = Duration::from_secs(10);

type RouterBody = BoxBody<Bytes, Infallible>;

/// How the session header relates to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPresence {
    Absent,
    Known,
    Unknown,
}

/// The three possible outcomes of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Continue,
    Begin,
    Reject,
}

/// Classify one request. Total and mutually exclusive over its inputs.
pub fn classify(presence: SessionPresence, method: &Method, body_is_init: bool) -> RouteAction {
    match presence {
        SessionPresence::Known => RouteAction::Continue,
        SessionPresence::Unknown => RouteAction::Reject,
        SessionPresence::Absent if *method == Method::POST && body_is_init => RouteAction::Begin,
        SessionPresence::Absent => RouteAction::Reject,
    }
}

/// Structural predicate for "this body opens a session". Evaluated on the
/// payload, never on headers.
pub fn is_initialize_request(body: &Value) -> bool {
    body.as_object().is_some_and(|obj| {
        obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
            && obj.get("method").and_then(Value::as_str) == Some("initialize")
            && obj.contains_key("id")
    })
}

/// Router tuning shared by every request.
#[derive(Clone)]
pub struct RouterConfig {
    pub allowed_origins: Vec<String>,
    pub response_timeout: Duration,
    pub sse_keep_alive: Option<Duration>,
}

/// Tower service dispatching all traffic on the MCP route.
#[derive(Clone)]
pub struct McpRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: Arc<TransportRegistry>,
    server_factory: Arc<dyn Fn() -> GeminiMcpServer + Send + Sync>,
    allowed_origins: HashSet<String>,
    response_timeout: Duration,
    sse_keep_alive: Option<Duration>,
}

impl McpRouter {
    pub fn new(
        registry: Arc<TransportRegistry>,
        server_factory: Arc<dyn Fn() -> GeminiMcpServer + Send + Sync>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                server_factory,
                allowed_origins: config.allowed_origins.into_iter().collect(),
                response_timeout: config.response_timeout,
                sse_keep_alive: config.sse_keep_alive,
            }),
        }
    }
}

impl<B> Service<Request<B>> for McpRouter
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    type Response = Response<RouterBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let response = match inner.handle(req).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, "Request handler failed");
                    internal_error(&e.to_string())
                }
            };
            Ok(response)
        })
    }
}

/// Internal handler failures that become 500 responses.
#[derive(Debug, thiserror::Error)]
enum RouterError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("session handshake failed: {0}")]
    Handshake(TransportError),

    #[error("session delivery failed: {0}")]
    Delivery(TransportError),
}

impl RouterInner {
    async fn handle<B>(&self, req: Request<B>) -> Result<Response<RouterBody>, RouterError>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
    {
        if let Some(origin) = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) {
            if !self.allowed_origins.contains(origin) {
                return Ok(forbidden());
            }
        }

        if req.uri().path() != MCP_PATH {
            return Ok(not_found());
        }

        let method = req.method().clone();
        let session_header = req
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body_bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|e| RouterError::Body(e.to_string()))?
            .to_bytes();

        let body_json: Option<Value> = if method == Method::POST && !body_bytes.is_empty() {
            match serde_json::from_slice(&body_bytes) {
                Ok(value) => Some(value),
                Err(_) => return Ok(reject()),
            }
        } else {
            None
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Some(body) = &body_json {
                let mut redacted = body.clone();
                redact_json(&mut redacted);
                debug!(method = %method, body = %redacted, "Handling MCP request");
            } else {
                debug!(method = %method, "Handling MCP request");
            }
        }

        let session = match &session_header {
            None => None,
            Some(id) => Some((id.clone(), self.registry.lookup(id).await)),
        };
        let presence = match &session {
            None => SessionPresence::Absent,
            Some((_, Some(_))) => SessionPresence::Known,
            Some((_, None)) => SessionPresence::Unknown,
        };
        let body_is_init = body_json.as_ref().is_some_and(is_initialize_request);

        match classify(presence, &method, body_is_init) {
            RouteAction::Reject => Ok(reject()),
            RouteAction::Begin => match body_json {
                Some(body) => self.begin_session(body).await,
                // classify only returns Begin when body_is_init held.
                None => Ok(reject()),
            },
            RouteAction::Continue => match session {
                Some((id, Some(transport))) => {
                    self.continue_session(&id, transport, &method, body_json)
                        .await
                }
                _ => Ok(reject()),
            },
        }
    }

    /// Branch 2: construct a transport, run the initialize handshake, and
    /// register the session the moment its id is confirmed.
    async fn begin_session(&self, body: Value) -> Result<Response<RouterBody>, RouterError> {
        let server = (self.server_factory)();
        let registry = Arc::clone(&self.registry);
        let transport = SessionTransport::connect(
            server,
            self.response_timeout,
            || Uuid::new_v4().to_string(),
            move |session_id| {
                // Natural close; the entry may already be gone, remove is
                // idempotent.
                if let Some(id) = session_id {
                    tokio::spawn(async move {
                        registry.remove(&id).await;
                        info!(session_id = %id, "Session closed");
                    });
                }
            },
        );

        match transport.initialize(body).await {
            Ok((session_id, response)) => {
                self.registry
                    .register(session_id.clone(), Arc::clone(&transport))
                    .await;
                info!(session_id = %session_id, "Session established");
                let body = serde_json::to_string(&response)
                    .unwrap_or_else(|_| "{}".to_string());
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/json")
                    .header(SESSION_ID_HEADER, session_id)
                    .body(Full::new(Bytes::from(body)).boxed())
                    .unwrap_or_else(|_| internal_error("response build failed")))
            }
            Err(e) => {
                let _ = transport.close().await;
                Err(RouterError::Handshake(e))
            }
        }
    }

    /// Branch 1: hand the raw request to the session's transport.
    async fn continue_session(
        &self,
        session_id: &str,
        transport: Arc<SessionTransport>,
        method: &Method,
        body: Option<Value>,
    ) -> Result<Response<RouterBody>, RouterError> {
        match *method {
            Method::POST => {
                let message = match body {
                    Some(message) => message,
                    None => return Ok(reject()),
                };
                match transport.handle_message(message).await {
                    Ok(Some(response)) => {
                        let body = serde_json::to_string(&response)
                            .unwrap_or_else(|_| "{}".to_string());
                        Ok(Response::builder()
                            .status(StatusCode::OK)
                            .header(CONTENT_TYPE, "application/json")
                            .body(Full::new(Bytes::from(body)).boxed())
                            .unwrap_or_else(|_| internal_error("response build failed")))
                    }
                    Ok(None) => Ok(accepted()),
                    Err(TransportError::Closed) => {
                        // The session died between lookup and delivery; its
                        // id is stale now.
                        self.registry.remove(session_id).await;
                        Ok(reject())
                    }
                    Err(e) => Err(RouterError::Delivery(e)),
                }
            }
            Method::GET => Ok(self.event_stream(transport)),
            Method::DELETE => {
                if let Err(e) = transport.close().await {
                    debug!(session_id = %session_id, error = %e, "Close on already-closed session");
                }
                self.registry.remove(session_id).await;
                info!(session_id = %session_id, "Session terminated by client");
                Ok(empty(StatusCode::OK))
            }
            _ => Ok(method_not_allowed()),
        }
    }

    /// GET: stream server-initiated messages as server-sent events.
    fn event_stream(&self, transport: Arc<SessionTransport>) -> Response<RouterBody> {
        let mut events = transport.subscribe();
        let closed = transport.closed_token();
        let keep_alive = self.sse_keep_alive;
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(EVENT_FRAME_BUFFER);

        tokio::spawn(async move {
            let mut ticker = keep_alive.map(|period| {
                tokio::time::interval_at(tokio::time::Instant::now() + period, period)
            });
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    event = events.recv() => match event {
                        Some(message) => {
                            let frame = format!("event: message\ndata: {message}\n\n");
                            if tx.send(Ok(Frame::data(Bytes::from(frame)))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = keep_alive_tick(&mut ticker) => {
                        if tx
                            .send(Ok(Frame::data(Bytes::from_static(b": keep-alive\n\n"))))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(StreamBody::new(ReceiverStream::new(rx)).boxed())
            .unwrap_or_else(|_| internal_error("response build failed"))
    }
}

const EVENT_FRAME_BUFFER: usize = 16;

async fn keep_alive_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn json_body(value: Value) -> RouterBody {
    Full::new(Bytes::from(value.to_string())).boxed()
}

fn reject() -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(CONTENT_TYPE, "application/json")
        .body(json_body(json!({"error": "Invalid MCP request"})))
        .expect("static response")
}

fn forbidden() -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Full::new(Bytes::from_static(b"Forbidden")).boxed())
        .expect("static response")
}

fn not_found() -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "application/json")
        .body(json_body(json!({"error": "Not found"})))
        .expect("static response")
}

fn method_not_allowed() -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(ALLOW, "GET, POST, DELETE")
        .body(json_body(json!({"error": "Method not allowed"})))
        .expect("static response")
}

fn accepted() -> Response<RouterBody> {
    empty(StatusCode::ACCEPTED)
}

fn empty(status: StatusCode) -> Response<RouterBody> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()).boxed())
        .expect("static response")
}

fn internal_error(message: &str) -> Response<RouterBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, "application/json")
        .body(json_body(
            json!({"error": "Internal server error", "message": message}),
        ))
        .expect("static response")
}

/// Accept loop for the streamable HTTP transport. Runs until `cancel` fires
/// or accepting fails.
pub async fn serve_http(
    listener: TcpListener,
    router: McpRouter,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("HTTP server shutting down");
                break;
            }
            res = listener.accept() => {
                let (stream, _) = res?;
                let svc = router.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let conn = http1::Builder::new()
                        .serve_connection(io, TowerToHyperService::new(svc));
                    if let Err(err) = conn.await {
                        error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_id_always_continues() {
        for method in [Method::GET, Method::POST, Method::DELETE, Method::PUT] {
            for body_is_init in [false, true] {
                assert_eq!(
                    classify(SessionPresence::Known, &method, body_is_init),
                    RouteAction::Continue
                );
            }
        }
    }

    #[test]
    fn unknown_id_always_rejects_never_begins() {
        for method in [Method::GET, Method::POST, Method::DELETE] {
            for body_is_init in [false, true] {
                assert_eq!(
                    classify(SessionPresence::Unknown, &method, body_is_init),
                    RouteAction::Reject
                );
            }
        }
    }

    #[test]
    fn begin_requires_post_and_init_body() {
        assert_eq!(
            classify(SessionPresence::Absent, &Method::POST, true),
            RouteAction::Begin
        );
        assert_eq!(
            classify(SessionPresence::Absent, &Method::POST, false),
            RouteAction::Reject
        );
        assert_eq!(
            classify(SessionPresence::Absent, &Method::GET, true),
            RouteAction::Reject
        );
        assert_eq!(
            classify(SessionPresence::Absent, &Method::DELETE, true),
            RouteAction::Reject
        );
    }

    #[test]
    fn classification_is_total() {
        // Every (presence, method, body) combination maps to exactly one
        // action; spot-check the full grid for a few methods.
        for presence in [
            SessionPresence::Absent,
            SessionPresence::Known,
            SessionPresence::Unknown,
        ] {
            for method in [Method::GET, Method::POST, Method::DELETE, Method::PATCH] {
                for body_is_init in [false, true] {
                    let action = classify(presence, &method, body_is_init);
                    assert!(matches!(
                        action,
                        RouteAction::Continue | RouteAction::Begin | RouteAction::Reject
                    ));
                }
            }
        }
    }

    #[test]
    fn initialize_predicate_is_structural() {
        assert!(is_initialize_request(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        })));
        // Notifications carry no id and do not open sessions.
        assert!(!is_initialize_request(&json!({
            "jsonrpc": "2.0", "method": "initialize"
        })));
        assert!(!is_initialize_request(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        })));
        assert!(!is_initialize_request(&json!({
            "id": 1, "method": "initialize"
        })));
        assert!(!is_initialize_request(&json!([
            {"jsonrpc": "2.0", "id": 1, "method": "initialize"}
        ])));
        assert!(!is_initialize_request(&json!("initialize")));
    }
}
