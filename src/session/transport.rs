//! Per-session protocol transport.
//!
//! Each HTTP session owns one in-process byte pipe with an rmcp service
//! running on the far end, speaking the same newline-delimited JSON framing
//! the stdio transport uses. The near end is this struct: it forwards raw
//! client messages unchanged, correlates responses to requests by JSON-RPC
//! id, and hands server-initiated messages to whichever event stream is
//! subscribed.
//!
//! The protocol library stays in charge of framing and dispatch; this layer
//! only owns delivery and lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmcp::{ServerHandler, ServiceExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the in-process pipe between the transport and its service.
const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;
/// Server-initiated messages buffered while the event stream consumer lags.
const EVENT_QUEUE_CAPACITY: usize = 32;

/// Failures at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session transport is closed")]
    Closed,

    #[error("no response from protocol service within {0}ms")]
    ResponseTimeout(u128),

    #[error("protocol handshake did not produce a response")]
    Handshake,

    #[error("failed to write to protocol service: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Value>>>;
type EventSlot = Mutex<Option<mpsc::Sender<Value>>>;

/// One session's protocol pipe.
pub struct SessionTransport {
    writer: AsyncMutex<WriteHalf<DuplexStream>>,
    pending: Arc<PendingMap>,
    events: Arc<EventSlot>,
    session_id: OnceLock<String>,
    id_gen: Box<dyn Fn() -> String + Send + Sync>,
    created_at: DateTime<Utc>,
    closed: CancellationToken,
    close_requested: AtomicBool,
    response_timeout: Duration,
}

impl SessionTransport {
    /// Spin up a service instance for one session and return the near end of
    /// its pipe.
    ///
    /// `id_gen` is called exactly once, when the initialize handshake
    /// completes. `on_close` fires when the service ends for any reason:
    /// explicit [`close`](Self::close), client disconnect, or a handshake
    /// failure; it receives the session id when one was ever confirmed.
    pub fn connect<H>(
        handler: H,
        response_timeout: Duration,
        id_gen: impl Fn() -> String + Send + Sync + 'static,
        on_close: impl FnOnce(Option<String>) + Send + 'static,
    ) -> Arc<Self>
    where
        H: ServerHandler,
    {
        let (server_io, client_io) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (client_read, client_write) = tokio::io::split(client_io);

        let transport = Arc::new(Self {
            writer: AsyncMutex::new(client_write),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(None)),
            session_id: OnceLock::new(),
            id_gen: Box::new(id_gen),
            created_at: Utc::now(),
            closed: CancellationToken::new(),
            close_requested: AtomicBool::new(false),
            response_timeout,
        });

        // Reader: routes every service-emitted line either to the request
        // that is waiting for it or to the event stream.
        {
            let pending = Arc::clone(&transport.pending);
            let events = Arc::clone(&transport.events);
            let closed = transport.closed.clone();
            let mut lines = BufReader::new(client_read).lines();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => dispatch_line(&pending, &events, &line),
                            Ok(None) | Err(_) => break,
                        },
                    }
                }
                // Service is gone: wake outstanding waiters (dropped senders
                // surface as Closed) and detach the event stream.
                pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
                events.lock().unwrap_or_else(|e| e.into_inner()).take();
            });
        }

        // Service: runs the protocol state machine until the pipe closes.
        {
            let closed = transport.closed.clone();
            let weak = Arc::downgrade(&transport);
            tokio::spawn(async move {
                let (server_read, server_write) = tokio::io::split(server_io);
                match handler.serve((server_read, server_write)).await {
                    Ok(service) => match service.waiting().await {
                        Ok(reason) => debug!(?reason, "session service finished"),
                        Err(e) => debug!(error = %e, "session service task failed"),
                    },
                    Err(e) => debug!(error = %e, "session handshake failed"),
                }
                closed.cancel();
                let session_id = weak.upgrade().and_then(|t| t.session_id.get().cloned());
                on_close(session_id);
            });
        }

        transport
    }

    /// Deliver the session-initialization message and wait for the handshake
    /// response. The awaited future is the single-shot session confirmation:
    /// when it resolves, the freshly generated id is live and the session is
    /// ready to be registered.
    pub async fn initialize(&self, message: Value) -> Result<(String, Value), TransportError> {
        let response = self
            .handle_message(message)
            .await?
            .ok_or(TransportError::Handshake)?;
        let id = self.session_id.get_or_init(|| (self.id_gen)()).clone();
        Ok((id, response))
    }

    /// Deliver one raw client message. Requests resolve to their response
    /// (or time out); notifications and client responses resolve to `None`
    /// once written.
    pub async fn handle_message(&self, message: Value) -> Result<Option<Value>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let expects_response =
            message.get("id").is_some() && message.get("method").is_some();
        if !expects_response {
            self.send(&message).await?;
            return Ok(None);
        }

        // serde_json renders numeric and string ids distinctly, so the
        // rendered id is a collision-free map key.
        let key = message["id"].to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), tx);

        if let Err(e) = self.send(&message).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            return Err(e);
        }

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            // Sender dropped: the service ended while we were waiting.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                Err(TransportError::ResponseTimeout(
                    self.response_timeout.as_millis(),
                ))
            }
        }
    }

    /// Attach an event stream for server-initiated messages. A new
    /// subscription replaces the previous one; the old receiver simply runs
    /// dry.
    pub fn subscribe(&self) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(tx);
        rx
    }

    /// Shut the session down. One-shot: a second call reports
    /// [`TransportError::Closed`] so shutdown loops can log and move on.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Session id, once the initialize handshake has confirmed it.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the session ends; lets event streams terminate
    /// promptly instead of discovering the closure on their next send.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn dispatch_line(pending: &PendingMap, events: &EventSlot, line: &str) {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Discarding unparseable message from protocol service");
            return;
        }
    };

    let is_response = message.get("result").is_some() || message.get("error").is_some();
    if is_response {
        if let Some(id) = message.get("id") {
            let key = id.to_string();
            if let Some(tx) = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key)
            {
                let _ = tx.send(message);
                return;
            }
        }
        // Nobody is waiting: the request timed out or its session is gone.
        // The result is discarded rather than written to a dead connection.
        debug!("Discarding response with no waiting request");
        return;
    }

    let subscriber = events
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    match subscriber {
        Some(tx) => {
            if tx.try_send(message).is_err() {
                debug!("Event stream full or gone; dropping server message");
            }
        }
        None => debug!("No event stream attached; dropping server message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone)]
    struct BareServer;

    impl ServerHandler for BareServer {}

    fn init_message() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.0.0"}
            }
        })
    }

    fn connect_bare() -> Arc<SessionTransport> {
        SessionTransport::connect(
            BareServer,
            Duration::from_secs(5),
            || "session-under-test".to_string(),
            |_| {},
        )
    }

    #[tokio::test]
    async fn initialize_confirms_generated_id() {
        let transport = connect_bare();
        let (id, response) = transport
            .initialize(init_message())
            .await
            .expect("handshake");
        assert_eq!(id, "session-under-test");
        assert_eq!(response["id"], 1);
        assert!(response.get("result").is_some());
        assert_eq!(transport.session_id(), Some("session-under-test"));
    }

    #[tokio::test]
    async fn notifications_resolve_without_waiting() {
        let transport = connect_bare();
        let _ = transport.initialize(init_message()).await.expect("handshake");
        let outcome = transport
            .handle_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await
            .expect("delivered");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn responses_are_correlated_by_request_id() {
        let transport = connect_bare();
        let _ = transport.initialize(init_message()).await.expect("handshake");
        let _ = transport
            .handle_message(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
            .expect("delivered");

        let response = transport
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "ping"
            }))
            .await
            .expect("delivered")
            .expect("request gets a response");
        assert_eq!(response["id"], 2);
        assert!(response.get("result").is_some() || response.get("error").is_some());
    }

    #[tokio::test]
    async fn close_is_one_shot() {
        let transport = connect_bare();
        transport.close().await.expect("first close succeeds");
        assert!(transport.is_closed());
        assert!(matches!(
            transport.close().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn messages_after_close_are_refused() {
        let transport = connect_bare();
        transport.close().await.expect("close");
        assert!(matches!(
            transport.handle_message(init_message()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn on_close_fires_with_confirmed_id() {
        let (tx, rx) = oneshot::channel();
        let transport = SessionTransport::connect(
            BareServer,
            Duration::from_secs(5),
            || "closing-session".to_string(),
            move |id| {
                let _ = tx.send(id);
            },
        );
        let _ = transport.initialize(init_message()).await.expect("handshake");
        transport.close().await.expect("close");

        let reported = timeout(Duration::from_secs(5), rx)
            .await
            .expect("close hook fired")
            .expect("hook value");
        assert_eq!(reported.as_deref(), Some("closing-session"));
    }
}
