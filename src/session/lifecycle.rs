//! Process lifecycle: one-shot shutdown of the HTTP surface.
//!
//! Shutdown is deliberately best-effort and never retried: the process is
//! exiting either way, so a failed per-session close is a diagnostic, not a
//! reason to stop closing the rest.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::TransportRegistry;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const STOPPED: u8 = 2;

/// One-shot shutdown coordinator.
///
/// States progress strictly Running -> ShuttingDown -> Stopped. A trigger
/// arriving while shutdown is already in progress is logged and dropped.
pub struct ShutdownController {
    state: AtomicU8,
    cancel: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            cancel: CancellationToken::new(),
        }
    }

    /// Enter shutdown. Returns false when a shutdown is already in progress;
    /// the caller must not run the sequence again.
    pub fn begin(&self, reason: &str) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                info!(reason = %reason, "Shutting down");
                true
            }
            Err(_) => {
                debug!(reason = %reason, "Shutdown already in progress; ignoring trigger");
                false
            }
        }
    }

    /// Close every session present when shutdown started. Each remaining
    /// session gets a close attempt even when an earlier one fails.
    pub async fn close_all_sessions(&self, registry: &TransportRegistry) {
        let entries = registry.snapshot().await;
        info!(sessions = entries.len(), "Closing active sessions");
        for (session_id, transport) in entries {
            if let Err(e) = transport.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close session during shutdown");
            }
            registry.remove(&session_id).await;
        }
    }

    /// Final step: stop the protocol server (the accept loop observes the
    /// token) and mark the controller stopped.
    pub fn finish(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Token observed by the serve loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}
