//! Transport adapters for backend MCP servers.
//!
//! Three transports share one contract: child-process line-delimited JSON,
//! HTTP POST (with optional SSE response streaming), and SSE-handshake.
//! Each adapter frames JSON-RPC on/off the wire and reports lifecycle and
//! server-notification events through an [`TransportEvent`] channel owned by
//! the backend session.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::config::TransportConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Out-of-band events a transport reports to its owning backend session.
#[derive(Debug)]
pub enum TransportEvent {
    /// The wire is up.
    Connected,
    /// The wire went down; all pending requests have been failed.
    Disconnected,
    /// A transport-level fault that ends the session.
    Error(String),
    /// A server-originated notification (a frame with `method` but no `id`).
    Notification { method: String, params: Value },
}

/// Abstract transport contract shared by all three adapters.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Bring the wire up (spawn the child, perform the SSE handshake, ...).
    async fn connect(&self) -> GatewayResult<()>;

    /// Send one request and wait for its correlated response.
    ///
    /// The request must carry a numeric id; `timeout` is the effective
    /// per-request timeout. On expiry the pending entry is removed and a
    /// late response is dropped on arrival.
    async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> GatewayResult<JsonRpcResponse>;

    /// Send a notification; no response is expected.
    async fn send_notification(&self, method: &str, params: Option<Value>) -> GatewayResult<()>;

    /// Tear the wire down, failing every pending request exactly once.
    async fn disconnect(&self);
}

/// Construct the adapter for a transport descriptor.
pub fn build_transport(
    config: &TransportConfig,
    backend_id: &str,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> GatewayResult<Box<dyn McpTransport>> {
    match config {
        TransportConfig::Stdio { command, args, cwd, env } => Ok(Box::new(
            stdio::StdioTransport::new(backend_id, command, args, cwd.as_deref(), env, events),
        )),
        TransportConfig::Http { url, headers } => Ok(Box::new(http::HttpTransport::new(
            backend_id, url, headers, events,
        )?)),
        TransportConfig::Sse { url, headers } => Ok(Box::new(sse::SseTransport::new(
            backend_id, url, headers, events,
        )?)),
    }
}

/// Correlation table from outbound request id to the waiting caller.
///
/// Completion and timeout both *remove* the entry, so a late response after a
/// timeout (or a second completion) finds nothing and is a no-op.
#[derive(Default)]
pub struct PendingMap {
    inner: Mutex<HashMap<i64, oneshot::Sender<GatewayResult<JsonRpcResponse>>>>,
}

impl PendingMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request, returning the receiver to await.
    pub async fn register(&self, id: i64) -> oneshot::Receiver<GatewayResult<JsonRpcResponse>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id, tx);
        rx
    }

    /// Complete a pending request. Returns false when no entry matches
    /// (late response, cancelled request).
    pub async fn complete(&self, id: i64, result: GatewayResult<JsonRpcResponse>) -> bool {
        match self.inner.lock().await.remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without completing it (request timed out).
    pub async fn forget(&self, id: i64) {
        self.inner.lock().await.remove(&id);
    }

    /// Fail every pending request with a disconnect error.
    pub async fn fail_all_disconnected(&self) {
        let drained: Vec<_> = self.inner.lock().await.drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(GatewayError::Disconnected));
        }
    }

    /// Number of requests currently awaiting a response.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no requests are pending.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Await a pending response with a timeout, removing the entry on expiry.
pub(crate) async fn await_pending(
    pending: &PendingMap,
    id: i64,
    rx: oneshot::Receiver<GatewayResult<JsonRpcResponse>>,
    timeout: Duration,
) -> GatewayResult<JsonRpcResponse> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        // Sender dropped without completing: the map was torn down.
        Ok(Err(_)) => Err(GatewayError::Disconnected),
        Err(_) => {
            pending.forget(id).await;
            Err(GatewayError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcResponse;

    #[tokio::test]
    async fn test_pending_complete_once() {
        let pending = PendingMap::new();
        let rx = pending.register(1).await;

        let resp = JsonRpcResponse::success(Some(Value::from(1)), Value::Null);
        assert!(pending.complete(1, Ok(resp.clone())).await);
        // Second completion finds nothing.
        assert!(!pending.complete(1, Ok(resp)).await);

        assert!(rx.await.unwrap().is_ok());
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let pending = PendingMap::new();
        let rx = pending.register(7).await;

        let result = await_pending(&pending, 7, rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert!(pending.is_empty().await);

        // Late response is a no-op.
        let resp = JsonRpcResponse::success(Some(Value::from(7)), Value::Null);
        assert!(!pending.complete(7, Ok(resp)).await);
    }

    #[tokio::test]
    async fn test_fail_all_disconnected() {
        let pending = PendingMap::new();
        let rx1 = pending.register(1).await;
        let rx2 = pending.register(2).await;

        pending.fail_all_disconnected().await;
        assert!(pending.is_empty().await);

        assert!(matches!(rx1.await.unwrap(), Err(GatewayError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(GatewayError::Disconnected)));
    }
}
