//! SSE-handshake transport.
//!
//! Opens a long-lived GET stream, waits for the `endpoint` event naming the
//! POST URL (and optional `sessionId`), then POSTs requests there while the
//! GET stream keeps delivering server-initiated frames: responses are matched
//! against the pending map by id, frames without an id are notifications.
//!
//! The incremental [`SseParser`] here is shared with the HTTP transport,
//! which uses it to demultiplex `text/event-stream` response bodies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::defaults;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::{McpTransport, PendingMap, TransportEvent, await_pending};

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

/// Incremental SSE frame parser.
///
/// Feed it arbitrary chunk boundaries; it buffers partial lines and yields
/// complete frames at each blank-line separator. Comment (`:`), `id:` and
/// `retry:` lines are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of stream bytes, returning any frames it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    frames.push(SseFrame {
                        event: self.event.take(),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
            // ':' comments, 'id:' and 'retry:' fields are intentionally skipped.
        }

        frames
    }
}

/// Result of a completed SSE handshake.
#[derive(Debug, Clone)]
struct Endpoint {
    post_url: Url,
    session_id: Option<String>,
}

/// Resolve the `endpoint` event payload against the handshake URL.
///
/// The payload may be an absolute URL or a path (with query); a `sessionId`
/// query parameter is extracted when present.
fn resolve_endpoint(base: &Url, data: &str) -> GatewayResult<Endpoint> {
    let post_url = match Url::parse(data) {
        Ok(absolute) => absolute,
        Err(_) => base
            .join(data)
            .map_err(|e| GatewayError::protocol(format!("bad endpoint path '{data}': {e}")))?,
    };

    let session_id = post_url
        .query_pairs()
        .find(|(k, _)| k == "sessionId")
        .map(|(_, v)| v.into_owned());

    Ok(Endpoint { post_url, session_id })
}

/// SSE-handshake transport (GET stream + per-request POSTs).
pub struct SseTransport {
    backend_id: String,
    url: Url,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    endpoint: RwLock<Option<Endpoint>>,
    pending: Arc<PendingMap>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SseTransport {
    pub fn new(
        backend_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> GatewayResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| GatewayError::config(format!("invalid SSE url '{url}': {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            backend_id: backend_id.to_string(),
            url,
            headers: headers.clone(),
            client,
            endpoint: RwLock::new(None),
            pending: Arc::new(PendingMap::new()),
            stream_task: Mutex::new(None),
            events,
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        req
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> GatewayResult<()> {
        if self.endpoint.read().await.is_some() {
            return Ok(());
        }

        tracing::info!(backend = %self.backend_id, url = %self.url, "Opening SSE handshake stream");

        let response = self
            .apply_headers(self.client.get(self.url.clone()))
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::transport(format!(
                "SSE handshake returned {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        // Read frames until the server names its POST endpoint.
        let endpoint = tokio::time::timeout(defaults::SSE_HANDSHAKE_TIMEOUT, async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| {
                    GatewayError::transport(format!("SSE handshake read: {e}"))
                })?;
                for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
                    if frame.event.as_deref() == Some("endpoint") {
                        return resolve_endpoint(&self.url, &frame.data);
                    }
                }
            }
            Err(GatewayError::transport("SSE stream ended before endpoint event"))
        })
        .await
        .map_err(|_| GatewayError::Timeout(defaults::SSE_HANDSHAKE_TIMEOUT))??;

        tracing::info!(
            backend = %self.backend_id,
            endpoint = %endpoint.post_url,
            session = endpoint.session_id.as_deref().unwrap_or("-"),
            "SSE handshake complete"
        );
        *self.endpoint.write().await = Some(endpoint);

        // Keep the GET stream open for responses and server notifications.
        let backend = self.backend_id.clone();
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
                    dispatch_frame(&backend, &frame, &pending, &events).await;
                }
            }
            pending.fail_all_disconnected().await;
            let _ = events.send(TransportEvent::Disconnected);
        });
        *self.stream_task.lock().await = Some(task);

        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> GatewayResult<JsonRpcResponse> {
        let id = request
            .numeric_id()
            .ok_or_else(|| GatewayError::protocol("outbound request without numeric id"))?;
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(GatewayError::Disconnected)?;

        let rx = self.pending.register(id).await;

        let response = self
            .apply_headers(self.client.post(endpoint.post_url.clone()))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.pending.forget(id).await;
                return Err(e.into());
            }
        };

        if !response.status().is_success() && response.status().as_u16() != 202 {
            self.pending.forget(id).await;
            return Err(GatewayError::transport(format!(
                "POST {} returned {}",
                endpoint.post_url,
                response.status()
            )));
        }

        // Some servers answer in the POST body, others on the GET stream.
        if let Ok(body) = response.json::<JsonRpcResponse>().await {
            if body.numeric_id() == Some(id) {
                self.pending.forget(id).await;
                return Ok(body);
            }
        }

        await_pending(&self.pending, id, rx, timeout).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(GatewayError::Disconnected)?;

        let result = self
            .apply_headers(self.client.post(endpoint.post_url.clone()))
            .json(&JsonRpcRequest::notification(method, params))
            .send()
            .await;

        // Notifications are fire-and-forget: log, never retry.
        if let Err(e) = result {
            tracing::warn!(backend = %self.backend_id, error = %e, "Notification POST failed");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        // A reconnect performs a fresh handshake and gets a new session id;
        // requests from the old session cannot be correlated any more.
        *self.endpoint.write().await = None;
        self.pending.fail_all_disconnected().await;
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

/// Route one GET-stream frame: response by id, notification otherwise.
async fn dispatch_frame(
    backend: &str,
    frame: &SseFrame,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    if frame.data == "[DONE]" {
        return;
    }

    let value: Value = match serde_json::from_str(&frame.data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(backend = %backend, error = %e, "Dropping unparseable SSE frame");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_i64) {
        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                if !pending.complete(id, Ok(response)).await {
                    tracing::debug!(backend = %backend, id, "Dropping late or unknown SSE response");
                }
            }
            Err(e) => {
                pending
                    .complete(id, Err(GatewayError::protocol(format!("malformed response: {e}"))))
                    .await;
            }
        }
    } else if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let _ = events.send(TransportEvent::Notification { method: method.to_string(), params });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_single_frame() {
        let mut parser = SseParser::new();
        let frames = parser.push("event: endpoint\ndata: /message?sessionId=abc\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("endpoint"));
        assert_eq!(frames[0].data, "/message?sessionId=abc");
    }

    #[test]
    fn test_parser_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"jsonrpc\":").is_empty());
        assert!(parser.push("\"2.0\",\"id\":7}\n").is_empty());
        let frames = parser.push("\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, r#"{"jsonrpc":"2.0","id":7}"#);
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn test_parser_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn test_parser_ignores_comments_and_crlf() {
        let mut parser = SseParser::new();
        let frames = parser.push(": keepalive\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn test_resolve_relative_endpoint() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        let ep = resolve_endpoint(&base, "/message?sessionId=tok123").unwrap();
        assert_eq!(ep.post_url.as_str(), "https://mcp.example.com/message?sessionId=tok123");
        assert_eq!(ep.session_id.as_deref(), Some("tok123"));
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        let ep = resolve_endpoint(&base, "https://other.example.com/rpc").unwrap();
        assert_eq!(ep.post_url.as_str(), "https://other.example.com/rpc");
        assert!(ep.session_id.is_none());
    }

    #[tokio::test]
    async fn test_done_sentinel_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingMap::new();
        let frame = SseFrame { event: Some("message".into()), data: "[DONE]".into() };
        dispatch_frame("test", &frame, &pending, &tx).await;
        assert!(rx.try_recv().is_err());
    }
}
