//! HTTP transport: JSON-RPC over POST with optional SSE response streaming.
//!
//! Every request POSTs to the configured URL. A response is either a JSON
//! body, returned directly, or a `text/event-stream` body, in which case the
//! frame whose id matches the outbound request is the response (`[DONE]` is
//! a sentinel). An `Mcp-Session-Id` response header is saved and replayed on
//! subsequent requests. Transient failures retry with exponential backoff
//! via `reqwest-retry`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::sse::SseParser;
use super::{McpTransport, TransportEvent};

/// Session continuity header defined by the streamable HTTP transport.
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// HTTP POST transport.
pub struct HttpTransport {
    backend_id: String,
    url: String,
    client: ClientWithMiddleware,
    session_id: RwLock<Option<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl HttpTransport {
    pub fn new(
        backend_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> GatewayResult<Self> {
        Self::with_retries(backend_id, url, headers, crate::config::defaults::MAX_RETRIES, events)
    }

    /// Build with an explicit retry budget (`max_retries` extra attempts,
    /// delays doubling from one second).
    pub fn with_retries(
        backend_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        max_retries: u32,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> GatewayResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| GatewayError::config(format!("invalid header '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| GatewayError::config(format!("invalid header value for '{key}': {e}")))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(1), Duration::from_secs(30))
            .build_with_max_retries(max_retries);

        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            backend_id: backend_id.to_string(),
            url: url.to_string(),
            client,
            session_id: RwLock::new(None),
            events,
        })
    }

    async fn post(&self, body: &JsonRpcRequest) -> GatewayResult<reqwest::Response> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(session) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;

        // Save the session cookie for all future requests.
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.write().await;
            if slot.as_deref() != Some(session) {
                tracing::debug!(backend = %self.backend_id, session, "Adopted backend session id");
                *slot = Some(session.to_string());
            }
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::transport(format!("HTTP {status}: {body}")));
        }

        Ok(response)
    }

    /// Read an SSE response body until the frame answering `id` arrives.
    async fn read_streamed_response(
        &self,
        response: reqwest::Response,
        id: i64,
    ) -> GatewayResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::transport(format!("SSE body read: {e}")))?;
            for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
                if frame.data == "[DONE]" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                    tracing::debug!(backend = %self.backend_id, "Skipping unparseable SSE frame");
                    continue;
                };
                match value.get("id").and_then(Value::as_i64) {
                    Some(frame_id) if frame_id == id => {
                        return serde_json::from_value(value).map_err(|e| {
                            GatewayError::protocol(format!("malformed streamed response: {e}"))
                        });
                    }
                    Some(_) => {}
                    None => {
                        if let Some(method) = value.get("method").and_then(Value::as_str) {
                            let params = value.get("params").cloned().unwrap_or(Value::Null);
                            let _ = self.events.send(TransportEvent::Notification {
                                method: method.to_string(),
                                params,
                            });
                        }
                    }
                }
            }
        }

        Err(GatewayError::protocol(format!("stream ended without a response for id {id}")))
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> GatewayResult<()> {
        // HTTP is connectionless; the MCP handshake itself proves liveness.
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

        let work = async {
            let response = self.post(&request).await?;

            let is_stream = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/event-stream"));

            if is_stream {
                self.read_streamed_response(response, id).await
            } else {
                let body: JsonRpcResponse = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::protocol(format!("malformed response body: {e}")))?;
                Ok(body)
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        // Fire-and-forget: failures are logged, never retried here.
        if let Err(e) = self.post(&notification).await {
            tracing::warn!(backend = %self.backend_id, error = %e, "Notification POST failed");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        *self.session_id.write().await = None;
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}
