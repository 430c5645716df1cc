//! Backend session: one connection to one MCP server.
//!
//! A [`Backend`] owns a transport and drives the MCP lifecycle over it:
//! connect, `initialize` handshake, capability-gated list loads, then serving
//! requests until disconnect. Tool names are rewritten with the configured
//! prefix at load time; the raw name is recovered on outbound `tools/call`.

pub mod semaphore;
pub mod supervisor;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};

use crate::config::BackendConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{
    JsonRpcRequest, PROTOCOL_VERSION, PeerCapabilities, PromptDef, ResourceDef, ToolDef,
};
use crate::transport::{McpTransport, TransportEvent, build_transport};

use semaphore::InflightSemaphore;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// The most recent failure recorded for a backend.
#[derive(Debug, Clone)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One backend MCP server fronted by the gateway.
pub struct Backend {
    config: BackendConfig,
    status: RwLock<BackendStatus>,
    capabilities: RwLock<PeerCapabilities>,
    tools: RwLock<Vec<ToolDef>>,
    resources: RwLock<Vec<ResourceDef>>,
    prompts: RwLock<Vec<PromptDef>>,
    last_error: RwLock<Option<LastError>>,
    seq: AtomicI64,
    transport: Box<dyn McpTransport>,
    semaphore: InflightSemaphore,
}

impl Backend {
    /// Construct a backend and the transport event stream the supervisor
    /// pumps. Does not connect.
    pub fn new(config: BackendConfig) -> GatewayResult<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = build_transport(&config.transport, &config.id, events_tx)?;
        let semaphore = InflightSemaphore::new(config.max_concurrent);

        let backend = Arc::new(Self {
            config,
            status: RwLock::new(BackendStatus::Disconnected),
            capabilities: RwLock::new(PeerCapabilities::default()),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            seq: AtomicI64::new(0),
            transport,
            semaphore,
        });

        Ok((backend, events_rx))
    }

    /// Backend id (the routing key).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Backend configuration.
    #[must_use]
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> BackendStatus {
        *self.status.read().await
    }

    /// Capabilities the peer advertised during `initialize`.
    pub async fn capabilities(&self) -> PeerCapabilities {
        self.capabilities.read().await.clone()
    }

    /// Snapshot of tools with *public* (prefixed) names.
    pub async fn tools(&self) -> Vec<ToolDef> {
        self.tools.read().await.clone()
    }

    /// Snapshot of resources.
    pub async fn resources(&self) -> Vec<ResourceDef> {
        self.resources.read().await.clone()
    }

    /// Snapshot of prompts.
    pub async fn prompts(&self) -> Vec<PromptDef> {
        self.prompts.read().await.clone()
    }

    /// Most recent recorded failure.
    pub async fn last_error(&self) -> Option<LastError> {
        self.last_error.read().await.clone()
    }

    /// Connect, handshake, and load advertised capabilities.
    ///
    /// A no-op when already connecting or connected. Transport and handshake
    /// failures move the backend to `Error`; list-load failures are logged
    /// but do not fail the transition.
    pub async fn connect(&self) -> GatewayResult<()> {
        {
            let mut status = self.status.write().await;
            if matches!(*status, BackendStatus::Connecting | BackendStatus::Connected) {
                return Ok(());
            }
            *status = BackendStatus::Connecting;
        }

        if let Err(e) = self.transport.connect().await {
            self.record_error(&e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self.initialize().await {
            self.record_error(&e.to_string()).await;
            return Err(e);
        }

        let caps = self.capabilities().await;
        let (tools, resources, prompts) = tokio::join!(
            async { if caps.has_tools() { self.reload_tools().await } else { Ok(()) } },
            async { if caps.has_resources() { self.reload_resources().await } else { Ok(()) } },
            async { if caps.has_prompts() { self.reload_prompts().await } else { Ok(()) } },
        );
        for (kind, result) in [("tools", tools), ("resources", resources), ("prompts", prompts)] {
            if let Err(e) = result {
                tracing::warn!(backend = %self.config.id, kind, error = %e, "List load failed");
            }
        }

        *self.status.write().await = BackendStatus::Connected;
        let tool_count = self.tools.read().await.len();
        tracing::info!(
            backend = %self.config.id,
            transport = self.config.transport.kind(),
            tools = tool_count,
            "Backend connected"
        );
        Ok(())
    }

    /// MCP `initialize` handshake followed by the `initialized` notification.
    async fn initialize(&self) -> GatewayResult<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "roots": { "listChanged": true },
                "sampling": {}
            },
            "clientInfo": {
                "name": "mcp-gateway",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.send_request("initialize", Some(params), None).await?;

        let caps = result
            .get("capabilities")
            .cloned()
            .map(serde_json::from_value::<PeerCapabilities>)
            .transpose()?
            .unwrap_or_default();
        *self.capabilities.write().await = caps;

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;

        tracing::debug!(
            backend = %self.config.id,
            protocol = result.get("protocolVersion").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Initialize handshake complete"
        );
        Ok(())
    }

    /// Send one JSON-RPC request through the bounded-dispatch gate.
    ///
    /// The effective timeout is the caller's override or the configured
    /// per-request timeout. A JSON-RPC error object from the peer becomes
    /// a [`GatewayError::Rpc`].
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_override: Option<Duration>,
    ) -> GatewayResult<Value> {
        {
            let status = *self.status.read().await;
            if !matches!(status, BackendStatus::Connecting | BackendStatus::Connected) {
                return Err(GatewayError::unavailable(&self.config.id));
            }
        }

        self.semaphore.acquire().await?;
        let id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = JsonRpcRequest::request(id, method, params);
        let timeout = timeout_override.unwrap_or_else(|| self.config.request_timeout());

        tracing::debug!(backend = %self.config.id, method, id, "-> request");
        let result = self.transport.send_request(request, timeout).await;
        self.semaphore.release();

        let response = result?;
        if let Some(error) = response.error {
            return Err(GatewayError::Rpc { code: error.code, message: error.message });
        }
        response
            .result
            .ok_or_else(|| GatewayError::protocol("response carried neither result nor error"))
    }

    /// Call a tool by its *public* name; the prefix is stripped on the wire.
    pub async fn call_tool(&self, public_name: &str, arguments: Value) -> GatewayResult<Value> {
        let raw = self.unprefix(public_name);
        let params = serde_json::json!({
            "name": raw,
            "arguments": arguments
        });
        self.send_request("tools/call", Some(params), None).await
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> GatewayResult<Value> {
        self.send_request("resources/read", Some(serde_json::json!({ "uri": uri })), None)
            .await
    }

    /// Get a prompt by its *public* name.
    pub async fn get_prompt(&self, public_name: &str, arguments: Value) -> GatewayResult<Value> {
        let raw = self.unprefix(public_name);
        let params = serde_json::json!({
            "name": raw,
            "arguments": arguments
        });
        self.send_request("prompts/get", Some(params), None).await
    }

    /// Re-issue `tools/list` and replace the snapshot.
    pub async fn reload_tools(&self) -> GatewayResult<()> {
        let result = self.send_request("tools/list", None, None).await?;
        let raw: Vec<ToolDef> = result
            .get("tools")
            .cloned()
            .map(serde_json::from_value::<Vec<ToolDef>>)
            .transpose()?
            .unwrap_or_default();

        let tools: Vec<ToolDef> = raw
            .into_iter()
            .filter(|t| self.tool_allowed(&t.name))
            .map(|mut t| {
                t.name = self.public_name(&t.name);
                t
            })
            .collect();

        tracing::debug!(backend = %self.config.id, count = tools.len(), "Loaded tools");
        *self.tools.write().await = tools;
        Ok(())
    }

    /// Re-issue `resources/list` and replace the snapshot.
    pub async fn reload_resources(&self) -> GatewayResult<()> {
        let result = self.send_request("resources/list", None, None).await?;
        let resources: Vec<ResourceDef> = result
            .get("resources")
            .cloned()
            .map(serde_json::from_value::<Vec<ResourceDef>>)
            .transpose()?
            .unwrap_or_default();
        tracing::debug!(backend = %self.config.id, count = resources.len(), "Loaded resources");
        *self.resources.write().await = resources;
        Ok(())
    }

    /// Re-issue `prompts/list` and replace the snapshot.
    pub async fn reload_prompts(&self) -> GatewayResult<()> {
        let result = self.send_request("prompts/list", None, None).await?;
        let prompts: Vec<PromptDef> = result
            .get("prompts")
            .cloned()
            .map(serde_json::from_value::<Vec<PromptDef>>)
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .map(|mut p: PromptDef| {
                p.name = self.public_name(&p.name);
                p
            })
            .collect();
        tracing::debug!(backend = %self.config.id, count = prompts.len(), "Loaded prompts");
        *self.prompts.write().await = prompts;
        Ok(())
    }

    /// Voluntary disconnect: tear down the transport, fail pending and
    /// queued requests, reset the dispatch gate.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.semaphore.drain_disconnected();
        *self.status.write().await = BackendStatus::Disconnected;
    }

    /// Transition to `Disconnected` after a peer-initiated drop, releasing
    /// transport resources so a later `connect()` starts clean.
    pub(crate) async fn mark_disconnected(&self) {
        self.semaphore.drain_disconnected();
        *self.status.write().await = BackendStatus::Disconnected;
        self.transport.disconnect().await;
    }

    /// Transition to `Error` and record the failure.
    pub(crate) async fn record_error(&self, message: &str) {
        self.semaphore.drain_disconnected();
        *self.status.write().await = BackendStatus::Error;
        *self.last_error.write().await =
            Some(LastError { message: message.to_string(), at: Utc::now() });
        self.transport.disconnect().await;
    }

    /// The public (prefixed) form of a raw tool/prompt name.
    #[must_use]
    pub fn public_name(&self, raw: &str) -> String {
        match &self.config.tool_prefix {
            Some(prefix) => format!("{prefix}_{raw}"),
            None => raw.to_string(),
        }
    }

    /// Recover the raw name from a public one. Prefix rules are owned here,
    /// so routing layers never need to know whether one is configured.
    #[must_use]
    pub fn unprefix<'a>(&self, public: &'a str) -> &'a str {
        match &self.config.tool_prefix {
            Some(prefix) => public
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .unwrap_or(public),
            None => public,
        }
    }

    /// Apply the per-backend allow/block globs to a raw tool name.
    fn tool_allowed(&self, raw: &str) -> bool {
        if let Some(blocked) = &self.config.blocked_tools {
            if blocked.iter().any(|pat| glob_match(pat, raw)) {
                return false;
            }
        }
        if let Some(allowed) = &self.config.allowed_tools {
            return allowed.iter().any(|pat| glob_match(pat, raw));
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn semaphore(&self) -> &InflightSemaphore {
        &self.semaphore
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.config.id)
            .field("transport", &self.config.transport.kind())
            .finish_non_exhaustive()
    }
}

/// Minimal glob matching: `*` matches any run, `?` matches one character.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pat: &[u8], text: &[u8]) -> bool {
        match (pat.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pat[1..], text) || (!text.is_empty() && inner(pat, &text[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pat[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pat[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_prefix(prefix: Option<&str>) -> Arc<Backend> {
        let mut config = BackendConfig::stdio("srv", "cat", &[]);
        config.tool_prefix = prefix.map(ToString::to_string);
        let (backend, _rx) = Backend::new(config).unwrap();
        backend
    }

    #[test]
    fn test_prefix_roundtrip() {
        let backend = backend_with_prefix(Some("db"));
        assert_eq!(backend.public_name("query"), "db_query");
        assert_eq!(backend.unprefix("db_query"), "query");
    }

    #[test]
    fn test_no_prefix_is_identity() {
        let backend = backend_with_prefix(None);
        assert_eq!(backend.public_name("query"), "query");
        assert_eq!(backend.unprefix("query"), "query");
    }

    #[test]
    fn test_unprefix_foreign_name_unchanged() {
        let backend = backend_with_prefix(Some("db"));
        // A name that never carried this backend's prefix passes through.
        assert_eq!(backend.unprefix("other_tool"), "other_tool");
        // "db" alone, without the separator, is not a prefixed name.
        assert_eq!(backend.unprefix("dbquery"), "dbquery");
    }

    #[tokio::test]
    async fn test_new_backend_is_disconnected() {
        let backend = backend_with_prefix(None);
        assert_eq!(backend.status().await, BackendStatus::Disconnected);
        assert!(backend.tools().await.is_empty());
        assert!(backend.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_send_request_when_disconnected() {
        let backend = backend_with_prefix(None);
        let result = backend.send_request("ping", None, None).await;
        assert!(matches!(result, Err(GatewayError::Unavailable { .. })));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("search_*", "search_repositories"));
        assert!(!glob_match("search_*", "delete_repo"));
        assert!(glob_match("foo?bar", "fooXbar"));
        assert!(!glob_match("foo?bar", "fooXXbar"));
        assert!(glob_match("foo*bar", "fooXXXbar"));
    }

    #[test]
    fn test_tool_allowed_blocklist_wins() {
        let mut config = BackendConfig::stdio("srv", "cat", &[]);
        config.allowed_tools = Some(vec!["*".to_string()]);
        config.blocked_tools = Some(vec!["delete_*".to_string()]);
        let (backend, _rx) = Backend::new(config).unwrap();

        assert!(backend.tool_allowed("search_code"));
        assert!(!backend.tool_allowed("delete_repo"));
    }
}
