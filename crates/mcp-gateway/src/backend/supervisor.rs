//! Backend supervisor: owns the set of backends, their reconnect policy,
//! and the routing maps from public names to backend ids.
//!
//! All mutation of the backend map, routing maps, and disabled sets happens
//! through the supervisor; handlers observe consistent snapshots. Routing
//! maps are rebuilt wholesale and swapped in one write, so a reader never
//! sees half-old, half-new names.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{BackendConfig, defaults};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{PromptDef, ResourceDef, ServerNotification, ToolDef, parse_notification};
use crate::transport::TransportEvent;

use super::semaphore::InflightSemaphore;
use super::{Backend, BackendStatus};

/// Aggregated capability-change events forwarded to the upstream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    ToolsChanged,
    ResourcesChanged,
    PromptsChanged,
}

/// Name-to-backend routing maps, rebuilt atomically on every change.
#[derive(Debug, Default, Clone)]
pub struct RoutingMaps {
    /// Serving map: tools of connected, non-disabled backends.
    pub tools: HashMap<String, String>,
    /// Diagnostic map: tools of all connected backends, disabled included.
    pub tools_all: HashMap<String, String>,
    /// Resource URIs of connected, non-disabled backends.
    pub resources: HashMap<String, String>,
    /// Prompt names of connected, non-disabled backends.
    pub prompts: HashMap<String, String>,
}

/// Per-backend request statistics for diagnostic surfaces.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BackendHealth {
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}

impl BackendHealth {
    fn record_success(&mut self) {
        self.total_requests += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
    }

    fn record_failure(&mut self) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
    }

    /// Fraction of requests that succeeded; 1.0 when none were made.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        (self.total_requests - self.total_failures) as f64 / self.total_requests as f64
    }
}

/// Diagnostic snapshot of one backend, as served by `list_backends`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendReport {
    pub id: String,
    pub status: BackendStatus,
    pub enabled: bool,
    pub transport: &'static str,
    pub tool_count: usize,
    pub health: BackendHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One tool invocation in a fan-out batch.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Default)]
struct ReconnectState {
    attempt: u32,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    routing: RwLock<RoutingMaps>,
    disabled_backends: RwLock<HashSet<String>>,
    disabled_tools: RwLock<HashSet<String>>,
    reconnect: Mutex<HashMap<String, ReconnectState>>,
    health: RwLock<HashMap<String, BackendHealth>>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Owner of all backend sessions.
#[derive(Clone)]
pub struct BackendSupervisor {
    inner: Arc<Inner>,
}

/// Reconnect delay for the k-th consecutive attempt: `min(1000 * 2^(k-1), 30000)` ms.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(15);
    let millis = defaults::RECONNECT_BASE_MS
        .checked_shl(exp)
        .unwrap_or(u64::MAX)
        .min(defaults::RECONNECT_MAX_MS);
    Duration::from_millis(millis)
}

impl BackendSupervisor {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                backends: RwLock::new(HashMap::new()),
                routing: RwLock::new(RoutingMaps::default()),
                disabled_backends: RwLock::new(HashSet::new()),
                disabled_tools: RwLock::new(HashSet::new()),
                reconnect: Mutex::new(HashMap::new()),
                health: RwLock::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Subscribe to aggregated capability-change events.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// Add a backend and initiate its first connect.
    pub async fn add(&self, config: BackendConfig) -> GatewayResult<()> {
        let id = config.id.clone();
        let enabled = config.enabled;
        {
            let backends = self.inner.backends.read().await;
            if backends.contains_key(&id) {
                return Err(GatewayError::config(format!("backend '{id}' already exists")));
            }
        }

        let (backend, events_rx) = Backend::new(config)?;
        self.inner.backends.write().await.insert(id.clone(), Arc::clone(&backend));
        self.inner.health.write().await.insert(id.clone(), BackendHealth::default());
        if !enabled {
            self.inner.disabled_backends.write().await.insert(id.clone());
        }

        self.spawn_event_pump(Arc::clone(&backend), events_rx);

        // First connect runs in the background; failures feed the reconnect
        // loop like any later drop.
        let supervisor = self.clone();
        let backend_id = id.clone();
        tokio::spawn(async move {
            match backend.connect().await {
                Ok(()) => {
                    supervisor.on_backend_connected(&backend_id).await;
                }
                Err(e) => {
                    tracing::warn!(backend = %backend_id, error = %e, "Initial connect failed");
                    supervisor.schedule_reconnect(&backend_id).await;
                }
            }
        });

        Ok(())
    }

    /// Remove a backend: cancel any reconnect timer, disconnect, drop.
    pub async fn remove(&self, id: &str) -> GatewayResult<()> {
        if let Some(state) = self.inner.reconnect.lock().await.remove(id) {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }

        let backend = self.inner.backends.write().await.remove(id);
        let Some(backend) = backend else {
            return Err(GatewayError::config(format!("unknown backend '{id}'")));
        };
        backend.disconnect().await;
        self.inner.health.write().await.remove(id);
        self.inner.disabled_backends.write().await.remove(id);

        self.recompute_routing().await;
        self.broadcast(ChangeEvent::ToolsChanged);
        tracing::info!(backend = %id, "Backend removed");
        Ok(())
    }

    /// Replace a backend's configuration (remove + add).
    pub async fn update(&self, config: BackendConfig) -> GatewayResult<()> {
        self.remove(&config.id).await?;
        self.add(config).await
    }

    /// Re-enable a disabled backend and reconnect it if needed.
    pub async fn enable_backend(&self, id: &str) -> GatewayResult<()> {
        if !self.inner.backends.read().await.contains_key(id) {
            return Err(GatewayError::config(format!("unknown backend '{id}'")));
        }
        self.inner.disabled_backends.write().await.remove(id);
        self.recompute_routing().await;
        self.broadcast(ChangeEvent::ToolsChanged);

        let backend = self.get(id).await;
        if let Some(backend) = backend {
            if backend.status().await != BackendStatus::Connected {
                self.schedule_reconnect(id).await;
            }
        }
        Ok(())
    }

    /// Disable a backend: its tools leave the serving map but the session
    /// stays up for diagnostics.
    pub async fn disable_backend(&self, id: &str) -> GatewayResult<()> {
        if !self.inner.backends.read().await.contains_key(id) {
            return Err(GatewayError::config(format!("unknown backend '{id}'")));
        }
        self.inner.disabled_backends.write().await.insert(id.to_string());
        self.recompute_routing().await;
        self.broadcast(ChangeEvent::ToolsChanged);
        Ok(())
    }

    /// Hide a single public tool name from upstream serving.
    pub async fn disable_tool(&self, name: &str) {
        self.inner.disabled_tools.write().await.insert(name.to_string());
        self.broadcast(ChangeEvent::ToolsChanged);
    }

    /// Re-expose a previously disabled tool.
    pub async fn enable_tool(&self, name: &str) {
        self.inner.disabled_tools.write().await.remove(name);
        self.broadcast(ChangeEvent::ToolsChanged);
    }

    /// Public tool names currently hidden from upstream serving.
    pub async fn disabled_tools(&self) -> HashSet<String> {
        self.inner.disabled_tools.read().await.clone()
    }

    /// Look up a backend by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.inner.backends.read().await.get(id).cloned()
    }

    /// Snapshot of the routing maps.
    pub async fn routing(&self) -> RoutingMaps {
        self.inner.routing.read().await.clone()
    }

    /// Aggregated tools of connected, non-disabled backends, tagged with
    /// their owning backend id.
    pub async fn all_tools(&self) -> Vec<(String, ToolDef)> {
        let backends = self.inner.backends.read().await;
        let disabled = self.inner.disabled_backends.read().await;
        let mut tools = Vec::new();
        for (id, backend) in backends.iter() {
            if disabled.contains(id) || backend.status().await != BackendStatus::Connected {
                continue;
            }
            for tool in backend.tools().await {
                tools.push((id.clone(), tool));
            }
        }
        tools
    }

    /// Aggregated resources of connected, non-disabled backends.
    pub async fn all_resources(&self) -> Vec<(String, ResourceDef)> {
        let backends = self.inner.backends.read().await;
        let disabled = self.inner.disabled_backends.read().await;
        let mut resources = Vec::new();
        for (id, backend) in backends.iter() {
            if disabled.contains(id) || backend.status().await != BackendStatus::Connected {
                continue;
            }
            for resource in backend.resources().await {
                resources.push((id.clone(), resource));
            }
        }
        resources
    }

    /// Aggregated prompts of connected, non-disabled backends.
    pub async fn all_prompts(&self) -> Vec<(String, PromptDef)> {
        let backends = self.inner.backends.read().await;
        let disabled = self.inner.disabled_backends.read().await;
        let mut prompts = Vec::new();
        for (id, backend) in backends.iter() {
            if disabled.contains(id) || backend.status().await != BackendStatus::Connected {
                continue;
            }
            for prompt in backend.prompts().await {
                prompts.push((id.clone(), prompt));
            }
        }
        prompts
    }

    /// Diagnostic snapshot of every backend, disabled ones included.
    pub async fn reports(&self) -> Vec<BackendReport> {
        let backends = self.inner.backends.read().await;
        let disabled = self.inner.disabled_backends.read().await;
        let health = self.inner.health.read().await;

        let mut reports = Vec::with_capacity(backends.len());
        for (id, backend) in backends.iter() {
            reports.push(BackendReport {
                id: id.clone(),
                status: backend.status().await,
                enabled: !disabled.contains(id),
                transport: backend.config().transport.kind(),
                tool_count: backend.tools().await.len(),
                health: health.get(id).cloned().unwrap_or_default(),
                last_error: backend.last_error().await.map(|e| e.message),
            });
        }
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    /// Route a tool call to its owning backend.
    ///
    /// Unknown names fail with a route error (−32601). Names whose backend
    /// is known but not connected fail with an unavailable error (−32603).
    pub async fn call_tool(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        let backend_id = {
            let routing = self.inner.routing.read().await;
            routing.tools.get(name).cloned()
        };

        let backend = match backend_id {
            Some(id) => self
                .get(&id)
                .await
                .ok_or_else(|| GatewayError::unavailable(&id))?,
            None => {
                // Not in the serving map: distinguish "never heard of it"
                // from "its backend is down right now".
                match self.find_owner_by_snapshot(name).await {
                    Some(backend) => return Err(GatewayError::unavailable(backend.id())),
                    None => return Err(GatewayError::unknown_tool(name)),
                }
            }
        };

        if backend.status().await != BackendStatus::Connected {
            return Err(GatewayError::unavailable(backend.id()));
        }

        let started = Instant::now();
        let result = backend.call_tool(name, arguments).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Metrics/audit contract: one event per tool call.
        tracing::info!(
            target: "mcp_gateway::metrics",
            tool = %name,
            backend = %backend.id(),
            duration_ms,
            success = result.is_ok(),
            "tool call"
        );

        let mut health = self.inner.health.write().await;
        if let Some(entry) = health.get_mut(backend.id()) {
            if result.is_ok() {
                entry.record_success();
            } else {
                entry.record_failure();
            }
        }

        result
    }

    /// Issue every call concurrently; results keep the input order.
    pub async fn call_tools_parallel(&self, calls: Vec<ToolCall>) -> Vec<GatewayResult<Value>> {
        let futures = calls
            .into_iter()
            .map(|call| self.call_tool_owned(call))
            .collect::<Vec<_>>();
        futures::future::join_all(futures).await
    }

    /// Issue calls through a one-off FIFO gate of width `limit`; results
    /// are written at the caller's original index regardless of completion
    /// order.
    pub async fn call_tools_concurrent(
        &self,
        calls: Vec<ToolCall>,
        limit: usize,
    ) -> Vec<GatewayResult<Value>> {
        let gate = Arc::new(InflightSemaphore::new(limit));
        let futures = calls
            .into_iter()
            .map(|call| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await?;
                    let result = self.call_tool_owned(call).await;
                    gate.release();
                    result
                }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(futures).await
    }

    async fn call_tool_owned(&self, call: ToolCall) -> GatewayResult<Value> {
        self.call_tool(&call.name, call.arguments).await
    }

    /// Route a resource read by URI.
    pub async fn read_resource(&self, uri: &str) -> GatewayResult<Value> {
        let backend_id = {
            let routing = self.inner.routing.read().await;
            routing.resources.get(uri).cloned()
        };
        let Some(backend_id) = backend_id else {
            return Err(GatewayError::unknown_resource(uri));
        };
        let backend = self
            .get(&backend_id)
            .await
            .ok_or_else(|| GatewayError::unavailable(&backend_id))?;
        if backend.status().await != BackendStatus::Connected {
            return Err(GatewayError::unavailable(&backend_id));
        }
        backend.read_resource(uri).await
    }

    /// Route a prompt get by public name.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        let backend_id = {
            let routing = self.inner.routing.read().await;
            routing.prompts.get(name).cloned()
        };
        let Some(backend_id) = backend_id else {
            return Err(GatewayError::unknown_prompt(name));
        };
        let backend = self
            .get(&backend_id)
            .await
            .ok_or_else(|| GatewayError::unavailable(&backend_id))?;
        if backend.status().await != BackendStatus::Connected {
            return Err(GatewayError::unavailable(&backend_id));
        }
        backend.get_prompt(name, arguments).await
    }

    /// Disconnect every backend and cancel reconnect timers.
    pub async fn shutdown(&self) {
        for (_, state) in self.inner.reconnect.lock().await.drain() {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }
        let backends: Vec<_> = self.inner.backends.read().await.values().cloned().collect();
        for backend in backends {
            backend.disconnect().await;
        }
        self.recompute_routing().await;
    }

    /// Rebuild all routing maps from backend snapshots and swap them in
    /// one write.
    pub async fn recompute_routing(&self) {
        let backends = self.inner.backends.read().await;
        let disabled = self.inner.disabled_backends.read().await;

        let mut maps = RoutingMaps::default();
        for (id, backend) in backends.iter() {
            if backend.status().await != BackendStatus::Connected {
                continue;
            }
            let is_disabled = disabled.contains(id);
            for tool in backend.tools().await {
                if let Some(previous) =
                    maps.tools_all.insert(tool.name.clone(), id.clone())
                {
                    if previous != *id {
                        tracing::warn!(
                            tool = %tool.name,
                            first = %previous,
                            second = %id,
                            "Duplicate public tool name; last registration wins"
                        );
                    }
                }
                if !is_disabled {
                    maps.tools.insert(tool.name, id.clone());
                }
            }
            if !is_disabled {
                for resource in backend.resources().await {
                    maps.resources.insert(resource.uri, id.clone());
                }
                for prompt in backend.prompts().await {
                    maps.prompts.insert(prompt.name, id.clone());
                }
            }
        }

        *self.inner.routing.write().await = maps;
    }

    /// Find a backend whose (possibly stale) tool snapshot contains `name`.
    async fn find_owner_by_snapshot(&self, name: &str) -> Option<Arc<Backend>> {
        let backends = self.inner.backends.read().await;
        for backend in backends.values() {
            if backend.tools().await.iter().any(|t| t.name == name) {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    fn broadcast(&self, event: ChangeEvent) {
        // No receivers is fine; the upstream layer may not be up yet.
        let _ = self.inner.changes.send(event);
    }

    async fn on_backend_connected(&self, id: &str) {
        self.inner.reconnect.lock().await.remove(id);
        self.recompute_routing().await;
        self.broadcast(ChangeEvent::ToolsChanged);
        self.broadcast(ChangeEvent::ResourcesChanged);
        self.broadcast(ChangeEvent::PromptsChanged);
    }

    async fn on_backend_down(&self, id: &str) {
        self.recompute_routing().await;
        self.broadcast(ChangeEvent::ToolsChanged);

        let enabled = !self.inner.disabled_backends.read().await.contains(id);
        let known = self.inner.backends.read().await.contains_key(id);
        if enabled && known {
            self.schedule_reconnect(id).await;
        }
    }

    /// Schedule a reconnect with exponential backoff. A no-op when the
    /// backend is already connecting/connected or a timer is pending.
    pub async fn schedule_reconnect(&self, id: &str) {
        let Some(backend) = self.get(id).await else { return };

        let mut reconnect = self.inner.reconnect.lock().await;
        let state = reconnect.entry(id.to_string()).or_default();
        if state.timer.is_some() {
            return;
        }
        if matches!(
            backend.status().await,
            BackendStatus::Connecting | BackendStatus::Connected
        ) {
            return;
        }

        state.attempt += 1;
        let delay = backoff_delay(state.attempt);
        tracing::info!(
            backend = %id,
            attempt = state.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let supervisor = self.clone();
        let backend_id = id.to_string();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.try_reconnect(&backend_id).await;
        }));
    }

    async fn try_reconnect(&self, id: &str) {
        if let Some(state) = self.inner.reconnect.lock().await.get_mut(id) {
            state.timer = None;
        }

        let Some(backend) = self.get(id).await else { return };
        if self.inner.disabled_backends.read().await.contains(id) {
            return;
        }

        match backend.connect().await {
            Ok(()) => {
                tracing::info!(backend = %id, "Reconnected");
                self.on_backend_connected(id).await;
            }
            Err(e) => {
                tracing::warn!(backend = %id, error = %e, "Reconnect failed");
                self.schedule_reconnect(id).await;
            }
        }
    }

    /// Attempts recorded for a backend's current reconnect cycle.
    pub async fn reconnect_attempts(&self, id: &str) -> u32 {
        self.inner
            .reconnect
            .lock()
            .await
            .get(id)
            .map_or(0, |state| state.attempt)
    }

    fn spawn_event_pump(
        &self,
        backend: Arc<Backend>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            // Events for one backend are processed serially, so a change
            // notification's reload completes before the next is handled.
            while let Some(event) = events.recv().await {
                let id = backend.id().to_string();
                match event {
                    TransportEvent::Connected => {}
                    TransportEvent::Disconnected => {
                        // Teardown echoes its own event; error state stays
                        // terminal until a reconnect.
                        if matches!(
                            backend.status().await,
                            BackendStatus::Disconnected | BackendStatus::Error
                        ) {
                            continue;
                        }
                        tracing::warn!(backend = %id, "Backend dropped");
                        backend.mark_disconnected().await;
                        supervisor.on_backend_down(&id).await;
                    }
                    TransportEvent::Error(message) => {
                        tracing::warn!(backend = %id, error = %message, "Backend transport error");
                        backend.record_error(&message).await;
                        supervisor.on_backend_down(&id).await;
                    }
                    TransportEvent::Notification { method, params } => {
                        match parse_notification(&method, &params) {
                            ServerNotification::ToolsListChanged => {
                                if let Err(e) = backend.reload_tools().await {
                                    tracing::warn!(backend = %id, error = %e, "Tools reload failed");
                                }
                                supervisor.recompute_routing().await;
                                supervisor.broadcast(ChangeEvent::ToolsChanged);
                            }
                            ServerNotification::ResourcesListChanged => {
                                if let Err(e) = backend.reload_resources().await {
                                    tracing::warn!(backend = %id, error = %e, "Resources reload failed");
                                }
                                supervisor.recompute_routing().await;
                                supervisor.broadcast(ChangeEvent::ResourcesChanged);
                            }
                            ServerNotification::PromptsListChanged => {
                                if let Err(e) = backend.reload_prompts().await {
                                    tracing::warn!(backend = %id, error = %e, "Prompts reload failed");
                                }
                                supervisor.recompute_routing().await;
                                supervisor.broadcast(ChangeEvent::PromptsChanged);
                            }
                            ServerNotification::Message { level, data } => match level.as_str() {
                                "error" => tracing::error!(backend = %id, "{data}"),
                                "warning" => tracing::warn!(backend = %id, "{data}"),
                                _ => tracing::debug!(backend = %id, "{data}"),
                            },
                            ServerNotification::Cancelled { request_id } => {
                                tracing::debug!(backend = %id, request_id, "Peer cancelled request");
                            }
                            ServerNotification::Other { method } => {
                                tracing::debug!(backend = %id, method, "Ignoring notification");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[allow(dead_code)]
fn _diag_assert_send(s: &BackendSupervisor, id: &str) {
    fn assert_send<T: Send>(_: T) {}
    assert_send(s.schedule_reconnect(id));
}

impl Default for BackendSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSupervisor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> =
            (1..=7).map(|i| backoff_delay(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_backoff_large_attempt_saturates() {
        assert_eq!(backoff_delay(100), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_route_error() {
        let supervisor = BackendSupervisor::new();
        let result = supervisor.call_tool("nope", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::Route { .. })));
        assert_eq!(result.unwrap_err().code(), crate::error::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_resource_and_prompt() {
        let supervisor = BackendSupervisor::new();
        assert!(matches!(
            supervisor.read_resource("file:///nope").await,
            Err(GatewayError::Route { kind: "resource", .. })
        ));
        assert!(matches!(
            supervisor.get_prompt("nope", Value::Null).await,
            Err(GatewayError::Route { kind: "prompt", .. })
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_id() {
        let supervisor = BackendSupervisor::new();
        supervisor.add(BackendConfig::stdio("a", "cat", &[])).await.unwrap();
        let result = supervisor.add(BackendConfig::stdio("a", "cat", &[])).await;
        assert!(matches!(result, Err(GatewayError::Config { .. })));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_backend() {
        let supervisor = BackendSupervisor::new();
        assert!(supervisor.remove("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_health_defaults() {
        let health = BackendHealth::default();
        assert!((health.success_rate() - 1.0).abs() < f64::EPSILON);
    }
}
