//! Upstream JSON-RPC method dispatch.
//!
//! One handler serves every upstream transport. Requests carry an `id` and
//! get exactly one response with that same id; notifications get none.
//! `tools/list` returns the meta-tool surface; backend tools are reached
//! through `search_tools`/`call_backend_tool` or a direct `tools/call` with
//! the public name.

use std::sync::Arc;

use serde_json::Value;

use crate::config::GatewayInfo;
use crate::context::delta::DeltaResponseManager;
use crate::context::session::ContentKind;
use crate::context::tracker::Category;
use crate::context::estimate_tokens;
use crate::error::{GatewayError, GatewayResult, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, text_content};
use crate::router::{
    AggregationRouter, META_CALL_TOOL, META_CONTEXT_STATUS, META_DESCRIBE_TOOL, META_EXECUTE_CODE,
    META_LIST_BACKENDS, META_SEARCH_TOOLS,
};
use crate::sandbox::planner::QueryPlanner;
use crate::sandbox::{CodeExecutor, ExecuteRequest};

use super::session::{SessionManager, UpstreamSession};

/// Upstream protocol handler.
pub struct GatewayHandler {
    info: GatewayInfo,
    router: Arc<AggregationRouter>,
    sessions: Arc<SessionManager>,
    executor: Arc<CodeExecutor>,
    planner: QueryPlanner,
}

impl GatewayHandler {
    #[must_use]
    pub fn new(
        info: GatewayInfo,
        router: Arc<AggregationRouter>,
        sessions: Arc<SessionManager>,
        executor: Arc<CodeExecutor>,
    ) -> Self {
        Self { info, router, sessions, executor, planner: QueryPlanner::new() }
    }

    /// The session registry, shared with the serving shims.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The aggregation router.
    #[must_use]
    pub const fn router(&self) -> &Arc<AggregationRouter> {
        &self.router
    }

    /// Dispatch one upstream frame. Returns `None` for notifications.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        session: &Arc<UpstreamSession>,
    ) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            self.handle_notification(&request, session).await;
            return None;
        }

        let id = request.id.clone();
        tracing::debug!(session = %session.id, method = %request.method, "Upstream request");

        let response = match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize(&request.params, session).await),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => Ok(serde_json::json!({ "tools": self.router.meta_tools() })),
            "tools/call" => self.handle_tools_call(&request.params, session).await,
            "resources/list" => {
                let resources: Vec<Value> = self
                    .router
                    .supervisor()
                    .all_resources()
                    .await
                    .into_iter()
                    .map(|(_, r)| serde_json::to_value(r).unwrap_or(Value::Null))
                    .collect();
                Ok(serde_json::json!({ "resources": resources }))
            }
            "resources/read" => match request.params.get("uri").and_then(Value::as_str) {
                Some(uri) => self.router.supervisor().read_resource(uri).await,
                None => Err(invalid_params("Missing 'uri' parameter")),
            },
            "prompts/list" => {
                let prompts: Vec<Value> = self
                    .router
                    .supervisor()
                    .all_prompts()
                    .await
                    .into_iter()
                    .map(|(_, p)| serde_json::to_value(p).unwrap_or(Value::Null))
                    .collect();
                Ok(serde_json::json!({ "prompts": prompts }))
            }
            "prompts/get" => match request.params.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let arguments =
                        request.params.get("arguments").cloned().unwrap_or(Value::Null);
                    self.router.supervisor().get_prompt(name, arguments).await
                }
                None => Err(invalid_params("Missing 'name' parameter")),
            },
            other => {
                return Some(JsonRpcResponse::error(
                    id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                ));
            }
        };

        Some(match response {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, e.code(), e.to_string()),
        })
    }

    async fn handle_notification(&self, request: &JsonRpcRequest, session: &Arc<UpstreamSession>) {
        match request.method.as_str() {
            "notifications/initialized" | "initialized" => {
                session.state().await.initialized = true;
                tracing::debug!(session = %session.id, "Session initialized");
            }
            "notifications/cancelled" => {
                // Best-effort: the in-flight request keeps running.
                tracing::debug!(
                    session = %session.id,
                    request_id = %request.params.get("requestId").map(serde_json::Value::to_string).unwrap_or_default(),
                    "Upstream cancelled a request"
                );
            }
            other => {
                tracing::debug!(session = %session.id, method = other, "Ignoring notification");
            }
        }
    }

    async fn handle_initialize(&self, params: &Value, session: &Arc<UpstreamSession>) -> Value {
        let client_info = params.get("clientInfo").cloned();
        let protocol = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        tracing::info!(
            session = %session.id,
            protocol,
            client = %client_info.as_ref().and_then(|c| c.get("name")).and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Upstream initialize"
        );
        session.state().await.client_info = client_info;

        let supervisor = self.router.supervisor();
        let mut capabilities = serde_json::json!({
            "tools": { "listChanged": true }
        });
        if !supervisor.all_resources().await.is_empty() {
            capabilities["resources"] = serde_json::json!({ "listChanged": true });
        }
        if !supervisor.all_prompts().await.is_empty() {
            capabilities["prompts"] = serde_json::json!({ "listChanged": true });
        }

        serde_json::json!({
            "protocolVersion": protocol,
            "capabilities": capabilities,
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version
            }
        })
    }

    async fn handle_tools_call(
        &self,
        params: &Value,
        session: &Arc<UpstreamSession>,
    ) -> GatewayResult<Value> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Err(invalid_params("Missing 'name' parameter"));
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));

        match name {
            META_SEARCH_TOOLS => self.meta_search_tools(&arguments).await,
            META_DESCRIBE_TOOL => self.meta_describe_tool(&arguments, session).await,
            META_CALL_TOOL => self.meta_call_tool(&arguments, session).await,
            META_EXECUTE_CODE => self.meta_execute_code(&arguments, session).await,
            META_LIST_BACKENDS => self.meta_list_backends().await,
            META_CONTEXT_STATUS => self.meta_context_status(session).await,
            _ => {
                let result = self.router.supervisor().call_tool(name, arguments).await?;
                Ok(envelope(&result)?)
            }
        }
    }

    async fn meta_search_tools(&self, arguments: &Value) -> GatewayResult<Value> {
        let Some(query) = arguments.get("query").and_then(Value::as_str) else {
            return Err(invalid_params("Missing 'query' parameter"));
        };
        let backend = arguments.get("backend").and_then(Value::as_str);
        let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;

        let matches = self.router.search_tools(query, backend, limit).await;
        let total = matches.len();
        let body = serde_json::json!({
            "tools": matches,
            "total": total,
        });
        Ok(text_content(serde_json::to_string(&body)?))
    }

    async fn meta_describe_tool(
        &self,
        arguments: &Value,
        session: &Arc<UpstreamSession>,
    ) -> GatewayResult<Value> {
        let Some(name) = arguments.get("name").and_then(Value::as_str) else {
            return Err(invalid_params("Missing 'name' parameter"));
        };

        let mut state = session.state().await;
        let mut sent = std::mem::take(&mut state.schemas_sent);
        let described = self.router.describe_tool(name, &mut sent).await;
        state.schemas_sent = sent;
        let described = described?;

        let json = serde_json::to_string(&described)?;
        state.tracker.ingest(Category::Schemas, estimate_tokens(&json), None);
        Ok(text_content(json))
    }

    async fn meta_call_tool(
        &self,
        arguments: &Value,
        session: &Arc<UpstreamSession>,
    ) -> GatewayResult<Value> {
        let Some(name) = arguments.get("name").and_then(Value::as_str) else {
            return Err(invalid_params("Missing 'name' parameter"));
        };
        let call_args = arguments.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));

        let raw = self.router.call_filtered(name, call_args.clone()).await?;
        let json = serde_json::to_string(&raw)?;

        let mut state = session.state().await;
        state.tracker.ingest(Category::Results, estimate_tokens(&json), Some(name));

        // Exact redelivery within the recall window becomes a reference.
        let optimized = state.context.get_optimized(ContentKind::Result, name, &json);
        if optimized != json {
            return Ok(text_content(optimized));
        }

        // Otherwise diff against the last payload for this query.
        let key = DeltaResponseManager::cache_key(name, &call_args);
        let body = match &raw {
            Value::Array(items) => {
                let id_field = infer_id_field(items);
                state.deltas.get_delta_for_array(&key, &raw, id_field).await
            }
            Value::Object(_) => state.deltas.get_delta_for_object(&key, &raw).await,
            _ => raw.clone(),
        };
        Ok(text_content(serde_json::to_string(&body)?))
    }

    async fn meta_execute_code(
        &self,
        arguments: &Value,
        session: &Arc<UpstreamSession>,
    ) -> GatewayResult<Value> {
        let request: ExecuteRequest = serde_json::from_value(arguments.clone())
            .map_err(|e| invalid_params(format!("Invalid execute_code arguments: {e}")))?;
        if request.code.is_empty() {
            return Err(invalid_params("Missing 'code' parameter"));
        }

        let plan = self.planner.analyze(&request.code);
        session
            .state()
            .await
            .tracker
            .ingest(Category::Code, estimate_tokens(&request.code), None);

        let result = self.executor.execute(request).await;

        let mut body = serde_json::to_value(&result)?;
        body["plan"] = serde_json::to_value(&plan)?;
        Ok(text_content(serde_json::to_string(&body)?))
    }

    async fn meta_list_backends(&self) -> GatewayResult<Value> {
        let reports = self.router.supervisor().reports().await;
        let total = reports.len();
        let body = serde_json::json!({
            "backends": reports,
            "total": total,
        });
        Ok(text_content(serde_json::to_string(&body)?))
    }

    async fn meta_context_status(&self, session: &Arc<UpstreamSession>) -> GatewayResult<Value> {
        let state = session.state().await;
        let status = state.tracker.status();
        let body = serde_json::json!({
            "session": session.id,
            "context": status,
            "suggestedBudget": state.tracker.suggested_budget(),
            "dedup": state.context.stats(),
        });
        Ok(text_content(serde_json::to_string(&body)?))
    }
}

impl std::fmt::Debug for GatewayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHandler").field("gateway", &self.info.name).finish_non_exhaustive()
    }
}

fn invalid_params(message: impl Into<String>) -> GatewayError {
    GatewayError::Rpc { code: INVALID_PARAMS, message: message.into() }
}

/// Wrap a backend result in the MCP text envelope, unless the backend
/// already answered with a content envelope of its own.
fn envelope(result: &Value) -> GatewayResult<Value> {
    if result.get("content").is_some_and(Value::is_array) {
        return Ok(result.clone());
    }
    Ok(text_content(serde_json::to_string(result)?))
}

/// Arrays of objects that all carry an `id` field diff by id; everything
/// else diffs positionally.
fn infer_id_field(items: &[Value]) -> Option<&'static str> {
    let all_have_id =
        !items.is_empty() && items.iter().all(|item| item.get("id").is_some());
    all_have_id.then_some("id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::supervisor::BackendSupervisor;
    use crate::config::GatewayLimits;
    use crate::sandbox::gate::ExecutionGate;

    fn handler() -> (GatewayHandler, Arc<SessionManager>) {
        let supervisor = BackendSupervisor::new();
        let router =
            Arc::new(AggregationRouter::new(supervisor.clone(), ExecutionGate::allow_all()));
        let sessions = Arc::new(SessionManager::new(GatewayLimits::default()));
        let executor = Arc::new(CodeExecutor::new(supervisor, ExecutionGate::allow_all()));
        let handler =
            GatewayHandler::new(GatewayInfo::default(), router, Arc::clone(&sessions), executor);
        (handler, sessions)
    }

    async fn roundtrip(handler: &GatewayHandler, sessions: &Arc<SessionManager>, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let session = sessions.get_or_create(Some("test")).await;
        handler.handle(request, &session).await
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            1,
            "initialize",
            Some(serde_json::json!({"clientInfo": {"name": "client"}, "protocolVersion": "2024-11-05"})),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "mcp-gateway");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);

        let session = sessions.get("test").await.unwrap();
        assert_eq!(session.state().await.client_info.as_ref().unwrap()["name"], "client");
    }

    #[tokio::test]
    async fn test_ping_returns_empty_object() {
        let (handler, sessions) = handler();
        let response =
            roundtrip(&handler, &sessions, JsonRpcRequest::request(2, "ping", None)).await.unwrap();
        assert_eq!(response.result.unwrap(), serde_json::json!({}));
        assert_eq!(response.numeric_id(), Some(2));
    }

    #[tokio::test]
    async fn test_tools_list_returns_meta_surface() {
        let (handler, sessions) = handler();
        let response = roundtrip(&handler, &sessions, JsonRpcRequest::request(3, "tools/list", None))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"search_tools"));
        assert!(names.contains(&"call_backend_tool"));
        assert!(names.contains(&"execute_code"));
        // Backend tools never appear in the list directly.
        assert_eq!(tools.len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (handler, sessions) = handler();
        let response =
            roundtrip(&handler, &sessions, JsonRpcRequest::request(4, "bogus/method", None))
                .await
                .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool_call() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            5,
            "tools/call",
            Some(serde_json::json!({"name": "ghost", "arguments": {}})),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(roundtrip(&handler, &sessions, request).await.is_none());

        let session = sessions.get("test").await.unwrap();
        assert!(session.state().await.initialized);
    }

    #[tokio::test]
    async fn test_search_tools_requires_query() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            6,
            "tools/call",
            Some(serde_json::json!({"name": "search_tools", "arguments": {}})),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_execute_code_meta_tool() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            7,
            "tools/call",
            Some(serde_json::json!({
                "name": "execute_code",
                "arguments": {"code": "log(\"hi\"); 41 + 1"}
            })),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["returnValue"], 42);
        assert_eq!(body["output"][0], "hi");
        assert!(body["plan"].is_array());
    }

    #[tokio::test]
    async fn test_context_status_meta_tool() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            8,
            "tools/call",
            Some(serde_json::json!({"name": "context_status", "arguments": {}})),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        let text = response.result.unwrap()["content"][0]["text"].as_str().unwrap().to_string();
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["session"], "test");
        assert_eq!(body["context"]["warningLevel"], "none");
    }

    #[tokio::test]
    async fn test_list_backends_meta_tool_empty() {
        let (handler, sessions) = handler();
        let request = JsonRpcRequest::request(
            9,
            "tools/call",
            Some(serde_json::json!({"name": "list_backends", "arguments": {}})),
        );
        let response = roundtrip(&handler, &sessions, request).await.unwrap();
        let text = response.result.unwrap()["content"][0]["text"].as_str().unwrap().to_string();
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["total"], 0);
    }

    #[test]
    fn test_envelope_passthrough_and_wrap() {
        let already = serde_json::json!({"content": [{"type": "text", "text": "x"}]});
        assert_eq!(envelope(&already).unwrap(), already);

        let raw = serde_json::json!({"ok": true});
        let wrapped = envelope(&raw).unwrap();
        assert_eq!(wrapped["content"][0]["type"], "text");
        assert_eq!(wrapped["content"][0]["text"], r#"{"ok":true}"#);
    }

    #[test]
    fn test_infer_id_field() {
        let with_ids = vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})];
        assert_eq!(infer_id_field(&with_ids), Some("id"));

        let without = vec![serde_json::json!({"id": 1}), serde_json::json!({"x": 2})];
        assert_eq!(infer_id_field(&without), None);
        assert_eq!(infer_id_field(&[]), None);
    }
}
