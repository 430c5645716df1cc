//! Aggregation router: the thin layer between the upstream handler and the
//! supervisor.
//!
//! Filters disabled tools out of everything served upstream, resolves
//! searches over the merged namespace, deduplicates schemas, and forwards
//! aggregated change events as upstream `list_changed` notifications.
//!
//! Upstream `tools/list` does not return the merged backend tool list; it
//! returns a small fixed set of meta-tools through which backend tools are
//! discovered (`search_tools`) and invoked (`call_backend_tool`). Placing
//! hundreds of backend schemas directly in the list would explode the
//! client's token budget.

use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::backend::supervisor::{BackendSupervisor, ChangeEvent};
use crate::context::schema::SchemaDeduplicator;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{JsonRpcRequest, ToolDef};
use crate::sandbox::gate::ExecutionGate;

/// Meta-tool names exposed upstream.
pub const META_SEARCH_TOOLS: &str = "search_tools";
pub const META_DESCRIBE_TOOL: &str = "describe_tool";
pub const META_CALL_TOOL: &str = "call_backend_tool";
pub const META_EXECUTE_CODE: &str = "execute_code";
pub const META_LIST_BACKENDS: &str = "list_backends";
pub const META_CONTEXT_STATUS: &str = "context_status";

/// Aggregation layer over the supervisor.
pub struct AggregationRouter {
    supervisor: BackendSupervisor,
    schemas: Mutex<SchemaDeduplicator>,
    gate: ExecutionGate,
}

impl AggregationRouter {
    #[must_use]
    pub fn new(supervisor: BackendSupervisor, gate: ExecutionGate) -> Self {
        Self { supervisor, schemas: Mutex::new(SchemaDeduplicator::new()), gate }
    }

    /// The owning supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &BackendSupervisor {
        &self.supervisor
    }

    /// The progressive-disclosure surface returned by upstream `tools/list`.
    #[must_use]
    pub fn meta_tools(&self) -> Vec<ToolDef> {
        vec![
            ToolDef {
                name: META_SEARCH_TOOLS.to_string(),
                description: Some(
                    "Search the aggregated backend tools by keyword. Returns matching tool \
                     names, owning backends, and descriptions. Use describe_tool for schemas."
                        .to_string(),
                ),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Substring matched against tool names and descriptions"},
                        "backend": {"type": "string", "description": "Restrict results to one backend id"},
                        "limit": {"type": "integer", "description": "Maximum results (default 20)"}
                    },
                    "required": ["query"]
                }),
            },
            ToolDef {
                name: META_DESCRIBE_TOOL.to_string(),
                description: Some(
                    "Fetch one tool's full definition including its input schema. Identical \
                     schemas already sent in this conversation come back as a $schemaRef."
                        .to_string(),
                ),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Public tool name"}
                    },
                    "required": ["name"]
                }),
            },
            ToolDef {
                name: META_CALL_TOOL.to_string(),
                description: Some(
                    "Invoke a backend tool by its public name. Repeated identical results are \
                     replaced by references and repeated queries by deltas."
                        .to_string(),
                ),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Public tool name"},
                        "arguments": {"type": "object", "description": "Tool arguments"}
                    },
                    "required": ["name"]
                }),
            },
            ToolDef {
                name: META_EXECUTE_CODE.to_string(),
                description: Some(
                    "Run a short script in a sandbox with every connected backend tool bound \
                     as a callable function. Captured output and the return value come back \
                     with an advisory query plan."
                        .to_string(),
                ),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Script to evaluate"},
                        "timeoutMs": {"type": "integer", "description": "Wall-clock limit in milliseconds (default 30000)"},
                        "maxOutputBytes": {"type": "integer", "description": "Captured output cap (default 102400)"},
                        "context": {"type": "object", "description": "Constants merged into the script scope"}
                    },
                    "required": ["code"]
                }),
            },
            ToolDef {
                name: META_LIST_BACKENDS.to_string(),
                description: Some(
                    "Diagnostic list of configured backends with status, health, and tool \
                     counts. Includes disabled backends."
                        .to_string(),
                ),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            },
            ToolDef {
                name: META_CONTEXT_STATUS.to_string(),
                description: Some(
                    "Report this conversation's token usage, warning level, and dedup savings."
                        .to_string(),
                ),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            },
        ]
    }

    /// Whether a name belongs to the meta-tool surface.
    #[must_use]
    pub fn is_meta_tool(name: &str) -> bool {
        matches!(
            name,
            META_SEARCH_TOOLS
                | META_DESCRIBE_TOOL
                | META_CALL_TOOL
                | META_EXECUTE_CODE
                | META_LIST_BACKENDS
                | META_CONTEXT_STATUS
        )
    }

    /// Aggregated tools minus the disabled set, tagged with backend ids.
    pub async fn serving_tools(&self) -> Vec<(String, ToolDef)> {
        let disabled = self.supervisor.disabled_tools().await;
        self.supervisor
            .all_tools()
            .await
            .into_iter()
            .filter(|(_, tool)| !disabled.contains(&tool.name))
            .collect()
    }

    /// Substring search over served tool names and descriptions; name
    /// matches rank ahead of description-only matches.
    pub async fn search_tools(
        &self,
        query: &str,
        backend: Option<&str>,
        limit: usize,
    ) -> Vec<Value> {
        let needle = query.to_lowercase();
        let mut matches: Vec<(bool, String, ToolDef)> = self
            .serving_tools()
            .await
            .into_iter()
            .filter(|(id, tool)| {
                if backend.is_some_and(|b| b != id) {
                    return false;
                }
                let name_hit = tool.name.to_lowercase().contains(&needle);
                let desc_hit = tool
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle));
                name_hit || desc_hit
            })
            .map(|(id, tool)| {
                let name_hit = tool.name.to_lowercase().contains(&needle);
                (name_hit, id, tool)
            })
            .collect();

        matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.name.cmp(&b.2.name)));
        matches
            .into_iter()
            .take(limit)
            .map(|(_, backend, tool)| {
                serde_json::json!({
                    "name": tool.name,
                    "backend": backend,
                    "description": tool.description,
                })
            })
            .collect()
    }

    /// One tool's full definition; its schema collapses to a `$schemaRef`
    /// when an identical one was already sent in this session.
    pub async fn describe_tool(
        &self,
        name: &str,
        schemas_sent: &mut HashSet<String>,
    ) -> GatewayResult<Value> {
        let tool = self
            .serving_tools()
            .await
            .into_iter()
            .find(|(_, tool)| tool.name == name)
            .ok_or_else(|| GatewayError::unknown_tool(name))?;

        let (backend, tool) = tool;
        let schema = self
            .schemas
            .lock()
            .await
            .get_deduplicated(&tool.name, &tool.input_schema, schemas_sent);

        Ok(serde_json::json!({
            "name": tool.name,
            "backend": backend,
            "description": tool.description,
            "inputSchema": schema,
        }))
    }

    /// Bulk schema registry for the served tools.
    pub async fn schema_registry(&self) -> Value {
        let mut schemas = self.schemas.lock().await;
        let mut names = Vec::new();
        for (_, tool) in self.serving_tools().await {
            schemas.register(&tool.name, &tool.input_schema);
            names.push(tool.name);
        }
        schemas.build_registry(Some(&names))
    }

    /// Invoke a backend tool with the disabled set and the code-execution
    /// allowlist gate applied.
    pub async fn call_filtered(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        if self.supervisor.disabled_tools().await.contains(name) {
            return Err(GatewayError::unknown_tool(name));
        }
        if !self.gate.is_allowed(name) {
            return Err(GatewayError::NotAllowed { tool: name.to_string() });
        }
        self.supervisor.call_tool(name, arguments).await
    }

    /// Forward aggregated change events to an upstream notification sink as
    /// MCP `list_changed` notifications. Forwarded on every change, not
    /// debounced.
    pub fn spawn_change_forwarder(&self, tx: mpsc::UnboundedSender<JsonRpcRequest>) {
        let mut changes = self.supervisor.subscribe_changes();
        tokio::spawn(async move {
            while let Ok(event) = changes.recv().await {
                let method = match event {
                    ChangeEvent::ToolsChanged => "notifications/tools/list_changed",
                    ChangeEvent::ResourcesChanged => "notifications/resources/list_changed",
                    ChangeEvent::PromptsChanged => "notifications/prompts/list_changed",
                };
                if tx.send(JsonRpcRequest::notification(method, None)).is_err() {
                    break;
                }
            }
        });
    }
}

impl std::fmt::Debug for AggregationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationRouter").finish_non_exhaustive()
    }
}
