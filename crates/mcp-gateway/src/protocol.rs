//! MCP wire types.
//!
//! JSON-RPC 2.0 frames plus the tool/resource/prompt shapes exchanged with
//! backends and upstream clients. The gateway speaks protocol version
//! `2024-11-05` on both sides.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version spoken by the gateway.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    const VERSION: &'static str = "2.0";

    /// Build a request with a numeric id.
    #[must_use]
    pub fn request(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            method: method.into(),
            params: params.unwrap_or(Value::Null),
            id: Some(Value::from(id)),
        }
    }

    /// Build a notification (no id, no response expected).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            method: method.into(),
            params: params.unwrap_or(Value::Null),
            id: None,
        }
    }

    /// Whether this frame is a notification.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The numeric id, when one is present and numeric.
    #[must_use]
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    const VERSION: &'static str = "2.0";

    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: Cow::Borrowed(Self::VERSION), result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(Self::VERSION),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }

    /// The numeric id, when one is present and numeric.
    #[must_use]
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }
}

/// Capabilities advertised by a backend peer during `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

impl PeerCapabilities {
    #[must_use]
    pub const fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    #[must_use]
    pub const fn has_resources(&self) -> bool {
        self.resources.is_some()
    }

    #[must_use]
    pub const fn has_prompts(&self) -> bool {
        self.prompts.is_some()
    }
}

/// A tool advertised by a backend. `name` holds the *public* (prefixed)
/// name once loaded into the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A resource advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Server-originated notifications the gateway reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotification {
    ToolsListChanged,
    ResourcesListChanged,
    PromptsListChanged,
    /// `notifications/message` log forwarding.
    Message {
        level: String,
        data: String,
    },
    /// `notifications/cancelled` for an in-flight request.
    Cancelled {
        request_id: String,
    },
    /// Anything else with a `notifications/` method.
    Other {
        method: String,
    },
}

/// Classify a server-originated notification by method name.
///
/// Frames with an `id` are responses, not notifications; callers dispatch
/// on `id` presence before reaching here.
#[must_use]
pub fn parse_notification(method: &str, params: &Value) -> ServerNotification {
    match method {
        "notifications/tools/list_changed" => ServerNotification::ToolsListChanged,
        "notifications/resources/list_changed" => ServerNotification::ResourcesListChanged,
        "notifications/prompts/list_changed" => ServerNotification::PromptsListChanged,
        "notifications/message" => ServerNotification::Message {
            level: params
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_string(),
            data: params.get("data").map(Value::to_string).unwrap_or_default(),
        },
        "notifications/cancelled" => ServerNotification::Cancelled {
            request_id: params
                .get("requestId")
                .map(Value::to_string)
                .unwrap_or_default(),
        },
        other => ServerNotification::Other { method: other.to_string() },
    }
}

/// Wrap a tool result in the MCP content envelope:
/// `{content: [{type: "text", text: <json>}]}`.
#[must_use]
pub fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!({
        "content": [{
            "type": "text",
            "text": text.into()
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = JsonRpcRequest::request(7, "tools/call", Some(serde_json::json!({"name": "echo"})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":7"#));

        let parsed: JsonRpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.numeric_id(), Some(7));
        assert_eq!(parsed.method, "tools/call");
        assert!(!parsed.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let notif = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(notif.is_notification());

        let json = serde_json::to_string(&notif).unwrap();
        assert!(!json.contains("id"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_response_error_shape() {
        let resp = JsonRpcResponse::error(Some(Value::from(3)), -32601, "Method not found: nope");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_parse_list_changed() {
        let n = parse_notification("notifications/tools/list_changed", &Value::Null);
        assert_eq!(n, ServerNotification::ToolsListChanged);

        let n = parse_notification("notifications/resources/list_changed", &Value::Null);
        assert_eq!(n, ServerNotification::ResourcesListChanged);
    }

    #[test]
    fn test_parse_cancelled() {
        let params = serde_json::json!({"requestId": 12, "reason": "user"});
        let n = parse_notification("notifications/cancelled", &params);
        assert_eq!(n, ServerNotification::Cancelled { request_id: "12".to_string() });
    }

    #[test]
    fn test_tool_def_rename() {
        let json = serde_json::json!({
            "name": "echo",
            "description": "Echo a message",
            "inputSchema": {"type": "object"}
        });
        let tool: ToolDef = serde_json::from_value(json).unwrap();
        assert_eq!(tool.name, "echo");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_capabilities_default_empty() {
        let caps: PeerCapabilities = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!caps.has_tools());
        assert!(!caps.has_resources());
        assert!(!caps.has_prompts());
    }
}
