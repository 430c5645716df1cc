//! Error types for the MCP gateway.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! Each variant corresponds to one failure kind the gateway distinguishes; `code()`
//! maps a variant to the JSON-RPC error code reported upstream.

use std::time::Duration;

/// JSON-RPC error code for a malformed frame.
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC error code for an unknown method or route.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC error code for invalid parameters.
pub const INVALID_PARAMS: i32 = -32602;
/// JSON-RPC error code for internal failures.
pub const INTERNAL_ERROR: i32 = -32603;

/// Errors raised anywhere between the upstream handler and a backend transport.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Invalid backend configuration. Fatal at construction; never retried.
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// Transport-level failure (pipe, socket, non-2xx HTTP, truncated stream).
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the I/O failure
        message: String,
    },

    /// HTTP transport error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP middleware error.
    #[error("Middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Protocol violation: malformed JSON, missing result, handshake failure.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the violation
        message: String,
    },

    /// The peer answered a request with a JSON-RPC error object.
    #[error("Backend error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code from the peer
        code: i32,
        /// Error message from the peer
        message: String,
    },

    /// Request exceeded its effective timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend disconnected while the request was pending or queued.
    #[error("Backend disconnected")]
    Disconnected,

    /// No backend owns the requested tool/resource/prompt name.
    #[error("Unknown {kind}: {name}")]
    Route {
        /// "tool", "resource" or "prompt"
        kind: &'static str,
        /// The public name that failed to resolve
        name: String,
    },

    /// The owning backend is known but not currently connected.
    #[error("Backend not connected: {backend}")]
    Unavailable {
        /// Backend id
        backend: String,
    },

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tool call was refused by the code-execution allowlist gate.
    #[error("Tool not allowed by execution policy: {tool}")]
    NotAllowed {
        /// The refused public tool name
        tool: String,
    },
}

impl GatewayError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a route error for an unknown tool.
    #[must_use]
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::Route { kind: "tool", name: name.into() }
    }

    /// Create a route error for an unknown resource.
    #[must_use]
    pub fn unknown_resource(name: impl Into<String>) -> Self {
        Self::Route { kind: "resource", name: name.into() }
    }

    /// Create a route error for an unknown prompt.
    #[must_use]
    pub fn unknown_prompt(name: impl Into<String>) -> Self {
        Self::Route { kind: "prompt", name: name.into() }
    }

    /// Create an unavailable error.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>) -> Self {
        Self::Unavailable { backend: backend.into() }
    }

    /// The JSON-RPC error code reported to the upstream caller.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Route { .. } => METHOD_NOT_FOUND,
            Self::Config { .. } => INVALID_PARAMS,
            Self::Rpc { code, .. } => *code,
            _ => INTERNAL_ERROR,
        }
    }

    /// Returns true if retrying the request could succeed.
    ///
    /// Route, config, and protocol errors are permanent; transport and
    /// timeout errors may clear on a later attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Http(_) | Self::Middleware(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::unknown_tool("nope").code(), METHOD_NOT_FOUND);
        assert_eq!(GatewayError::unavailable("srv1").code(), INTERNAL_ERROR);
        assert_eq!(GatewayError::Disconnected.code(), INTERNAL_ERROR);
        assert_eq!(GatewayError::config("bad transport").code(), INVALID_PARAMS);
        assert_eq!(GatewayError::Rpc { code: -32000, message: "x".into() }.code(), -32000);
    }

    #[test]
    fn test_error_retryable() {
        assert!(GatewayError::transport("pipe closed").is_retryable());
        assert!(GatewayError::Timeout(Duration::from_secs(30)).is_retryable());

        assert!(!GatewayError::unknown_tool("nope").is_retryable());
        assert!(!GatewayError::config("missing url").is_retryable());
        assert!(!GatewayError::protocol("bad frame").is_retryable());
        assert!(!GatewayError::Disconnected.is_retryable());
    }

    #[test]
    fn test_route_error_display() {
        let err = GatewayError::unknown_tool("db_query");
        assert_eq!(err.to_string(), "Unknown tool: db_query");
    }
}
