//! Configuration for the MCP gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Gateway-wide defaults.
pub mod defaults {
    use std::time::Duration;

    /// Per-request timeout when a backend config does not override it.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Request-level retry attempts for transports that support them.
    pub const MAX_RETRIES: u32 = 3;

    /// Per-backend in-flight request cap.
    pub const MAX_CONCURRENT: usize = 10;

    /// SSE handshake must deliver the endpoint event within this window.
    pub const SSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Grace period for a child process to exit before it is killed.
    pub const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    /// Reconnect backoff base delay.
    pub const RECONNECT_BASE_MS: u64 = 1_000;

    /// Reconnect backoff ceiling.
    pub const RECONNECT_MAX_MS: u64 = 30_000;

    /// Upstream sessions idle longer than this are swept.
    pub const SESSION_MAX_AGE: Duration = Duration::from_secs(3_600);

    /// Recall window for session-level content dedup.
    pub const DEDUP_WINDOW: Duration = Duration::from_secs(30 * 60);

    /// Context tracker token limit.
    pub const CONTEXT_LIMIT: u64 = 200_000;

    /// Delta cache capacity.
    pub const DELTA_CACHE_MAX: u64 = 500;

    /// Delta cache entry max age.
    pub const DELTA_CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

    /// Sandbox wall-clock timeout.
    pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

    /// Sandbox captured-output cap in bytes.
    pub const EXEC_MAX_OUTPUT: usize = 100 * 1024;
}

/// Transport descriptor for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportConfig {
    /// Spawn a child process and speak newline-delimited JSON-RPC on stdio.
    #[serde(rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// POST JSON-RPC to a URL; responses may be JSON or an SSE stream.
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// GET an SSE stream, wait for the `endpoint` event, then POST there.
    #[serde(rename_all = "camelCase")]
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short label for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }
}

/// Configuration for one backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique id, used as the routing key.
    pub id: String,

    /// Disabled backends are constructed but not served upstream.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Transport descriptor.
    pub transport: TransportConfig,

    /// Prefix prepended (with `_`) to every tool name from this backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_prefix: Option<String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Request-level retry attempts (HTTP transports).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// In-flight request cap.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Glob patterns of tools to expose; empty means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    /// Glob patterns of tools to hide; wins over `allowed_tools`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_tools: Option<Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    defaults::REQUEST_TIMEOUT.as_millis() as u64
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_max_concurrent() -> usize {
    defaults::MAX_CONCURRENT
}

impl BackendConfig {
    /// Minimal stdio backend config, used heavily by tests.
    #[must_use]
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: args.iter().map(ToString::to_string).collect(),
                cwd: None,
                env: HashMap::new(),
            },
            tool_prefix: None,
            request_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            max_concurrent: default_max_concurrent(),
            allowed_tools: None,
            blocked_tools: None,
        }
    }

    /// Minimal HTTP backend config.
    #[must_use]
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            transport: TransportConfig::Http { url: url.into(), headers: HashMap::new() },
            tool_prefix: None,
            request_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            max_concurrent: default_max_concurrent(),
            allowed_tools: None,
            blocked_tools: None,
        }
    }

    /// Set the tool prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tool_prefix = Some(prefix.into());
        self
    }

    /// Effective per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate fields that cannot be checked by serde alone.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.is_empty() {
            return Err(GatewayError::config("backend id must not be empty"));
        }
        if self.max_concurrent == 0 {
            return Err(GatewayError::config(format!(
                "backend '{}': maxConcurrent must be at least 1",
                self.id
            )));
        }
        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.is_empty() => Err(
                GatewayError::config(format!("backend '{}': command must not be empty", self.id)),
            ),
            TransportConfig::Http { url, .. } | TransportConfig::Sse { url, .. }
                if url::Url::parse(url).is_err() =>
            {
                Err(GatewayError::config(format!("backend '{}': invalid url '{url}'", self.id)))
            }
            _ => Ok(()),
        }
    }
}

/// Limits applied across the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayLimits {
    /// Context tracker token limit per upstream session.
    pub context_tokens: u64,
    /// Upstream session idle timeout in seconds.
    pub session_max_age_secs: u64,
    /// Sandbox wall-clock timeout in milliseconds.
    pub exec_timeout_ms: u64,
    /// Sandbox output cap in bytes.
    pub exec_max_output_bytes: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            context_tokens: defaults::CONTEXT_LIMIT,
            session_max_age_secs: defaults::SESSION_MAX_AGE.as_secs(),
            exec_timeout_ms: defaults::EXEC_TIMEOUT.as_millis() as u64,
            exec_max_output_bytes: defaults::EXEC_MAX_OUTPUT,
        }
    }
}

/// Identity block of the gateway config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    #[serde(default = "default_gateway_name")]
    pub name: String,
    #[serde(default = "default_gateway_version")]
    pub version: String,
    #[serde(default)]
    pub limits: GatewayLimits,
}

fn default_gateway_name() -> String {
    "mcp-gateway".to_string()
}

fn default_gateway_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for GatewayInfo {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            version: default_gateway_version(),
            limits: GatewayLimits::default(),
        }
    }
}

/// Top-level configuration: `{gateway: {...}, servers: [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewayInfo,
    #[serde(default)]
    pub servers: Vec<BackendConfig>,
}

impl GatewayConfig {
    /// Load from an explicit path, or fall back to the project then user
    /// config (`.mcp-gateway/gateway.json`, `~/.mcp-gateway/gateway.json`).
    ///
    /// Missing files are not an error; the gateway starts empty and backends
    /// can be added at runtime.
    pub async fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let candidates: Vec<PathBuf> = if let Some(p) = path {
            vec![p.to_path_buf()]
        } else {
            let mut paths = Vec::new();
            if let Ok(cwd) = std::env::current_dir() {
                paths.push(cwd.join(".mcp-gateway/gateway.json"));
            }
            if let Some(home) = dirs::home_dir() {
                paths.push(home.join(".mcp-gateway/gateway.json"));
            }
            paths
        };

        for candidate in candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading gateway config");
                let content = tokio::fs::read_to_string(&candidate)
                    .await
                    .map_err(|e| GatewayError::config(format!("read {}: {e}", candidate.display())))?;
                let config: Self = serde_json::from_str(&content)?;
                config.validate()?;
                return Ok(config);
            }
        }

        tracing::debug!("No gateway config file found, starting empty");
        Ok(Self::default())
    }

    /// Validate every backend entry and check id uniqueness.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(GatewayError::config(format!("duplicate backend id '{}'", server.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "gateway": {"name": "gw", "version": "1.0.0"},
            "servers": [
                {
                    "id": "files",
                    "transport": {"type": "stdio", "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem"]},
                    "toolPrefix": "fs"
                },
                {
                    "id": "remote",
                    "transport": {"type": "http", "url": "https://mcp.example.com/rpc"},
                    "maxConcurrent": 4
                }
            ]
        }"#;

        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.gateway.name, "gw");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].tool_prefix.as_deref(), Some("fs"));
        assert_eq!(config.servers[0].transport.kind(), "stdio");
        assert_eq!(config.servers[1].max_concurrent, 4);
        assert!(config.servers[0].enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_applied() {
        let json = r#"{"id": "a", "transport": {"type": "http", "url": "http://localhost:1/mcp"}}"#;
        let backend: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(backend.request_timeout(), defaults::REQUEST_TIMEOUT);
        assert_eq!(backend.max_retries, defaults::MAX_RETRIES);
        assert_eq!(backend.max_concurrent, defaults::MAX_CONCURRENT);
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let backend = BackendConfig::http("bad", "not a url");
        assert!(backend.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = GatewayConfig {
            gateway: GatewayInfo::default(),
            servers: vec![
                BackendConfig::stdio("a", "cat", &[]),
                BackendConfig::stdio("a", "cat", &[]),
            ],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut backend = BackendConfig::stdio("a", "cat", &[]);
        backend.max_concurrent = 0;
        assert!(backend.validate().is_err());
    }
}
