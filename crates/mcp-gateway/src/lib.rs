//! MCP Gateway
//!
//! An aggregating gateway for the Model Context Protocol. It holds
//! persistent sessions to many backend MCP servers — child processes over
//! line-delimited JSON, HTTP POST endpoints (with SSE response streaming),
//! and SSE-handshake servers — merges their tools, resources, and prompts
//! into one prefixed namespace, and exposes the union upstream as a single
//! MCP endpoint with progressive tool disclosure, response dedup/deltas, and
//! a sandboxed snippet executor bound to the same tool namespace.
//!
//! # Example
//!
//! ```no_run
//! use mcp_gateway::backend::supervisor::BackendSupervisor;
//! use mcp_gateway::config::BackendConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let supervisor = BackendSupervisor::new();
//!     supervisor
//!         .add(BackendConfig::stdio("files", "npx", &["-y", "@modelcontextprotocol/server-filesystem"]))
//!         .await?;
//!
//!     let result = supervisor.call_tool("list_files", serde_json::json!({"path": "."})).await?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod router;
pub mod sandbox;
pub mod server;
pub mod transport;

pub use backend::supervisor::BackendSupervisor;
pub use config::{BackendConfig, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use router::AggregationRouter;
pub use sandbox::CodeExecutor;
pub use server::GatewayHandler;
