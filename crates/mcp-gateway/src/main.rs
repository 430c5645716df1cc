//! MCP Gateway - Entry Point
//!
//! Provides both stdio and HTTP upstream transports over the same handler.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_gateway::config::GatewayConfig;
use mcp_gateway::router::AggregationRouter;
use mcp_gateway::sandbox::gate::ExecutionGate;
use mcp_gateway::server::{SessionManager, handler::GatewayHandler, http, stdio};
use mcp_gateway::{BackendSupervisor, CodeExecutor};

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway")]
#[command(about = "Aggregating gateway for MCP backend servers")]
#[command(version)]
struct Cli {
    /// Path to the gateway config file (falls back to .mcp-gateway/gateway.json)
    #[arg(long, env = "MCP_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Transport mode: stdio or http
    #[arg(long, default_value = "stdio")]
    transport: Transport,

    /// HTTP server port (only used with --transport http)
    #[arg(long, default_value = "8000", env = "PORT")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum Transport {
    /// Standard input/output (one upstream session)
    #[default]
    Stdio,
    /// HTTP POST endpoint with header-based sessions
    Http,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        // Logs go to stderr; stdout may carry the MCP frames.
        subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cli.transport,
        "Starting MCP gateway"
    );

    let config = GatewayConfig::load(cli.config.as_deref()).await?;
    let gate = ExecutionGate::from_env();
    if gate.is_restricted() {
        tracing::info!("Code-execution tool allowlist active");
    }

    let supervisor = BackendSupervisor::new();
    for backend in config.servers.clone() {
        let id = backend.id.clone();
        if let Err(e) = supervisor.add(backend).await {
            tracing::error!(backend = %id, error = %e, "Skipping backend");
        }
    }

    let router = Arc::new(AggregationRouter::new(supervisor.clone(), gate.clone()));
    let sessions = Arc::new(SessionManager::new(config.gateway.limits.clone()));
    sessions.start_gc_task();
    let executor = Arc::new(CodeExecutor::new(supervisor.clone(), gate));
    let handler = Arc::new(GatewayHandler::new(
        config.gateway.clone(),
        router,
        Arc::clone(&sessions),
        executor,
    ));

    let served = match cli.transport {
        Transport::Stdio => stdio::run_stdio(handler).await,
        Transport::Http => {
            tracing::info!(port = cli.port, "Running in HTTP mode");
            http::run_http(handler, cli.port).await
        }
    };

    supervisor.shutdown().await;
    tracing::info!("Gateway shut down");
    served
}
