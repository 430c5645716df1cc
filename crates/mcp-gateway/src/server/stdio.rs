//! Stdio serving shim for upstream MCP traffic.
//!
//! Newline-delimited JSON-RPC on stdin/stdout, one session for the process
//! lifetime. Aggregated change notifications from the backends are written
//! to stdout between responses.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::PARSE_ERROR;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::handler::GatewayHandler;

/// Serve MCP over stdin/stdout until EOF.
pub async fn run_stdio(handler: Arc<GatewayHandler>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    // One session per stdio connection; change events forward as
    // notifications on the same pipe.
    let session = handler.sessions().get_or_create(None).await;
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JsonRpcRequest>();
    handler.router().spawn_change_forwarder(notify_tx);

    tracing::info!(session = %session.id, "Upstream stdio transport ready");

    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                let bytes_read = read?;
                if bytes_read == 0 {
                    tracing::info!("Stdin closed, shutting down");
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                    Ok(request) => request,
                    Err(e) => {
                        let error =
                            JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {e}"));
                        write_frame(&mut stdout, &serde_json::to_string(&error)?).await?;
                        continue;
                    }
                };

                if let Some(response) = handler.handle(request, &session).await {
                    write_frame(&mut stdout, &serde_json::to_string(&response)?).await?;
                }
            }
            Some(notification) = notify_rx.recv() => {
                write_frame(&mut stdout, &serde_json::to_string(&notification)?).await?;
            }
        }
    }

    Ok(())
}

async fn write_frame(stdout: &mut tokio::io::Stdout, frame: &str) -> std::io::Result<()> {
    stdout.write_all(frame.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
