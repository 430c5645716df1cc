//! Child-process transport: newline-delimited JSON-RPC on stdin/stdout.
//!
//! Spawns the configured command with piped stdio, pumps stdout lines through
//! an id-correlated pending map (responses may arrive out of order), and
//! forwards stderr to the log behind a sliding-window throttle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::defaults;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::{McpTransport, PendingMap, TransportEvent, await_pending};

/// Stderr lines logged per throttle window before suppression kicks in.
const STDERR_WINDOW_LINES: u32 = 10;

/// Length of the stderr throttle window.
const STDERR_WINDOW: Duration = Duration::from_secs(5);

struct ChildState {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// Child-process line-JSON transport.
pub struct StdioTransport {
    backend_id: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    state: Mutex<Option<ChildState>>,
    pending: Arc<PendingMap>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl StdioTransport {
    #[must_use]
    pub fn new(
        backend_id: &str,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
            env: env.clone(),
            state: Mutex::new(None),
            pending: Arc::new(PendingMap::new()),
            events,
        }
    }

    async fn write_line(&self, line: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        let Some(state) = state.as_mut() else {
            return Err(GatewayError::Disconnected);
        };
        state
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::transport(format!("stdin write: {e}")))?;
        state
            .stdin
            .write_all(b"\n")
            .await
            .map_err(|e| GatewayError::transport(format!("stdin write: {e}")))?;
        state
            .stdin
            .flush()
            .await
            .map_err(|e| GatewayError::transport(format!("stdin flush: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        tracing::info!(backend = %self.backend_id, command = %self.command, "Spawning stdio backend");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::transport(format!("spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::transport("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::transport("child stdout unavailable"))?;

        let stderr = child.stderr.take().map(|stderr| {
            let backend = self.backend_id.clone();
            tokio::spawn(async move {
                pump_stderr(&backend, stderr).await;
            })
        });

        let reader = {
            let backend = self.backend_id.clone();
            let pending = Arc::clone(&self.pending);
            let events = self.events.clone();
            tokio::spawn(async move {
                pump_stdout(&backend, stdout, &pending, &events).await;
            })
        };

        *state = Some(ChildState { child, stdin, reader, stderr });
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn send_request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> GatewayResult<JsonRpcResponse> {
        let id = request
            .numeric_id()
            .ok_or_else(|| GatewayError::protocol("outbound request without numeric id"))?;

        let rx = self.pending.register(id).await;
        let line = serde_json::to_string(&request)?;
        if let Err(e) = self.write_line(&line).await {
            self.pending.forget(id).await;
            return Err(e);
        }

        await_pending(&self.pending, id, rx, timeout).await
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.write_line(&line).await
    }

    async fn disconnect(&self) {
        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };

        // Closing stdin asks a well-behaved server to exit on its own.
        drop(state.stdin);

        match tokio::time::timeout(defaults::CHILD_SHUTDOWN_GRACE, state.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(backend = %self.backend_id, %status, "Child exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(backend = %self.backend_id, error = %e, "Child wait failed");
            }
            Err(_) => {
                tracing::warn!(backend = %self.backend_id, "Child did not exit in time, killing");
                let _ = state.child.start_kill();
                let _ = state.child.wait().await;
            }
        }

        state.reader.abort();
        if let Some(stderr) = state.stderr {
            stderr.abort();
        }

        self.pending.fail_all_disconnected().await;
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

/// Dispatch stdout lines: frames with an `id` complete pending requests,
/// frames with only a `method` are server notifications.
async fn pump_stdout(
    backend: &str,
    stdout: tokio::process::ChildStdout,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Stdout read failed");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Dropping unparseable frame");
                continue;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_i64) {
            match serde_json::from_value::<JsonRpcResponse>(value) {
                Ok(response) => {
                    if !pending.complete(id, Ok(response)).await {
                        tracing::debug!(backend = %backend, id, "Dropping late or unknown response");
                    }
                }
                Err(e) => {
                    tracing::warn!(backend = %backend, id, error = %e, "Malformed response frame");
                    pending
                        .complete(id, Err(GatewayError::protocol(format!("malformed response: {e}"))))
                        .await;
                }
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let _ = events.send(TransportEvent::Notification { method: method.to_string(), params });
        } else {
            tracing::debug!(backend = %backend, "Dropping frame with neither id nor method");
        }
    }

    // Reader exit means the pipe is gone: fail everything exactly once.
    pending.fail_all_disconnected().await;
    let _ = events.send(TransportEvent::Disconnected);
}

/// Forward stderr to the log, at most [`STDERR_WINDOW_LINES`] lines per
/// [`STDERR_WINDOW`], then one suppression notice until the window resets.
async fn pump_stderr(backend: &str, stderr: tokio::process::ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if window_start.elapsed() > STDERR_WINDOW {
            window_start = Instant::now();
            window_count = 0;
        }
        window_count += 1;

        if window_count <= STDERR_WINDOW_LINES {
            tracing::debug!(backend = %backend, "stderr: {}", line.trim_end());
        } else if window_count == STDERR_WINDOW_LINES + 1 {
            tracing::debug!(backend = %backend, "stderr noisy, throttling further messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_cat() -> (StdioTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport =
            StdioTransport::new("test", "cat", &[], None, &HashMap::new(), tx);
        (transport, rx)
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (transport, _rx) = spawn_cat();
        if transport.connect().await.is_err() {
            // No `cat` on this system; nothing to assert.
            return;
        }

        // `cat` echoes the request line verbatim; a request is not a valid
        // response (it has a method, but the id still matches), so the frame
        // resolves the pending entry as a response with that id.
        let request = JsonRpcRequest::request(1, "ping", None);
        let response = transport
            .send_request(request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.numeric_id(), Some(1));

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_order_correlation() {
        let (transport, _rx) = spawn_cat();
        if transport.connect().await.is_err() {
            return;
        }

        // Fire two requests concurrently; cat preserves write order, but each
        // response resolves its own id regardless of await order.
        let r1 = transport.send_request(JsonRpcRequest::request(1, "a", None), Duration::from_secs(2));
        let r2 = transport.send_request(JsonRpcRequest::request(2, "b", None), Duration::from_secs(2));
        let (a, b) = tokio::join!(r1, r2);
        assert_eq!(a.unwrap().numeric_id(), Some(1));
        assert_eq!(b.unwrap().numeric_id(), Some(2));

        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_once() {
        let (transport, _rx) = spawn_cat();
        if transport.connect().await.is_err() {
            return;
        }

        // `true` — register a pending entry by hand so nothing answers it.
        let rx = transport.pending.register(99).await;
        transport.disconnect().await;

        assert!(matches!(rx.await.unwrap(), Err(GatewayError::Disconnected)));
        assert!(transport.pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_after_disconnect() {
        let (transport, _rx) = spawn_cat();
        if transport.connect().await.is_err() {
            return;
        }
        transport.disconnect().await;

        let result = transport
            .send_request(JsonRpcRequest::request(5, "ping", None), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(GatewayError::Disconnected)));
    }
}
