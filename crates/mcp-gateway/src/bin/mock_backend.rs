//! Minimal stdio MCP server used by the integration tests and for local
//! gateway experiments.
//!
//! Speaks newline-delimited JSON-RPC 2.0. Requests are handled concurrently
//! (each on its own task) so in-flight caps can be observed from outside.
//! The tool set defaults to `echo,sum,sleep,shutdown,add_tool` and can be
//! overridden with the `MOCK_TOOLS` environment variable.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};

struct ServerState {
    /// Tools advertised by tools/list.
    tools: Mutex<Vec<String>>,
    /// Requests currently being handled.
    active: AtomicUsize,
    /// High-water mark of `active`.
    peak: AtomicUsize,
    /// Outbound frames funnel through one writer task.
    out: mpsc::UnboundedSender<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let tools: Vec<String> = std::env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "echo,sum,sleep,shutdown,add_tool".to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let state = Arc::new(ServerState {
        tools: Mutex::new(tools),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        out: out_tx,
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = out_rx.recv().await {
            if stdout.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    });

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok(frame) = serde_json::from_str::<Value>(trimmed) else { continue };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            handle_frame(&state, frame).await;
        });
    }

    drop(state);
    let _ = writer.await;
}

async fn handle_frame(state: &ServerState, frame: Value) {
    let method = frame.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
    let id = frame.get("id").cloned();
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    // Notifications never get a response.
    let Some(id) = id else { return };

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "mock-backend", "version": env!("CARGO_PKG_VERSION") }
        }),
        "ping" => json!({}),
        "tools/list" => {
            let tools = state.tools.lock().await;
            let defs: Vec<Value> = tools
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("mock tool {name}"),
                        "inputSchema": { "type": "object", "properties": {} }
                    })
                })
                .collect();
            json!({ "tools": defs })
        }
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            handle_tool(state, name, &arguments).await
        }
        _ => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            });
            let _ = state.out.send(response.to_string());
            return;
        }
    };

    let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    let _ = state.out.send(response.to_string());
}

async fn handle_tool(state: &ServerState, name: &str, args: &Value) -> Value {
    match name {
        "echo" => json!({ "ok": true, "msg": args.get("msg").cloned().unwrap_or(Value::Null) }),
        "sum" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            json!({ "sum": a + b })
        }
        "query" => json!({
            "ok": true,
            "tool": "query",
            "sql": args.get("sql").cloned().unwrap_or(Value::Null)
        }),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(100);
            let entered = state.active.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak.fetch_max(entered, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            state.active.fetch_sub(1, Ordering::SeqCst);
            json!({ "ok": true, "active": entered, "peak": state.peak.load(Ordering::SeqCst) })
        }
        "add_tool" => {
            let new_tool = args
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("dynamic_tool")
                .to_string();
            state.tools.lock().await.push(new_tool.clone());
            let _ = state.out.send(
                json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" })
                    .to_string(),
            );
            json!({ "ok": true, "added": new_tool })
        }
        "shutdown" => {
            // The response goes out first; the delayed exit gives the writer
            // time to flush so the gateway sees a clean EOF.
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                std::process::exit(0);
            });
            json!({ "ok": true, "shutting_down": true })
        }
        other => json!({ "ok": false, "error": format!("unknown tool {other}") }),
    }
}
