//! Sandboxed snippet execution.
//!
//! Agent-authored code runs in a per-execution `rhai` engine — a restricted
//! evaluator where nothing from the host exists unless explicitly
//! registered. The registered surface is: one callable per connected backend
//! tool, a generic `call_tool`, capped output sinks (`log`/`warn`/`error`/
//! `info`), and JSON helpers. There is no `eval`, no filesystem, no process,
//! no timers; operation limits and a wall-clock deadline bound runaway
//! scripts, and every tool result crosses the boundary as plain JSON data.

pub mod gate;
pub mod planner;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;

use crate::backend::supervisor::BackendSupervisor;
use crate::config::defaults;

use gate::ExecutionGate;

/// Slack added to the host-side watchdog beyond the script deadline.
const WATCHDOG_SLACK: Duration = Duration::from_millis(500);

/// Inputs to one execution.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
    /// Extra constants merged into the script scope. Only JSON data crosses
    /// the boundary, so host references cannot leak through it.
    #[serde(default)]
    pub context: Option<Value>,
}

/// Outcome of one execution.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
}

/// Captured-output buffer with a byte cap.
struct OutputSink {
    lines: Vec<String>,
    bytes: usize,
    cap: usize,
    truncated: bool,
}

impl OutputSink {
    fn new(cap: usize) -> Self {
        Self { lines: Vec::new(), bytes: 0, cap, truncated: false }
    }

    fn push(&mut self, line: String) {
        if self.truncated {
            return;
        }
        if self.bytes + line.len() > self.cap {
            self.truncated = true;
            self.lines.push("[Output truncated...]".to_string());
            return;
        }
        self.bytes += line.len();
        self.lines.push(line);
    }
}

/// Sandboxed code executor bound to the supervisor's tool namespace.
pub struct CodeExecutor {
    supervisor: BackendSupervisor,
    gate: ExecutionGate,
    default_timeout: Duration,
    default_max_output: usize,
}

impl CodeExecutor {
    #[must_use]
    pub fn new(supervisor: BackendSupervisor, gate: ExecutionGate) -> Self {
        Self {
            supervisor,
            gate,
            default_timeout: defaults::EXEC_TIMEOUT,
            default_max_output: defaults::EXEC_MAX_OUTPUT,
        }
    }

    /// Override the default wall-clock timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run one snippet to completion or timeout.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let timeout = request
            .timeout_ms
            .map_or(self.default_timeout, Duration::from_millis);
        let cap = request.max_output_bytes.unwrap_or(self.default_max_output);

        // Snapshot the callable tool names up front; the script sees a fixed
        // surface even if backends change mid-run.
        let tool_names: Vec<String> = self
            .supervisor
            .all_tools()
            .await
            .into_iter()
            .map(|(_, tool)| tool.name)
            .filter(|name| self.gate.is_allowed(name))
            .collect();

        let sink = Arc::new(Mutex::new(OutputSink::new(cap)));
        let supervisor = self.supervisor.clone();
        let gate = self.gate.clone();
        let handle = tokio::runtime::Handle::current();
        let code = request.code.clone();
        let context = request.context.clone();
        let script_sink = Arc::clone(&sink);

        let started = Instant::now();
        let deadline = started + timeout;

        let task = tokio::task::spawn_blocking(move || {
            run_script(
                &code,
                context,
                &tool_names,
                supervisor,
                gate,
                handle,
                script_sink,
                deadline,
            )
        });

        let outcome = match tokio::time::timeout(timeout + WATCHDOG_SLACK, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(ScriptError {
                timed_out: false,
                message: format!("execution task failed: {join_error}"),
            }),
            // The blocking thread is still running; the engine will abort
            // itself at its next operation tick.
            Err(_) => Err(ScriptError { timed_out: true, message: String::new() }),
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let output = {
            let sink = sink.lock().expect("output sink poisoned");
            sink.lines.clone()
        };

        match outcome {
            Ok(value) => ExecutionResult {
                success: true,
                output,
                error: None,
                execution_time_ms,
                return_value: serialize_return(value, cap),
            },
            Err(e) => {
                let message = if e.timed_out {
                    format!("Execution timed out after {}ms", timeout.as_millis())
                } else {
                    e.message
                };
                ExecutionResult {
                    success: false,
                    output,
                    error: Some(message),
                    execution_time_ms,
                    return_value: None,
                }
            }
        }
    }
}

impl std::fmt::Debug for CodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExecutor")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

struct ScriptError {
    timed_out: bool,
    message: String,
}

#[allow(clippy::too_many_arguments)]
fn run_script(
    code: &str,
    context: Option<Value>,
    tool_names: &[String],
    supervisor: BackendSupervisor,
    gate: ExecutionGate,
    handle: tokio::runtime::Handle,
    sink: Arc<Mutex<OutputSink>>,
    deadline: Instant,
) -> Result<Dynamic, ScriptError> {
    let mut engine = build_engine(&sink, deadline);
    register_tool_bindings(&mut engine, tool_names, &supervisor, &gate, &handle);

    let mut scope = Scope::new();
    if let Some(Value::Object(entries)) = context {
        for (key, value) in entries {
            if let Ok(dynamic) = rhai::serde::to_dynamic(&value) {
                scope.push_constant_dynamic(safe_ident(&key), dynamic);
            }
            // Unserializable values never exist here: the context arrived
            // as JSON.
        }
    }

    engine.eval_with_scope::<Dynamic>(&mut scope, code).map_err(|e| match *e {
        EvalAltResult::ErrorTerminated(..) => ScriptError { timed_out: true, message: String::new() },
        other => ScriptError { timed_out: false, message: other.to_string() },
    })
}

fn build_engine(sink: &Arc<Mutex<OutputSink>>, deadline: Instant) -> Engine {
    let mut engine = Engine::new();

    // Dynamic code generation stays off, and `import` resolves nothing —
    // the default resolver would reach the filesystem.
    engine.disable_symbol("eval");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

    // Structural bounds; runaway scripts abort on the wall clock below.
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1024 * 1024);
    engine.set_max_array_size(64 * 1024);
    engine.set_max_map_size(64 * 1024);

    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("timeout"))
        } else {
            None
        }
    });

    // All output paths land in the capped buffer.
    let print_sink = Arc::clone(sink);
    engine.on_print(move |text| {
        print_sink.lock().expect("output sink poisoned").push(text.to_string());
    });
    let debug_sink = Arc::clone(sink);
    engine.on_debug(move |text, _, _| {
        debug_sink.lock().expect("output sink poisoned").push(text.to_string());
    });

    for name in ["log", "info", "warn", "error"] {
        let line_sink = Arc::clone(sink);
        engine.register_fn(name, move |value: Dynamic| {
            line_sink.lock().expect("output sink poisoned").push(value.to_string());
        });
    }

    engine.register_fn("parse_json", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        rhai::serde::to_dynamic(&value).map_err(Into::into)
    });
    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        serde_json::to_string(&value).map_err(|e| e.to_string().into())
    });

    engine
}

fn register_tool_bindings(
    engine: &mut Engine,
    tool_names: &[String],
    supervisor: &BackendSupervisor,
    gate: &ExecutionGate,
    handle: &tokio::runtime::Handle,
) {
    for name in tool_names {
        let tool = name.clone();
        let supervisor = supervisor.clone();
        let handle = handle.clone();
        engine.register_fn(
            safe_ident(name),
            move |args: rhai::Map| -> Result<Dynamic, Box<EvalAltResult>> {
                invoke_tool(&supervisor, &handle, &tool, &args)
            },
        );
    }

    let supervisor = supervisor.clone();
    let gate = gate.clone();
    let handle = handle.clone();
    engine.register_fn(
        "call_tool",
        move |name: &str, args: rhai::Map| -> Result<Dynamic, Box<EvalAltResult>> {
            if !gate.is_allowed(name) {
                return Err(format!("tool not allowed by execution policy: {name}").into());
            }
            invoke_tool(&supervisor, &handle, name, &args)
        },
    );
}

/// Bridge one synchronous script call onto the async supervisor. The result
/// crosses back as a JSON round-trip, so only plain data reaches the script.
fn invoke_tool(
    supervisor: &BackendSupervisor,
    handle: &tokio::runtime::Handle,
    tool: &str,
    args: &rhai::Map,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let arguments = serde_json::to_value(Dynamic::from(args.clone())).map_err(|e| e.to_string())?;
    let result = handle
        .block_on(supervisor.call_tool(tool, arguments))
        .map_err(|e| e.to_string())?;
    rhai::serde::to_dynamic(&result).map_err(Into::into)
}

/// Rewrite a tool name into a safe script identifier:
/// every non-`[A-Za-z0-9_]` byte becomes `_`.
#[must_use]
pub fn safe_ident(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

fn serialize_return(value: Dynamic, cap: usize) -> Option<Value> {
    if value.is_unit() {
        return None;
    }
    match serde_json::to_value(&value) {
        Ok(json) => {
            if json.to_string().len() > cap {
                Some(Value::String("[Return value exceeds output limit]".to_string()))
            } else {
                Some(json)
            }
        }
        Err(_) => Some(Value::String("[Return value could not be serialized]".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> CodeExecutor {
        CodeExecutor::new(BackendSupervisor::new(), ExecutionGate::allow_all())
    }

    #[tokio::test]
    async fn test_simple_expression() {
        let result = executor()
            .execute(ExecuteRequest { code: "1 + 2".to_string(), ..Default::default() })
            .await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.return_value, Some(serde_json::json!(3)));
    }

    #[tokio::test]
    async fn test_output_capture() {
        let code = r#"log("first"); warn("second"); 0"#;
        let result = executor()
            .execute(ExecuteRequest { code: code.to_string(), ..Default::default() })
            .await;
        assert!(result.success);
        assert_eq!(result.output, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_output_cap_appends_truncation_marker() {
        let code = r#"for i in 0..100 { log("xxxxxxxxxxxxxxxxxxxx"); } 0"#;
        let result = executor()
            .execute(ExecuteRequest {
                code: code.to_string(),
                max_output_bytes: Some(100),
                ..Default::default()
            })
            .await;
        assert!(result.success);
        assert_eq!(result.output.last().map(String::as_str), Some("[Output truncated...]"));
        // Cap plus the single marker line, nothing more.
        assert!(result.output.len() <= 6);
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let result = executor()
            .execute(ExecuteRequest {
                code: "loop { }".to_string(),
                timeout_ms: Some(500),
                ..Default::default()
            })
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("timed out"));
        // Returns within the timeout plus bounded slack.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_eval_is_unavailable() {
        let result = executor()
            .execute(ExecuteRequest { code: r#"eval("1+1")"#.to_string(), ..Default::default() })
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_no_host_escape_hatches() {
        // None of these names exist in the evaluation context.
        for code in [
            "open_file(\"/etc/passwd\")",
            "spawn(\"sh\")",
            "set_timeout(|| 1, 10)",
            "import \"std\";",
        ] {
            let result = executor()
                .execute(ExecuteRequest { code: code.to_string(), ..Default::default() })
                .await;
            assert!(!result.success, "expected failure for {code}");
        }
    }

    #[tokio::test]
    async fn test_user_error_surfaces_as_failure() {
        let result = executor()
            .execute(ExecuteRequest {
                code: r#"throw "boom";"#.to_string(),
                ..Default::default()
            })
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn test_unknown_tool_call_fails_inside_script() {
        let result = executor()
            .execute(ExecuteRequest {
                code: r#"call_tool("ghost", #{})"#.to_string(),
                ..Default::default()
            })
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("ghost"));
    }

    #[tokio::test]
    async fn test_gate_blocks_call_tool() {
        let gate = ExecutionGate::with_rules(true, std::collections::HashSet::new(), Vec::new());
        let executor = CodeExecutor::new(BackendSupervisor::new(), gate);
        let result = executor
            .execute(ExecuteRequest {
                code: r#"call_tool("db_query", #{})"#.to_string(),
                ..Default::default()
            })
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_context_constants_visible() {
        let result = executor()
            .execute(ExecuteRequest {
                code: "threshold + 1".to_string(),
                context: Some(serde_json::json!({"threshold": 41})),
                ..Default::default()
            })
            .await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.return_value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_json_helpers_roundtrip() {
        let code = r#"
            let parsed = parse_json("{\"n\": 7}");
            to_json(parsed.n)
        "#;
        let result = executor()
            .execute(ExecuteRequest { code: code.to_string(), ..Default::default() })
            .await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.return_value, Some(serde_json::json!("7")));
    }

    #[test]
    fn test_safe_ident() {
        assert_eq!(safe_ident("db_query"), "db_query");
        assert_eq!(safe_ident("fs.read-file"), "fs_read_file");
        assert_eq!(safe_ident("1weird"), "_1weird");
    }

    #[test]
    fn test_unit_return_is_none() {
        assert_eq!(serialize_return(Dynamic::UNIT, 100), None);
    }

    #[test]
    fn test_oversized_return_is_placeholder() {
        let value = Dynamic::from("x".repeat(200));
        let out = serialize_return(value, 100).unwrap();
        assert_eq!(out, Value::String("[Return value exceeds output limit]".to_string()));
    }
}
