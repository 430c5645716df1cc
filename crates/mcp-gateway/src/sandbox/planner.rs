//! Advisory query planner.
//!
//! Scans snippet code textually before execution and emits suggestions —
//! duplicate calls, parallelizable sequences, query-shape hints, N+1 loops.
//! Best-effort pattern matching over the source text, no AST; suggestions
//! never modify the code.

use std::collections::{HashMap, HashSet};

use regex::Regex;

/// Suggestion categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Redundant,
    Parallel,
    Filter,
    Batch,
    Cache,
    Order,
}

/// Suggestion severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One advisory finding.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub severity: Severity,
    pub message: String,
}

/// Textual pre-execution analyzer.
pub struct QueryPlanner {
    call_tool: Regex,
    await_call: Regex,
    select_star: Regex,
    select_no_limit: Regex,
    order_by: Regex,
    loop_block: Regex,
}

impl QueryPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // call_tool("name", {...}) — args captured up to the closing paren.
            call_tool: Regex::new(r#"call_tool\s*\(\s*"([^"]+)"\s*,\s*([^)]*)\)"#)
                .expect("static regex"),
            await_call: Regex::new(r"await\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("static regex"),
            select_star: Regex::new(r"(?i)select\s+\*").expect("static regex"),
            select_no_limit: Regex::new(r"(?i)select\s+[^;\x22']+").expect("static regex"),
            order_by: Regex::new(r"(?i)order\s+by").expect("static regex"),
            loop_block: Regex::new(r"(?s)for\s+[^{]+\{[^}]*\}").expect("static regex"),
        }
    }

    /// Scan `code` and return advisory suggestions.
    #[must_use]
    pub fn analyze(&self, code: &str) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();

        self.check_duplicate_calls(code, &mut suggestions);
        self.check_sequential_awaits(code, &mut suggestions);
        self.check_query_shape(code, &mut suggestions);
        self.check_loop_calls(code, &mut suggestions);

        suggestions
    }

    /// Identical `tool:args` pairs issued more than once.
    fn check_duplicate_calls(&self, code: &str, out: &mut Vec<Suggestion>) {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for capture in self.call_tool.captures_iter(code) {
            let key = format!("{}:{}", &capture[1], capture[2].trim());
            *counts.entry(key).or_insert(0) += 1;
        }
        for (key, count) in counts {
            if count > 1 {
                let tool = key.split(':').next().unwrap_or(&key);
                out.push(Suggestion {
                    kind: SuggestionKind::Redundant,
                    severity: Severity::Warning,
                    message: format!(
                        "{tool} is called {count} times with identical arguments; call it once and reuse the result"
                    ),
                });
            }
        }
    }

    /// Several awaits on distinct tools in sequence can usually fan out.
    fn check_sequential_awaits(&self, code: &str, out: &mut Vec<Suggestion>) {
        let tools: HashSet<&str> = self
            .await_call
            .captures_iter(code)
            .map(|c| c.get(1).map_or("", |m| m.as_str()))
            .collect();
        if tools.len() > 1 {
            let mut names: Vec<&str> = tools.into_iter().collect();
            names.sort_unstable();
            out.push(Suggestion {
                kind: SuggestionKind::Parallel,
                severity: Severity::Info,
                message: format!(
                    "Sequential awaits on distinct tools ({}) could run concurrently",
                    names.join(", ")
                ),
            });
        }
    }

    /// SELECT-shape hints inside string literals.
    fn check_query_shape(&self, code: &str, out: &mut Vec<Suggestion>) {
        if self.select_star.is_match(code) {
            out.push(Suggestion {
                kind: SuggestionKind::Filter,
                severity: Severity::Warning,
                message: "SELECT * fetches every column; name only the ones the snippet uses"
                    .to_string(),
            });
        }
        if self.select_no_limit.is_match(code) && !code.to_lowercase().contains("limit") {
            out.push(Suggestion {
                kind: SuggestionKind::Filter,
                severity: Severity::Info,
                message: "Query has no LIMIT; unbounded result sets inflate the context".to_string(),
            });
        }
        if self.order_by.is_match(code) && !code.to_lowercase().contains("limit") {
            out.push(Suggestion {
                kind: SuggestionKind::Order,
                severity: Severity::Info,
                message: "ORDER BY without LIMIT sorts the full result set before it is truncated client-side"
                    .to_string(),
            });
        }
    }

    /// A tool or query call inside a loop body is the classic N+1 shape.
    fn check_loop_calls(&self, code: &str, out: &mut Vec<Suggestion>) {
        for block in self.loop_block.find_iter(code) {
            let body = block.as_str();
            let has_query = body.contains(".query") || body.contains("query(");
            let has_call = self.call_tool.is_match(body) || body.contains("await");
            if has_query && has_call {
                out.push(Suggestion {
                    kind: SuggestionKind::Batch,
                    severity: Severity::Warning,
                    message: "Query call inside a loop (N+1); batch the lookups into one call"
                        .to_string(),
                });
            } else if self.call_tool.is_match(body) {
                out.push(Suggestion {
                    kind: SuggestionKind::Cache,
                    severity: Severity::Info,
                    message: "Tool call inside a loop; hoist it out or cache the result if the arguments repeat"
                        .to_string(),
                });
            }
        }
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlanner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(code: &str) -> Vec<SuggestionKind> {
        QueryPlanner::new().analyze(code).into_iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_duplicate_calls_flagged() {
        let code = r#"
            let a = call_tool("db_query", #{"sql": "select 1"});
            let b = call_tool("db_query", #{"sql": "select 1"});
        "#;
        assert!(kinds(code).contains(&SuggestionKind::Redundant));
    }

    #[test]
    fn test_distinct_args_not_redundant() {
        let code = r#"
            let a = call_tool("db_query", #{"sql": "select 1"});
            let b = call_tool("db_query", #{"sql": "select 2"});
        "#;
        assert!(!kinds(code).contains(&SuggestionKind::Redundant));
    }

    #[test]
    fn test_sequential_awaits_suggest_parallel() {
        let code = "const a = await list_files({}); const b = await db_query({});";
        assert!(kinds(code).contains(&SuggestionKind::Parallel));
    }

    #[test]
    fn test_select_star_and_missing_limit() {
        let code = r#"let rows = call_tool("db_query", #{"sql": "SELECT * FROM users"});"#;
        let found = kinds(code);
        assert!(found.iter().filter(|k| **k == SuggestionKind::Filter).count() >= 2);
    }

    #[test]
    fn test_order_by_without_limit() {
        let code = r#"call_tool("db_query", #{"sql": "SELECT id FROM t ORDER BY id"})"#;
        assert!(kinds(code).contains(&SuggestionKind::Order));
    }

    #[test]
    fn test_loop_query_is_batch_warning() {
        let code = r#"
            for user in users {
                let orders = call_tool("db_query", #{"sql": "..."}).query;
            }
        "#;
        assert!(kinds(code).contains(&SuggestionKind::Batch));
    }

    #[test]
    fn test_clean_code_has_no_findings() {
        let code = r#"let x = call_tool("echo", #{"msg": "hi"}); log(x);"#;
        // A single bounded call with no query text triggers nothing.
        let found = QueryPlanner::new().analyze(code);
        assert!(found.is_empty(), "unexpected: {found:?}");
    }
}
