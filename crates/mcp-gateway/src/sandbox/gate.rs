//! Allowlist gate for programmatic tool invocation.
//!
//! Controlled by three environment variables:
//! `CODE_EXECUTION_REQUIRE_ALLOWLIST=1`, `CODE_EXECUTION_ALLOWED_TOOLS`
//! (comma list of names), and `CODE_EXECUTION_ALLOWED_TOOL_PREFIXES`
//! (comma list of prefixes). When any is set, only matching tool names may
//! be invoked through code execution or the filtered-call meta-tool.

use std::collections::HashSet;

/// Restriction on which tools programmatic endpoints may call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGate {
    require_allowlist: bool,
    allowed: HashSet<String>,
    prefixes: Vec<String>,
}

impl ExecutionGate {
    /// Read the gate from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let require_allowlist = std::env::var("CODE_EXECUTION_REQUIRE_ALLOWLIST")
            .map(|v| v == "1")
            .unwrap_or(false);

        let allowed = std::env::var("CODE_EXECUTION_ALLOWED_TOOLS")
            .map(|v| comma_list(&v).into_iter().collect())
            .unwrap_or_default();

        let prefixes = std::env::var("CODE_EXECUTION_ALLOWED_TOOL_PREFIXES")
            .map(|v| comma_list(&v))
            .unwrap_or_default();

        Self { require_allowlist, allowed, prefixes }
    }

    /// A gate with explicit rules (tests and embedding).
    #[must_use]
    pub fn with_rules(
        require_allowlist: bool,
        allowed: HashSet<String>,
        prefixes: Vec<String>,
    ) -> Self {
        Self { require_allowlist, allowed, prefixes }
    }

    /// A gate that lets everything through.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Whether any restriction is active.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.require_allowlist || !self.allowed.is_empty() || !self.prefixes.is_empty()
    }

    /// Whether a public tool name may be invoked programmatically.
    #[must_use]
    pub fn is_allowed(&self, tool: &str) -> bool {
        if !self.is_restricted() {
            return true;
        }
        self.allowed.contains(tool) || self.prefixes.iter().any(|p| tool.starts_with(p.as_str()))
    }
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
