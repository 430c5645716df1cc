//! Conversation-scoped context: dedup, token tracking, schema and delta
//! compression.
//!
//! Everything here exists to avoid re-sending bytes an upstream client has
//! already seen: [`session::SessionContext`] remembers delivered content by
//! digest, [`schema::SchemaDeduplicator`] collapses identical tool schemas,
//! [`delta::DeltaResponseManager`] turns repeated query results into diffs,
//! and [`tracker::ContextTracker`] keeps a running token estimate so the
//! gateway can warn before the client's context fills.

pub mod delta;
pub mod schema;
pub mod session;
pub mod tracker;

use serde_json::Value;

/// Character-count token estimate: `ceil(chars / 4)`.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Serialize with sorted top-level keys.
///
/// Sufficient to make structurally identical payloads from the same encoder
/// digest equal; nested key order is preserved as-is.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, &Value> = map.iter().collect();
            serde_json::to_string(&sorted).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}
