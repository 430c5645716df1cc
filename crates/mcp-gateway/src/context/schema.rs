//! Schema deduplication.
//!
//! Many backend tools share identical input schemas. Each unique schema is
//! emitted once, keyed by a 12-hex digest of its canonical form; duplicates
//! become `{"$schemaRef": digest}` references.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::canonical_json;

/// Cross-request schema registry.
#[derive(Debug, Default)]
pub struct SchemaDeduplicator {
    /// digest -> schema
    schemas: HashMap<String, Value>,
    /// tool name -> digest
    by_tool: HashMap<String, String>,
    /// digest -> tools using it
    users: HashMap<String, BTreeSet<String>>,
}

impl SchemaDeduplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool's schema, returning its digest.
    pub fn register(&mut self, tool: &str, schema: &Value) -> String {
        let digest = schema_digest(schema);
        self.schemas.entry(digest.clone()).or_insert_with(|| schema.clone());
        self.by_tool.insert(tool.to_string(), digest.clone());
        self.users.entry(digest.clone()).or_default().insert(tool.to_string());
        digest
    }

    /// Full schema on first sight, `{"$schemaRef": digest}` afterwards.
    ///
    /// `already_sent` is the per-session set of digests the client has
    /// received; a hit produces the reference form and the set is extended
    /// on a miss.
    pub fn get_deduplicated(
        &mut self,
        tool: &str,
        schema: &Value,
        already_sent: &mut HashSet<String>,
    ) -> Value {
        let digest = self.register(tool, schema);
        if already_sent.contains(&digest) {
            serde_json::json!({ "$schemaRef": digest })
        } else {
            already_sent.insert(digest);
            schema.clone()
        }
    }

    /// Digest recorded for a tool, if any.
    #[must_use]
    pub fn digest_for(&self, tool: &str) -> Option<&str> {
        self.by_tool.get(tool).map(String::as_str)
    }

    /// Tools sharing a schema digest.
    #[must_use]
    pub fn users_of(&self, digest: &str) -> Vec<&str> {
        self.users
            .get(digest)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Bulk transmission form: `{schemas: digest -> schema, tools: name -> digest}`.
    ///
    /// Restricted to `tool_names` when given, otherwise covers every
    /// registered tool.
    #[must_use]
    pub fn build_registry(&self, tool_names: Option<&[String]>) -> Value {
        let selected: Vec<(&String, &String)> = match tool_names {
            Some(names) => names
                .iter()
                .filter_map(|name| self.by_tool.get_key_value(name))
                .collect(),
            None => self.by_tool.iter().collect(),
        };

        let mut schemas = serde_json::Map::new();
        let mut tools = serde_json::Map::new();
        for (tool, digest) in selected {
            if let Some(schema) = self.schemas.get(digest) {
                schemas.entry(digest.clone()).or_insert_with(|| schema.clone());
            }
            tools.insert(tool.clone(), Value::String(digest.clone()));
        }

        serde_json::json!({
            "schemas": schemas,
            "tools": tools,
        })
    }

    /// Number of unique schemas seen.
    #[must_use]
    pub fn unique_count(&self) -> usize {
        self.schemas.len()
    }
}

/// 12-hex SHA-256 prefix of the canonical (sorted-top-level-keys) form.
#[must_use]
pub fn schema_digest(schema: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(schema).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_schema() -> Value {
        serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}})
    }

    #[test]
    fn test_digest_stable_under_key_order() {
        let a = serde_json::json!({"type": "object", "properties": {}});
        let b = serde_json::json!({"properties": {}, "type": "object"});
        assert_eq!(schema_digest(&a), schema_digest(&b));
        assert_eq!(schema_digest(&a).len(), 12);
    }

    #[test]
    fn test_first_emission_is_full() {
        let mut dedup = SchemaDeduplicator::new();
        let mut sent = HashSet::new();
        let schema = object_schema();

        let out = dedup.get_deduplicated("search", &schema, &mut sent);
        assert_eq!(out, schema);
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_duplicate_becomes_reference() {
        let mut dedup = SchemaDeduplicator::new();
        let mut sent = HashSet::new();
        let schema = object_schema();

        dedup.get_deduplicated("search", &schema, &mut sent);
        let out = dedup.get_deduplicated("lookup", &schema, &mut sent);

        let reference = out.get("$schemaRef").and_then(Value::as_str).unwrap();
        assert_eq!(reference, schema_digest(&schema));
        // No unique schema is ever emitted twice into the same session.
        assert_eq!(sent.len(), 1);
    }

    #[test]
    fn test_users_tracked_per_digest() {
        let mut dedup = SchemaDeduplicator::new();
        let schema = object_schema();
        let digest = dedup.register("a", &schema);
        dedup.register("b", &schema);

        assert_eq!(dedup.users_of(&digest), vec!["a", "b"]);
        assert_eq!(dedup.unique_count(), 1);
    }

    #[test]
    fn test_build_registry_filtered() {
        let mut dedup = SchemaDeduplicator::new();
        let shared = object_schema();
        let other = serde_json::json!({"type": "string"});
        dedup.register("a", &shared);
        dedup.register("b", &shared);
        dedup.register("c", &other);

        let registry = dedup.build_registry(Some(&["a".to_string(), "b".to_string()]));
        let schemas = registry["schemas"].as_object().unwrap();
        let tools = registry["tools"].as_object().unwrap();

        // Two tools, one shared schema.
        assert_eq!(schemas.len(), 1);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools["a"], tools["b"]);
    }

    #[test]
    fn test_build_registry_full() {
        let mut dedup = SchemaDeduplicator::new();
        dedup.register("a", &object_schema());
        dedup.register("c", &serde_json::json!({"type": "string"}));

        let registry = dedup.build_registry(None);
        assert_eq!(registry["schemas"].as_object().unwrap().len(), 2);
        assert_eq!(registry["tools"].as_object().unwrap().len(), 2);
    }
}
