//! Delta responses for repeated queries.
//!
//! The last payload delivered for each `delta:<tool>:<args>` key is cached;
//! a repeat of the same query is answered with a diff against it when the
//! diff is worthwhile (at least 20 percent smaller than the full payload).
//! [`apply_delta`] is the exact inverse: replaying deltas converges to the
//! same value the server holds, and a computed delta is verified by applying
//! it before it is emitted — anything that does not reconstruct exactly
//! falls back to the full form.

use md5::{Digest as Md5Digest, Md5};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::defaults;

use super::{canonical_json, estimate_tokens};

/// Minimum relative saving for a delta to be worth emitting.
const MIN_SAVING: f64 = 0.2;

#[derive(Clone)]
struct CachedPayload {
    value: Value,
    hash: String,
}

/// Last-payload store with delta computation.
pub struct DeltaResponseManager {
    cache: moka::future::Cache<String, CachedPayload>,
}

impl DeltaResponseManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(defaults::DELTA_CACHE_MAX, defaults::DELTA_CACHE_MAX_AGE)
    }

    /// Explicit capacity and entry max age (evicted beyond either bound).
    #[must_use]
    pub fn with_limits(max_entries: u64, max_age: std::time::Duration) -> Self {
        Self {
            cache: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(max_age)
                .build(),
        }
    }

    /// Cache key for a tool invocation: `delta:<tool>:<md5 of canonical args>`.
    #[must_use]
    pub fn cache_key(tool: &str, args: &Value) -> String {
        let mut hasher = Md5::new();
        hasher.update(canonical_json(args).as_bytes());
        format!("delta:{tool}:{:x}", hasher.finalize())
    }

    /// Delta for an array payload. With `id_field`, elements are matched by
    /// that field across both sides; otherwise the diff is positional.
    pub async fn get_delta_for_array(
        &self,
        key: &str,
        current: &Value,
        id_field: Option<&str>,
    ) -> Value {
        let Some(items) = current.as_array() else {
            // Not an array; nothing meaningful to diff.
            return self.full_response(key, current).await;
        };

        let hash = payload_hash(current);
        let Some(prior) = self.cache.get(key).await else {
            return self.store_full(key, current, hash).await;
        };

        if prior.hash == hash {
            return serde_json::json!({ "type": "full", "previousHash": hash });
        }

        let delta = prior.value.as_array().map(|prev| match id_field {
            Some(field) => array_delta_by_id(prev, items, field, &hash),
            None => array_delta_positional(prev, items, &hash),
        });

        let full = full_payload(&hash, current);
        self.cache
            .insert(key.to_string(), CachedPayload { value: current.clone(), hash })
            .await;

        match delta {
            Some(delta) if delta_is_worthwhile(&prior.value, &delta, &full, current) => delta,
            _ => full,
        }
    }

    /// Delta for an object payload: a `{type: "update", changes}` record of
    /// per-key old/new pairs.
    pub async fn get_delta_for_object(&self, key: &str, current: &Value) -> Value {
        let Some(fields) = current.as_object() else {
            return self.full_response(key, current).await;
        };

        let hash = payload_hash(current);
        let Some(prior) = self.cache.get(key).await else {
            return self.store_full(key, current, hash).await;
        };

        if prior.hash == hash {
            return serde_json::json!({ "type": "full", "previousHash": hash });
        }

        let delta = prior.value.as_object().map(|prev| {
            let mut changes = serde_json::Map::new();
            for (k, old) in prev {
                match fields.get(k) {
                    Some(new) if new != old => {
                        changes.insert(
                            k.clone(),
                            serde_json::json!({ "old": old, "new": new }),
                        );
                    }
                    Some(_) => {}
                    None => {
                        changes.insert(k.clone(), serde_json::json!({ "old": old }));
                    }
                }
            }
            for (k, new) in fields {
                if !prev.contains_key(k) {
                    changes.insert(k.clone(), serde_json::json!({ "new": new }));
                }
            }
            serde_json::json!({ "type": "update", "hash": hash.clone(), "changes": changes })
        });

        let full = full_payload(&hash, current);
        self.cache
            .insert(key.to_string(), CachedPayload { value: current.clone(), hash })
            .await;

        match delta {
            Some(delta) if delta_is_worthwhile(&prior.value, &delta, &full, current) => delta,
            _ => full,
        }
    }

    /// Drop the cached payload for a key.
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn full_response(&self, key: &str, current: &Value) -> Value {
        let hash = payload_hash(current);
        self.store_full(key, current, hash).await
    }

    async fn store_full(&self, key: &str, current: &Value, hash: String) -> Value {
        let full = full_payload(&hash, current);
        self.cache
            .insert(key.to_string(), CachedPayload { value: current.clone(), hash })
            .await;
        full
    }
}

impl Default for DeltaResponseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeltaResponseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaResponseManager").finish_non_exhaustive()
    }
}

/// 16-hex SHA-256 prefix over the canonical payload form.
#[must_use]
pub fn payload_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

fn full_payload(hash: &str, data: &Value) -> Value {
    serde_json::json!({ "type": "full", "hash": hash, "data": data })
}

/// A delta is emitted only when it reconstructs the payload exactly and is
/// at least [`MIN_SAVING`] smaller than the full form.
fn delta_is_worthwhile(previous: &Value, delta: &Value, full: &Value, current: &Value) -> bool {
    if apply_delta(previous, delta) != *current {
        return false;
    }
    let delta_tokens = estimate_tokens(&delta.to_string()) as f64;
    let full_tokens = estimate_tokens(&full.to_string()) as f64;
    delta_tokens <= full_tokens * (1.0 - MIN_SAVING)
}

fn array_delta_by_id(prev: &[Value], next: &[Value], field: &str, hash: &str) -> Value {
    let id_of = |item: &Value| canonical_json(item.get(field).unwrap_or(&Value::Null));
    let prev_ids: std::collections::HashMap<String, &Value> =
        prev.iter().map(|item| (id_of(item), item)).collect();
    let next_ids: std::collections::HashSet<String> = next.iter().map(id_of).collect();

    let added: Vec<&Value> =
        next.iter().filter(|&item| !prev_ids.contains_key(&id_of(item))).collect();
    let removed: Vec<&Value> = prev
        .iter()
        .filter(|&item| !next_ids.contains(&id_of(item)))
        .map(|item| item.get(field).unwrap_or(&Value::Null))
        .collect();
    let updated: Vec<&Value> = next
        .iter()
        .filter(|&item| {
            prev_ids
                .get(&id_of(item))
                .is_some_and(|previous| **previous != *item)
        })
        .collect();

    serde_json::json!({
        "type": "delta",
        "mode": "id",
        "idField": field,
        "hash": hash,
        "added": added,
        "removed": removed,
        "updated": updated,
    })
}

fn array_delta_positional(prev: &[Value], next: &[Value], hash: &str) -> Value {
    let overlap = prev.len().min(next.len());
    let updated: Vec<Value> = (0..overlap)
        .filter(|&i| prev[i] != next[i])
        .map(|i| serde_json::json!({ "index": i, "value": next[i] }))
        .collect();
    let added: Vec<&Value> = next.iter().skip(prev.len()).collect();
    let removed: Vec<usize> = (next.len()..prev.len()).collect();

    serde_json::json!({
        "type": "delta",
        "mode": "positional",
        "hash": hash,
        "updated": updated,
        "added": added,
        "removed": removed,
    })
}

/// Reconstruct the current payload from the previous one plus a delta.
///
/// The inverse of the delta producers above: replaying a stream of deltas
/// from the same starting point converges to the server's value.
#[must_use]
pub fn apply_delta(previous: &Value, delta: &Value) -> Value {
    match delta.get("type").and_then(Value::as_str) {
        Some("full") => match delta.get("data") {
            Some(data) => data.clone(),
            // Unchanged marker: the previous payload is still current.
            None => previous.clone(),
        },
        Some("delta") => match delta.get("mode").and_then(Value::as_str) {
            Some("id") => apply_id_delta(previous, delta),
            Some("positional") => apply_positional_delta(previous, delta),
            _ => previous.clone(),
        },
        Some("update") => apply_object_delta(previous, delta),
        _ => previous.clone(),
    }
}

fn apply_id_delta(previous: &Value, delta: &Value) -> Value {
    let Some(prev) = previous.as_array() else { return previous.clone() };
    let field = delta.get("idField").and_then(Value::as_str).unwrap_or("id");
    let id_of = |item: &Value| canonical_json(item.get(field).unwrap_or(&Value::Null));

    let empty = Vec::new();
    let removed: std::collections::HashSet<String> = delta
        .get("removed")
        .and_then(Value::as_array)
        .unwrap_or(&empty)
        .iter()
        .map(canonical_json)
        .collect();
    let updated: std::collections::HashMap<String, &Value> = delta
        .get("updated")
        .and_then(Value::as_array)
        .unwrap_or(&empty)
        .iter()
        .map(|item| (id_of(item), item))
        .collect();
    let added = delta.get("added").and_then(Value::as_array).unwrap_or(&empty);

    let mut result: Vec<Value> = prev
        .iter()
        .filter(|&item| !removed.contains(&id_of(item)))
        .map(|item| updated.get(&id_of(item)).map_or_else(|| item.clone(), |v| (*v).clone()))
        .collect();
    result.extend(added.iter().cloned());
    Value::Array(result)
}

fn apply_positional_delta(previous: &Value, delta: &Value) -> Value {
    let Some(prev) = previous.as_array() else { return previous.clone() };
    let mut result = prev.clone();

    let empty = Vec::new();
    for update in delta.get("updated").and_then(Value::as_array).unwrap_or(&empty) {
        if let (Some(index), Some(value)) =
            (update.get("index").and_then(Value::as_u64), update.get("value"))
        {
            let index = index as usize;
            if index < result.len() {
                result[index] = value.clone();
            }
        }
    }

    let removed = delta
        .get("removed")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if removed > 0 {
        result.truncate(result.len().saturating_sub(removed));
    }

    if let Some(added) = delta.get("added").and_then(Value::as_array) {
        result.extend(added.iter().cloned());
    }

    Value::Array(result)
}

fn apply_object_delta(previous: &Value, delta: &Value) -> Value {
    let Some(prev) = previous.as_object() else { return previous.clone() };
    let mut result = prev.clone();

    if let Some(changes) = delta.get("changes").and_then(Value::as_object) {
        for (key, change) in changes {
            match change.get("new") {
                Some(new) => {
                    result.insert(key.clone(), new.clone());
                }
                None => {
                    result.remove(key);
                }
            }
        }
    }

    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[(i64, &str)]) -> Value {
        Value::Array(
            ids.iter()
                .map(|(id, name)| serde_json::json!({ "id": id, "name": name }))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_first_query_returns_full() {
        let manager = DeltaResponseManager::new();
        let payload = rows(&[(1, "a"), (2, "b")]);
        let out = manager.get_delta_for_array("k", &payload, Some("id")).await;
        assert_eq!(out["type"], "full");
        assert_eq!(out["data"], payload);
    }

    #[tokio::test]
    async fn test_identical_repeat_returns_marker() {
        let manager = DeltaResponseManager::new();
        let payload = rows(&[(1, "a")]);
        manager.get_delta_for_array("k", &payload, Some("id")).await;

        let out = manager.get_delta_for_array("k", &payload, Some("id")).await;
        assert_eq!(out["type"], "full");
        assert!(out.get("data").is_none());
        assert_eq!(out["previousHash"], payload_hash(&payload));
    }

    #[tokio::test]
    async fn test_id_delta_roundtrip() {
        let manager = DeltaResponseManager::new();
        let names: Vec<String> = (0..12).map(|i| format!("row-{i}-{}", "x".repeat(24))).collect();
        let prev = rows(&names.iter().enumerate().map(|(i, n)| (i as i64, n.as_str())).collect::<Vec<_>>());
        // One update, one removal, one addition.
        let mut changed = names.clone();
        changed[2] = "renamed".to_string();
        changed.remove(7);
        changed.push(format!("row-new-{}", "y".repeat(24)));
        let mut ids: Vec<i64> = (0..12).collect();
        ids.remove(7);
        ids.push(99);
        let next = rows(&ids.iter().zip(changed.iter()).map(|(&i, n)| (i, n.as_str())).collect::<Vec<_>>());
        manager.get_delta_for_array("k", &prev, Some("id")).await;

        let delta = manager.get_delta_for_array("k", &next, Some("id")).await;
        assert_eq!(delta["type"], "delta");
        assert_eq!(delta["mode"], "id");
        assert_eq!(apply_delta(&prev, &delta), next);
    }

    #[tokio::test]
    async fn test_positional_delta_roundtrip() {
        let manager = DeltaResponseManager::new();
        let prev = Value::Array((0..10).map(|i| Value::String(format!("entry-{i}-{}", "z".repeat(20)))).collect());
        let mut items = prev.as_array().unwrap().clone();
        items[3] = Value::String("replaced".to_string());
        let next = Value::Array(items);
        manager.get_delta_for_array("k", &prev, None).await;

        let delta = manager.get_delta_for_array("k", &next, None).await;
        assert_eq!(delta["type"], "delta");
        assert_eq!(delta["mode"], "positional");
        assert_eq!(apply_delta(&prev, &delta), next);
    }

    #[test]
    fn test_id_delta_shapes_apply_exactly() {
        // Exercise the producer/applier pair directly, below the size gate.
        let prev = vec![
            serde_json::json!({"id": 1, "v": "a"}),
            serde_json::json!({"id": 2, "v": "b"}),
            serde_json::json!({"id": 3, "v": "c"}),
        ];
        let next = vec![
            serde_json::json!({"id": 1, "v": "a"}),
            serde_json::json!({"id": 3, "v": "C"}),
            serde_json::json!({"id": 4, "v": "d"}),
        ];
        let delta = array_delta_by_id(&prev, &next, "id", "h");
        assert_eq!(apply_delta(&Value::Array(prev), &delta), Value::Array(next));
    }

    #[test]
    fn test_positional_shrink_applies_exactly() {
        let prev = vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)];
        let next = vec![serde_json::json!(9)];
        let delta = array_delta_positional(&prev, &next, "h");
        assert_eq!(apply_delta(&Value::Array(prev), &delta), Value::Array(next));
    }

    #[tokio::test]
    async fn test_small_payload_falls_back_to_full() {
        let manager = DeltaResponseManager::new();
        // The delta envelope costs more than these tiny payloads save.
        let prev = serde_json::json!([1, 2]);
        let next = serde_json::json!([1, 3]);
        manager.get_delta_for_array("k", &prev, None).await;

        let out = manager.get_delta_for_array("k", &next, None).await;
        assert_eq!(out["type"], "full");
        assert_eq!(out["data"], next);
    }

    #[tokio::test]
    async fn test_object_delta_roundtrip() {
        let manager = DeltaResponseManager::new();
        let mut fields = serde_json::Map::new();
        for i in 0..12 {
            fields.insert(format!("metric_{i}"), serde_json::json!(format!("value-{i}-{}", "m".repeat(16))));
        }
        let prev = Value::Object(fields.clone());
        fields.insert("metric_5".to_string(), serde_json::json!("changed"));
        let next = Value::Object(fields);
        manager.get_delta_for_object("k", &prev).await;

        let delta = manager.get_delta_for_object("k", &next).await;
        assert_eq!(delta["type"], "update");
        assert_eq!(apply_delta(&prev, &delta), next);
    }

    #[tokio::test]
    async fn test_object_delta_key_added_and_removed() {
        let manager = DeltaResponseManager::with_limits(10, std::time::Duration::from_secs(60));
        let prev = serde_json::json!({
            "keep": "000000000000000000000000", "drop": "111111111111111111111111",
            "pad1": "222222222222222222222222", "pad2": "333333333333333333333333",
            "pad3": "444444444444444444444444", "pad4": "666666666666666666666666"
        });
        let next = serde_json::json!({
            "keep": "000000000000000000000000", "fresh": "555555555555555555555555",
            "pad1": "222222222222222222222222", "pad2": "333333333333333333333333",
            "pad3": "444444444444444444444444", "pad4": "666666666666666666666666"
        });
        manager.get_delta_for_object("k", &prev).await;

        let delta = manager.get_delta_for_object("k", &next).await;
        assert_eq!(apply_delta(&prev, &delta), next);
    }

    #[test]
    fn test_apply_full_marker_is_identity() {
        let prev = serde_json::json!([1, 2, 3]);
        let marker = serde_json::json!({ "type": "full", "previousHash": "abc" });
        assert_eq!(apply_delta(&prev, &marker), prev);
    }

    #[test]
    fn test_cache_key_shape() {
        let key = DeltaResponseManager::cache_key("db_query", &serde_json::json!({"sql": "select 1"}));
        assert!(key.starts_with("delta:db_query:"));
        // Same args, different key order, same key.
        let key2 = DeltaResponseManager::cache_key(
            "db_query",
            &serde_json::json!({"sql": "select 1"}),
        );
        assert_eq!(key, key2);
    }
}
