//! Per-session memory of delivered content.
//!
//! Keyed by a 16-hex SHA-256 digest over `{type, name, content}`; a hit
//! within the recall window replaces the payload with a short reference
//! string instead of redelivering it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::defaults;

use super::estimate_tokens;

/// Kinds of content the dedup layer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Schema,
    Result,
    Skill,
}

impl ContentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Result => "result",
            Self::Skill => "skill",
        }
    }
}

#[derive(Debug, Clone)]
struct SentEntry {
    kind: ContentKind,
    name: String,
    sent_at: Instant,
    token_estimate: u64,
}

/// Counters reported on `context_status`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub duplicates_avoided: u64,
    pub tokens_saved: u64,
}

/// Dedup store for one upstream session.
#[derive(Debug)]
pub struct SessionContext {
    sent: HashMap<String, SentEntry>,
    window: Duration,
    stats: DedupStats,
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(defaults::DEDUP_WINDOW)
    }

    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self { sent: HashMap::new(), window, stats: DedupStats::default() }
    }

    /// Return `content` the first time it is seen, a reference placeholder
    /// on every repeat within the recall window.
    pub fn get_optimized(&mut self, kind: ContentKind, name: &str, content: &str) -> String {
        self.prune();

        let key = content_digest(kind, name, content);
        if let Some(entry) = self.sent.get(&key) {
            if entry.sent_at.elapsed() < self.window {
                self.stats.duplicates_avoided += 1;
                self.stats.tokens_saved += entry.token_estimate;
                return format!(
                    "[See {} \"{}\" sent earlier in conversation]",
                    entry.kind.as_str(),
                    entry.name
                );
            }
        }

        self.sent.insert(
            key,
            SentEntry {
                kind,
                name: name.to_string(),
                sent_at: Instant::now(),
                token_estimate: estimate_tokens(content),
            },
        );
        content.to_string()
    }

    /// Whether this exact content was already delivered within the window.
    #[must_use]
    pub fn was_sent(&self, kind: ContentKind, name: &str, content: &str) -> bool {
        let key = content_digest(kind, name, content);
        self.sent
            .get(&key)
            .is_some_and(|entry| entry.sent_at.elapsed() < self.window)
    }

    /// Dedup counters.
    #[must_use]
    pub const fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    fn prune(&mut self) {
        let window = self.window;
        self.sent.retain(|_, entry| entry.sent_at.elapsed() < window);
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// 16-hex SHA-256 prefix over the canonical `{type, name, content}` form.
#[must_use]
pub fn content_digest(kind: ContentKind, name: &str, content: &str) -> String {
    let canonical = serde_json::json!({
        "content": content,
        "name": name,
        "type": kind.as_str(),
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}
