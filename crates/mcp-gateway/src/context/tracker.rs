//! Per-session token accounting.
//!
//! Tracks a character-count token estimate by category and derives discrete
//! warning levels so clients can be told when a conversation is close to its
//! context limit. Advisory only: the gateway never refuses an operation over
//! it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::defaults;

/// Spending categories tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Schemas,
    Results,
    Code,
    Other,
}

/// Discrete fill levels, from thresholds 50/70/85/95 percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl WarningLevel {
    fn from_percent(percent: f64) -> Self {
        if percent >= 95.0 {
            Self::Critical
        } else if percent >= 85.0 {
            Self::High
        } else if percent >= 70.0 {
            Self::Medium
        } else if percent >= 50.0 {
            Self::Low
        } else {
            Self::None
        }
    }

    const fn recommendation(self) -> &'static str {
        match self {
            Self::None => "Context usage is healthy.",
            Self::Low => "Over half the context budget is spent; prefer compact tool output.",
            Self::Medium => "Context filling up; request minimal fields and use delta responses.",
            Self::High => "Context nearly full; summarize results instead of fetching more detail.",
            Self::Critical => "Context critically full; further large responses may be truncated by the client.",
        }
    }
}

/// Token totals per category.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub schemas: u64,
    pub results: u64,
    pub code: u64,
    pub other: u64,
}

impl CategoryBreakdown {
    const fn total(&self) -> u64 {
        self.schemas + self.results + self.code + self.other
    }
}

/// One recent tool call, kept for the status report.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentCall {
    pub tool: String,
    pub tokens: u64,
    pub at: DateTime<Utc>,
}

/// Status report returned by `context_status`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub tokens_used: u64,
    pub limit: u64,
    pub percent_used: f64,
    pub warning_level: WarningLevel,
    pub recommendation: &'static str,
    pub breakdown_by_category: CategoryBreakdown,
    pub recent_tool_calls: Vec<RecentCall>,
}

/// Running token estimate for one upstream session.
#[derive(Debug)]
pub struct ContextTracker {
    limit: u64,
    breakdown: CategoryBreakdown,
    recent: VecDeque<RecentCall>,
}

/// Recent tool calls retained for the status report.
const RECENT_CALLS: usize = 10;

impl ContextTracker {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            breakdown: CategoryBreakdown::default(),
            recent: VecDeque::with_capacity(RECENT_CALLS),
        }
    }

    /// Record spent tokens. `tool` attributes the spend to a tool call in
    /// the recent-calls report.
    pub fn ingest(&mut self, category: Category, tokens: u64, tool: Option<&str>) {
        match category {
            Category::Schemas => self.breakdown.schemas += tokens,
            Category::Results => self.breakdown.results += tokens,
            Category::Code => self.breakdown.code += tokens,
            Category::Other => self.breakdown.other += tokens,
        }

        if let Some(tool) = tool {
            if self.recent.len() == RECENT_CALLS {
                self.recent.pop_front();
            }
            self.recent.push_back(RecentCall {
                tool: tool.to_string(),
                tokens,
                at: Utc::now(),
            });
        }
    }

    /// Tokens spent so far (sum of all categories).
    #[must_use]
    pub const fn tokens_used(&self) -> u64 {
        self.breakdown.total()
    }

    /// Current fill percentage.
    #[must_use]
    pub fn percent_used(&self) -> f64 {
        self.tokens_used() as f64 / self.limit as f64 * 100.0
    }

    /// Full status report.
    #[must_use]
    pub fn status(&self) -> ContextStatus {
        let percent = self.percent_used();
        let level = WarningLevel::from_percent(percent);
        ContextStatus {
            tokens_used: self.tokens_used(),
            limit: self.limit,
            percent_used: percent,
            warning_level: level,
            recommendation: level.recommendation(),
            breakdown_by_category: self.breakdown,
            recent_tool_calls: self.recent.iter().cloned().collect(),
        }
    }

    /// Whether delivering `estimated` more tokens would cross the critical
    /// threshold (95 percent) or overflow the limit outright.
    #[must_use]
    pub fn should_warn(&self, estimated: u64) -> bool {
        let projected = (self.tokens_used() + estimated) as f64 / self.limit as f64 * 100.0;
        projected >= 95.0
    }

    /// Suggested token budget for the next response:
    /// `max(100, ceil(0.2 * remaining))`.
    #[must_use]
    pub fn suggested_budget(&self) -> u64 {
        let remaining = self.limit.saturating_sub(self.tokens_used());
        ((remaining as f64 * 0.2).ceil() as u64).max(100)
    }
}

impl Default for ContextTracker {
    fn default() -> Self {
        Self::new(defaults::CONTEXT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_sums_to_total() {
        let mut tracker = ContextTracker::new(1_000);
        tracker.ingest(Category::Schemas, 100, None);
        tracker.ingest(Category::Results, 200, Some("db_query"));
        tracker.ingest(Category::Code, 50, None);
        tracker.ingest(Category::Other, 25, None);

        let status = tracker.status();
        assert_eq!(status.tokens_used, 375);
        assert_eq!(
            status.breakdown_by_category.schemas
                + status.breakdown_by_category.results
                + status.breakdown_by_category.code
                + status.breakdown_by_category.other,
            status.tokens_used
        );
    }

    #[test]
    fn test_warning_levels() {
        let mut tracker = ContextTracker::new(100);
        assert_eq!(tracker.status().warning_level, WarningLevel::None);

        tracker.ingest(Category::Results, 50, None);
        assert_eq!(tracker.status().warning_level, WarningLevel::Low);

        tracker.ingest(Category::Results, 20, None);
        assert_eq!(tracker.status().warning_level, WarningLevel::Medium);

        tracker.ingest(Category::Results, 15, None);
        assert_eq!(tracker.status().warning_level, WarningLevel::High);

        tracker.ingest(Category::Results, 10, None);
        assert_eq!(tracker.status().warning_level, WarningLevel::Critical);
    }

    #[test]
    fn test_should_warn_on_projection() {
        let mut tracker = ContextTracker::new(100);
        tracker.ingest(Category::Results, 80, None);

        assert!(!tracker.should_warn(10)); // 90%
        assert!(tracker.should_warn(15)); // 95%
        assert!(tracker.should_warn(40)); // over 100%
    }

    #[test]
    fn test_suggested_budget() {
        let mut tracker = ContextTracker::new(10_000);
        assert_eq!(tracker.suggested_budget(), 2_000);

        tracker.ingest(Category::Results, 9_900, None);
        // 20% of the remaining 100 would be 20; clamped to the floor.
        assert_eq!(tracker.suggested_budget(), 100);
    }

    #[test]
    fn test_recent_calls_capped_at_ten() {
        let mut tracker = ContextTracker::new(1_000_000);
        for i in 0..15 {
            tracker.ingest(Category::Results, 10, Some(&format!("tool{i}")));
        }
        let status = tracker.status();
        assert_eq!(status.recent_tool_calls.len(), 10);
        assert_eq!(status.recent_tool_calls[0].tool, "tool5");
        assert_eq!(status.recent_tool_calls[9].tool, "tool14");
    }
}
