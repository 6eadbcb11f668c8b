//! Token/context budget tracking
//!
//! Accumulates token usage per session and classifies each session's
//! remaining context headroom as `ok` / `warning` / `critical` against a
//! provider-specific limit. The tracker only classifies; it never triggers
//! forking itself.
//!
//! Counters live in a sharded concurrent map: `record` calls for the same
//! session are serialized by the per-key entry lock (no lost increments),
//! while different sessions never contend.

use crate::config::BudgetConfig;
use crate::session::{Message, TokenUsage};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Classification of a session's context headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadroomLevel {
    /// Comfortably under the limit
    Ok,
    /// Approaching the limit; a fork will be recommended soon
    Warning,
    /// Near exhaustion; forking is recommended now
    Critical,
}

/// Derived view of a session's context consumption.
///
/// Computed on demand from the tracked usage; never persisted
/// independently of it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextHeadroom {
    /// Tokens consumed so far
    pub current_tokens: u64,
    /// The active model's context limit
    pub limit_tokens: u64,
    /// Consumption as a percentage of the limit
    pub percentage: f64,
    /// Classification against the configured thresholds
    pub classification: HeadroomLevel,
}

impl ContextHeadroom {
    /// Whether a fork should be recommended to the caller.
    pub fn fork_recommended(&self) -> bool {
        self.classification == HeadroomLevel::Critical
    }
}

/// Local token estimation for providers that do not report usage.
///
/// The estimation strategy is pluggable per provider adapter; estimates
/// must be non-negative (enforced by the `u64` return type).
pub trait TokenEstimator: Send + Sync {
    /// Estimate the token count of a piece of text.
    fn estimate(&self, text: &str) -> u64;

    /// Estimate the total token count of a message sequence, preferring
    /// per-message counts where they are known.
    fn estimate_messages(&self, messages: &[Message]) -> u64 {
        messages
            .iter()
            .map(|m| m.tokens.unwrap_or_else(|| self.estimate(&m.content)))
            .sum()
    }
}

/// Word-count token estimator.
///
/// Uses `words * 1.3 + 4` per text, a deliberately rough heuristic that
/// errs high for English prose. Adapters that report native usage bypass
/// estimation entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountEstimator;

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let words = text.split_whitespace().count() as f64;
        (words * 1.3 + 4.0) as u64
    }
}

/// Per-session token usage tracker with headroom classification.
pub struct BudgetTracker {
    thresholds: BudgetConfig,
    usage: DashMap<String, TokenUsage>,
}

impl BudgetTracker {
    /// Create a tracker with the given classification thresholds.
    pub fn new(thresholds: BudgetConfig) -> Self {
        Self {
            thresholds,
            usage: DashMap::new(),
        }
    }

    /// Seed the tracker with a session's existing aggregate usage, e.g.
    /// when a persisted session is first seen by this process.
    ///
    /// Does nothing if the session is already tracked.
    pub fn seed(&self, session_id: &str, usage: TokenUsage) {
        self.usage.entry(session_id.to_string()).or_insert(usage);
    }

    /// Add a completed turn's usage delta and return the resulting
    /// headroom against `limit_tokens`.
    ///
    /// Updates for the same session are serialized; updates for different
    /// sessions proceed in parallel.
    pub fn record(
        &self,
        session_id: &str,
        delta: &TokenUsage,
        limit_tokens: u64,
    ) -> ContextHeadroom {
        let mut entry = self.usage.entry(session_id.to_string()).or_default();
        entry.add(delta);
        let current = entry.total_tokens;
        drop(entry);

        let headroom = self.classify(current, limit_tokens);
        if headroom.classification != HeadroomLevel::Ok {
            tracing::info!(
                session = session_id,
                current_tokens = current,
                limit_tokens,
                classification = ?headroom.classification,
                "context headroom threshold crossed"
            );
        }
        headroom
    }

    /// Current headroom for a session, without recording anything.
    ///
    /// An untracked session reads as zero usage.
    pub fn headroom(&self, session_id: &str, limit_tokens: u64) -> ContextHeadroom {
        let current = self.usage_for(session_id).total_tokens;
        self.classify(current, limit_tokens)
    }

    /// The tracked aggregate usage for a session (zero if untracked).
    pub fn usage_for(&self, session_id: &str) -> TokenUsage {
        self.usage
            .get(session_id)
            .map(|u| *u)
            .unwrap_or_default()
    }

    fn classify(&self, current_tokens: u64, limit_tokens: u64) -> ContextHeadroom {
        // A zero limit means no room at all; classify as critical.
        let ratio = if limit_tokens == 0 {
            1.0
        } else {
            current_tokens as f64 / limit_tokens as f64
        };
        let classification = if ratio > self.thresholds.critical_ratio {
            HeadroomLevel::Critical
        } else if ratio >= self.thresholds.warning_ratio {
            HeadroomLevel::Warning
        } else {
            HeadroomLevel::Ok
        };
        ContextHeadroom {
            current_tokens,
            limit_tokens,
            percentage: ratio * 100.0,
            classification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> BudgetTracker {
        BudgetTracker::new(BudgetConfig::default())
    }

    #[test]
    fn test_record_accumulates_and_totals() {
        let tracker = tracker();
        tracker.record("s1", &TokenUsage::new(100, 50), 10_000);
        let headroom = tracker.record("s1", &TokenUsage::new(10, 40), 10_000);

        assert_eq!(headroom.current_tokens, 200);
        let usage = tracker.usage_for("s1");
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
    }

    #[test]
    fn test_classification_bands() {
        let tracker = tracker();
        // < 75% -> ok
        let h = tracker.record("a", &TokenUsage::new(700, 0), 1000);
        assert_eq!(h.classification, HeadroomLevel::Ok);
        // exactly 75% -> warning
        let h = tracker.record("b", &TokenUsage::new(750, 0), 1000);
        assert_eq!(h.classification, HeadroomLevel::Warning);
        // exactly 90% -> still warning (75-90% band)
        let h = tracker.record("c", &TokenUsage::new(900, 0), 1000);
        assert_eq!(h.classification, HeadroomLevel::Warning);
        // > 90% -> critical
        let h = tracker.record("d", &TokenUsage::new(901, 0), 1000);
        assert_eq!(h.classification, HeadroomLevel::Critical);
        assert!(h.fork_recommended());
    }

    #[test]
    fn test_headroom_without_recording() {
        let tracker = tracker();
        let h = tracker.headroom("untracked", 1000);
        assert_eq!(h.current_tokens, 0);
        assert_eq!(h.classification, HeadroomLevel::Ok);
    }

    #[test]
    fn test_zero_limit_is_critical() {
        let tracker = tracker();
        let h = tracker.headroom("s1", 0);
        assert_eq!(h.classification, HeadroomLevel::Critical);
    }

    #[test]
    fn test_seed_is_idempotent() {
        let tracker = tracker();
        tracker.seed("s1", TokenUsage::new(100, 0));
        tracker.seed("s1", TokenUsage::new(999, 999));
        assert_eq!(tracker.usage_for("s1").total_tokens, 100);
    }

    #[test]
    fn test_percentage() {
        let tracker = tracker();
        let h = tracker.record("s1", &TokenUsage::new(250, 250), 1000);
        assert!((h.percentage - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_record_no_lost_updates() {
        use std::sync::Arc;

        let tracker = Arc::new(tracker());
        let n_threads = 8;
        let per_thread = 100;
        let mut handles = Vec::new();
        for _ in 0..n_threads {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..per_thread {
                    tracker.record("shared", &TokenUsage::new(2, 3), 1_000_000);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let usage = tracker.usage_for("shared");
        assert_eq!(usage.total_tokens, n_threads * per_thread * 5);
        assert_eq!(usage.input_tokens, n_threads * per_thread * 2);
    }

    #[test]
    fn test_word_count_estimator() {
        let estimator = WordCountEstimator;
        assert_eq!(estimator.estimate(""), 0);
        // 10 words -> 10 * 1.3 + 4 = 17
        assert_eq!(
            estimator.estimate("one two three four five six seven eight nine ten"),
            17
        );
    }

    #[test]
    fn test_estimate_messages_prefers_known_counts() {
        use crate::session::Message;

        let estimator = WordCountEstimator;
        let messages = vec![
            Message::user("one two three").with_tokens(50),
            Message::assistant("one two three"),
        ];
        // 50 (known) + 3 * 1.3 + 4 = 50 + 7
        assert_eq!(estimator.estimate_messages(&messages), 57);
    }
}
