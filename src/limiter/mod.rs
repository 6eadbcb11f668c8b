//! Sliding-window rate limiter
//!
//! Admits or rejects inbound requests per `(caller_id, endpoint_class)`
//! using a sliding window of accepted-request timestamps. State is kept in
//! a sharded concurrent map so admission checks for different keys never
//! block each other, while checks for the *same* key are serialized and
//! can never race past the limit.
//!
//! The limiter never errors: every call returns a [`Decision`]. Exhaustion
//! is reported to the caller, not retried internally. Buckets are
//! ephemeral, in-memory, and reset implicitly as timestamps age out.

use crate::config::{RateLimitConfig, RateLimitRule};
use crate::error::FlowError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Endpoint classes with independent rate-limit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Interactive chat turns
    Chat,
    /// Bulk write operations
    BulkWrite,
    /// Test-run triggers
    TestRun,
    /// Everything else
    Default,
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointClass::Chat => write!(f, "chat"),
            EndpointClass::BulkWrite => write!(f, "bulk_write"),
            EndpointClass::TestRun => write!(f, "test_run"),
            EndpointClass::Default => write!(f, "default"),
        }
    }
}

/// Outcome of an admission check.
///
/// Both variants carry the fields the embedding application exposes as
/// rate-limit response headers (limit, remaining count, reset time, and
/// retry-after on denial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request admitted.
    Allowed {
        /// Configured maximum for this endpoint class
        limit: u32,
        /// Admissions left in the current window after this one
        remaining: u32,
        /// Time until the oldest in-window admission expires
        reset_after: Duration,
    },
    /// Request denied; the window is full.
    Denied {
        /// Configured maximum for this endpoint class
        limit: u32,
        /// Time until the oldest in-window admission expires, freeing a slot
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Convert a denial into the corresponding [`FlowError`].
    ///
    /// Returns `Ok(())` for an allowed decision. The retry-after is rounded
    /// up to a whole second so callers never retry early.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            Decision::Allowed { .. } => Ok(()),
            Decision::Denied { retry_after, .. } => Err(FlowError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
            }),
        }
    }
}

type BucketKey = (String, EndpointClass);

/// Drop timestamps that have aged out of the window.
///
/// `cutoff` is `None` when the monotonic clock is younger than the window
/// (shortly after boot); nothing can have aged out yet, so nothing is
/// evicted.
fn prune(timestamps: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else { return };
    while timestamps.front().is_some_and(|&t| t <= cutoff) {
        timestamps.pop_front();
    }
}

/// Sliding-window rate limiter keyed by `(caller_id, endpoint_class)`.
///
/// Per-class rules are static configuration. A `max_requests` of 0 means
/// the class is unlimited.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<BucketKey, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given per-class rules.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// The rule applied to an endpoint class.
    pub fn rule(&self, class: EndpointClass) -> &RateLimitRule {
        self.config.rule(class)
    }

    /// Check whether a request from `caller_id` against `class` is admitted.
    ///
    /// Prunes timestamps older than the window, admits iff the pruned count
    /// is under the limit, and appends `now` on admission. Denials report
    /// how long until the oldest in-window timestamp expires.
    pub fn admit(&self, caller_id: &str, class: EndpointClass) -> Decision {
        let rule = self.config.rule(class);
        let limit = rule.max_requests;
        let window = Duration::from_secs(rule.window_secs);

        if limit == 0 {
            return Decision::Allowed {
                limit,
                remaining: u32::MAX,
                reset_after: Duration::ZERO,
            };
        }

        let now = Instant::now();

        // The entry guard holds the shard lock for this key, serializing
        // concurrent admissions on the same (caller, class) pair.
        let mut timestamps = self
            .buckets
            .entry((caller_id.to_string(), class))
            .or_default();

        prune(&mut timestamps, now.checked_sub(window));

        if timestamps.len() >= limit as usize {
            let oldest = *timestamps.front().unwrap_or(&now);
            let retry_after = (oldest + window).saturating_duration_since(now);
            tracing::debug!(caller = caller_id, %class, "rate limit denied");
            return Decision::Denied { limit, retry_after };
        }

        timestamps.push_back(now);
        let oldest = *timestamps.front().unwrap_or(&now);
        Decision::Allowed {
            limit,
            remaining: limit - timestamps.len() as u32,
            reset_after: (oldest + window).saturating_duration_since(now),
        }
    }

    /// Drop buckets whose windows have fully aged out (call periodically).
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|(_, class), timestamps| {
            let window = Duration::from_secs(self.config.rule(*class).window_secs);
            prune(timestamps, now.checked_sub(window));
            !timestamps.is_empty()
        });
    }

    /// Number of tracked buckets (for testing).
    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
