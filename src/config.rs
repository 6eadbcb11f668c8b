//! Configuration types for FlowCore
//!
//! All configuration is plain serde data handed in by the embedding
//! application. Every struct carries `#[serde(default)]` and a `Default`
//! impl with working values, so a partial (or empty) JSON document yields
//! a usable configuration.

use serde::{Deserialize, Serialize};

use crate::limiter::EndpointClass;

/// Top-level configuration for the flow-control core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Per-endpoint-class rate-limit rules
    pub rate_limits: RateLimitConfig,
    /// Context headroom classification thresholds
    pub budget: BudgetConfig,
    /// Streaming transport timeouts and buffers
    pub transport: TransportConfig,
    /// Session fork policy
    pub fork: ForkConfig,
}

impl FlowConfig {
    /// Parse a configuration from a JSON document.
    ///
    /// Missing sections and fields fall back to defaults.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A single sliding-window rule: at most `max_requests` admissions within
/// any `window_secs` interval. A `max_requests` of 0 means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    /// A per-minute rule.
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_secs: 60,
        }
    }
}

/// Per-endpoint-class rate-limit rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub chat: RateLimitRule,
    pub bulk_write: RateLimitRule,
    pub test_run: RateLimitRule,
    pub default: RateLimitRule,
}

impl RateLimitConfig {
    /// The rule for an endpoint class.
    pub fn rule(&self, class: EndpointClass) -> &RateLimitRule {
        match class {
            EndpointClass::Chat => &self.chat,
            EndpointClass::BulkWrite => &self.bulk_write,
            EndpointClass::TestRun => &self.test_run,
            EndpointClass::Default => &self.default,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat: RateLimitRule::per_minute(60),
            bulk_write: RateLimitRule::per_minute(20),
            test_run: RateLimitRule::per_minute(10),
            default: RateLimitRule::per_minute(100),
        }
    }
}

/// Context headroom classification thresholds, as fractions of the active
/// model's context limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// At or above this fraction the session classifies as `warning`
    pub warning_ratio: f64,
    /// Above this fraction the session classifies as `critical`
    pub critical_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_ratio: 0.75,
            critical_ratio: 0.90,
        }
    }
}

/// Streaming transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Deadline for establishing the client-facing channel before
    /// degrading to single-shot delivery
    pub open_timeout_secs: f64,
    /// Capacity of the bounded fragment channel between the provider
    /// adapter and the transport manager
    pub fragment_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: 2.0,
            fragment_buffer: 32,
        }
    }
}

/// Session fork policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// How many trailing messages a fork keeps verbatim by default
    pub keep_last_n: usize,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self { keep_last_n: 10 }
    }
}
