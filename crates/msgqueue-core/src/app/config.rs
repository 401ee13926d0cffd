//! File-friendly queue configuration.
//!
//! Durations are plain milliseconds so a config reads naturally as JSON:
//!
//! ```json
//! {
//!   "name": "emails",
//!   "retry_limit": 5,
//!   "min_backoff_ms": 500,
//!   "rate_limit": { "permits": 10, "interval_ms": 1000, "strategy": "token_bucket" },
//!   "worker_limit": 4
//! }
//! ```
//!
//! `null` for `shutdown_timeout_ms` means "wait for the queue to drain
//! however long it takes"; for `reservation_timeout_ms` it disables the
//! reaper.

use std::time::Duration;

use serde::Deserialize;

use crate::ports::RateLimit;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Epoch-aligned windows over a `CounterStore`. Shareable across processes.
    #[default]
    FixedWindow,
    /// Process-local bucket, refilled continuously. Allows bursts of `permits`.
    TokenBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_permits")]
    pub permits: u32,
    pub interval_ms: u64,
    #[serde(default)]
    pub strategy: RateLimitStrategy,
}

fn default_permits() -> u32 {
    1
}

impl RateLimitConfig {
    pub fn limit(&self) -> RateLimit {
        RateLimit::per(self.permits, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Attempts before a message is dead-lettered. 1 disables retries.
    pub retry_limit: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: Option<u64>,
    pub rate_limit: Option<RateLimitConfig>,
    pub worker_limit: Option<usize>,
    pub shutdown_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    pub reservation_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retry_limit: 1,
            min_backoff_ms: 1_000,
            max_backoff_ms: None,
            rate_limit: None,
            worker_limit: None,
            shutdown_timeout_ms: Some(30_000),
            poll_interval_ms: 1_000,
            reservation_timeout_ms: Some(300_000),
        }
    }
}

impl QueueConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
