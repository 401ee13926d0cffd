//! Retry policy: decides, after a failed attempt, whether and when to retry.

use std::time::Duration;

use super::errors::HandlerError;

/// Exponential backoff bounded by a total attempt budget.
///
/// Pure: the decision depends only on the failure and the retry count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum total attempts, at least 1. `new` maps 0 to 1, so both mean
    /// "never retry".
    pub retry_limit: u32,

    /// Delay before the first retry; doubles for each later one.
    pub min_backoff: Duration,

    /// Upper bound for a single delay.
    pub max_backoff: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the message visible again after `delay`. `retry_count` is the new count.
    Retry { retry_count: u32, delay: Duration },

    /// Stop. `retry_count` is the final count of failed attempts.
    Dead { retry_count: u32 },
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, min_backoff: Duration) -> Self {
        Self {
            retry_limit: retry_limit.max(1),
            min_backoff,
            max_backoff: None,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::from_secs(1))
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    /// Delay before attempt `retry_count + 1`, i.e. `min_backoff * 2^(retry_count - 1)`.
    ///
    /// The first attempt (`retry_count == 0`) has no delay.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry_count - 1).unwrap_or(u32::MAX);
        let delay = self
            .min_backoff
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        match self.max_backoff {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Decide what happens after an attempt failed with `error`.
    ///
    /// `retry_count` is the number of failures before this one. The count
    /// recorded on a dead message never exceeds the limit.
    pub fn decide(&self, retry_count: u32, error: &HandlerError) -> RetryDecision {
        let limit = self.retry_limit.max(1);
        let retry_count = retry_count.saturating_add(1);
        if error.is_permanent() || retry_count >= limit {
            return RetryDecision::Dead {
                retry_count: retry_count.min(limit),
            };
        }
        RetryDecision::Retry {
            retry_count,
            delay: self.backoff(retry_count),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}
