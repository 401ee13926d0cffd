//! RateLimiter port.
//!
//! A limiter gates handler invocations across all workers. Shared limiters
//! are built on a `CounterStore` whose `incr` is atomic, so cooperating
//! processes cannot jointly exceed the configured rate.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::RateLimitError;

/// "At most `permits` operations per `interval`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub permits: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// One permit per `interval`.
    pub fn every(interval: Duration) -> Self {
        Self {
            permits: 1,
            interval,
        }
    }

    pub fn per(permits: u32, interval: Duration) -> Self {
        Self { permits, interval }
    }

    pub fn is_valid(&self) -> bool {
        self.permits > 0 && !self.interval.is_zero()
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait for a permit.
    ///
    /// Returns `RateLimitError::Cancelled` once `cancel` fires and
    /// `RateLimitError::Unavailable` when a shared backend cannot be reached.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError>;
}

/// No limit configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if cancel.is_cancelled() {
            return Err(RateLimitError::Cancelled);
        }
        Ok(())
    }
}

/// Atomic counters with expiry, as offered by a shared key-value store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new value. A new key expires after `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError>;
}
