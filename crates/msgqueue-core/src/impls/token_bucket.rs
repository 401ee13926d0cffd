//! Local token-bucket rate limiter.
//!
//! Smoother than the fixed window: tokens refill continuously at
//! `permits / interval` and the bucket holds at most `permits` tokens, so no
//! sliding window ever sees more than `permits` grants. Process-local only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::RateLimitError;
use crate::ports::{Clock, RateLimit, RateLimiter};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate_per_second: f64,
    burst: f64,
    last_refill: DateTime<Utc>,
}

impl Bucket {
    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).to_std().unwrap_or(Duration::ZERO);
        if !elapsed.is_zero() {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.burst);
            self.last_refill = now;
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.rate_per_second))
    }
}

pub struct TokenBucketLimiter {
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Starts full. `limit` must be valid (see `RateLimit::is_valid`).
    pub fn new(limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        let burst = f64::from(limit.permits);
        let rate_per_second = burst / limit.interval.as_secs_f64().max(f64::MIN_POSITIVE);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                rate_per_second,
                burst,
                last_refill: clock.now(),
            }),
            clock,
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.clock.now());
                match bucket.try_take() {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = self.clock.sleep(wait) => {}
            }
        }
    }
}
