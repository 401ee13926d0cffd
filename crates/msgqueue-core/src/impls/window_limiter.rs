//! Fixed-window rate limiter over an atomic counter store.
//!
//! Windows are aligned to the clock's epoch, so every process sharing the
//! counter store agrees on window boundaries. A caller arriving late in a
//! window may be followed by one more right after the boundary, so any
//! sliding window of length `interval` sees at most `permits + 1` grants
//! during a burst, settling to `permits` per window afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::RateLimitError;
use crate::ports::{Clock, CounterStore, RateLimit, RateLimiter};

pub struct WindowLimiter {
    key: String,
    limit: RateLimit,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl WindowLimiter {
    /// `key` namespaces the counters; processes sharing a limit share a key.
    pub fn new(
        key: impl Into<String>,
        limit: RateLimit,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.into(),
            limit,
            store,
            clock,
        }
    }

    fn interval_ms(&self) -> i64 {
        i64::try_from(self.limit.interval.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }

    /// Index of the window containing `now`, and time left until it ends.
    fn window(&self, now: DateTime<Utc>) -> (i64, Duration) {
        let interval = self.interval_ms();
        let millis = now.timestamp_millis();
        let index = millis.div_euclid(interval);
        let elapsed_ns = (millis.rem_euclid(interval) as u64) * 1_000_000
            + u64::from(now.timestamp_subsec_nanos() % 1_000_000);
        let remaining = Duration::from_millis(interval as u64)
            .saturating_sub(Duration::from_nanos(elapsed_ns));
        (index, remaining)
    }
}

#[async_trait]
impl RateLimiter for WindowLimiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            let (index, remaining) = self.window(self.clock.now());
            let counter = format!("{}:{}", self.key, index);
            let count = self.store.incr(&counter, self.limit.interval).await?;
            if count <= u64::from(self.limit.permits) {
                return Ok(());
            }

            debug!(key = %self.key, window = index, wait_ms = remaining.as_millis() as u64, "rate limit reached");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = self.clock.sleep(remaining) => {}
            }
        }
    }
}

/// `CounterStore` kept in process memory.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, RateLimitError> {
        let now = self.clock.now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let expires_at = crate::domain::message::after(now, ttl);
        let (count, _) = counters.entry(key.to_string()).or_insert((0, expires_at));
        *count += 1;
        Ok(*count)
    }
}
