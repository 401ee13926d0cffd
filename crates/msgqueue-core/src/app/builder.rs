//! QueueBuilder: wiring and fail-fast validation.
//!
//! Every collaborator is injected here and nowhere else. Unset ones default
//! to the in-process implementations:
//! - storage: `MemoryStorage`
//! - clock: `SystemClock`
//! - event sink: `TracingEventSink`
//! - rate limiter: none, or a `WindowLimiter` over `MemoryCounterStore` when
//!   only a `RateLimit` is given

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use super::config::{QueueConfig, RateLimitStrategy};
use super::processor::{InFlight, Processor, Signals};
use super::queue::Queue;
use super::reaper_loop::ReaperLoop;
use crate::domain::{BuildError, RetryPolicy};
use crate::handler::{FnHandler, Handler, HandlerFunc};
use crate::impls::{MemoryCounterStore, MemoryStorage, TokenBucketLimiter, TracingEventSink, WindowLimiter};
use crate::ports::{Clock, CounterStore, EventSink, RateLimit, RateLimiter, Storage, SystemClock, Unlimited};

/// Builds a [`Queue`].
///
/// ```ignore
/// let queue = QueueBuilder::new("emails")
///     .handler_fn(send_email)
///     .retry_limit(5)
///     .min_backoff(Duration::from_millis(500))
///     .rate_limit(RateLimit::every(Duration::from_secs(1)))
///     .worker_limit(4)
///     .build()?;
/// ```
///
/// `build()` checks the configuration before anything is spawned and
/// returns the first problem as a `BuildError`.
pub struct QueueBuilder {
    name: String,
    handler: Option<Arc<dyn Handler>>,
    retry: RetryPolicy,
    rate_limit: Option<RateLimit>,
    strategy: RateLimitStrategy,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    counter_store: Option<Arc<dyn CounterStore>>,
    worker_limit: Option<usize>,
    storage: Option<Arc<dyn Storage>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    shutdown_timeout: Option<Duration>,
    poll_interval: Duration,
    reservation_timeout: Option<Duration>,
}

impl QueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(QueueConfig {
            name: name.into(),
            ..QueueConfig::default()
        })
    }

    /// Start from a config. Handler and collaborators are still set in code.
    pub fn from_config(config: QueueConfig) -> Self {
        let mut retry = RetryPolicy::new(config.retry_limit, Duration::from_millis(config.min_backoff_ms));
        if let Some(max) = config.max_backoff_ms {
            retry = retry.with_max_backoff(Duration::from_millis(max));
        }
        Self {
            name: config.name,
            handler: None,
            retry,
            rate_limit: config.rate_limit.as_ref().map(|r| r.limit()),
            strategy: config.rate_limit.map(|r| r.strategy).unwrap_or_default(),
            rate_limiter: None,
            counter_store: None,
            worker_limit: config.worker_limit,
            storage: None,
            clock: None,
            events: None,
            shutdown_timeout: config.shutdown_timeout_ms.map(Duration::from_millis),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            reservation_timeout: config.reservation_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use a plain async function over typed arguments as the handler.
    pub fn handler_fn<F, Args>(self, func: F) -> Self
    where
        F: HandlerFunc<Args>,
        Args: 'static,
    {
        self.handler(FnHandler::new(func))
    }

    /// Total attempts per message. 0 and 1 disable retries.
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry.retry_limit = retry_limit.max(1);
        self
    }

    pub fn min_backoff(mut self, min_backoff: Duration) -> Self {
        self.retry.min_backoff = min_backoff;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.retry.max_backoff = Some(max_backoff);
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn rate_limit_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Counters for the fixed-window limiter. Pass a shared store to enforce
    /// one limit across processes.
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// A fully custom limiter. Takes precedence over `rate_limit`.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = Some(limit);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// `None` lets `close` wait for the queue to drain indefinitely.
    pub fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Upper bound between storage polls when nothing wakes the dispatcher.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `None` disables reclaiming reservations left by dead processes.
    pub fn reservation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.name.trim().is_empty() {
            return Err(BuildError::EmptyName);
        }
        if self.handler.is_none() {
            return Err(BuildError::MissingHandler);
        }
        if self.worker_limit == Some(0) {
            return Err(BuildError::ZeroWorkerLimit);
        }
        if self.rate_limiter.is_none() && self.rate_limit.is_some_and(|l| !l.is_valid()) {
            return Err(BuildError::InvalidRateLimit);
        }
        if self.poll_interval.is_zero() {
            return Err(BuildError::ZeroPollInterval);
        }
        if self.reservation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroReservationTimeout);
        }
        Ok(())
    }

    /// Validate, then start the queue on the current tokio runtime.
    pub fn build(self) -> Result<Queue, BuildError> {
        self.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let handler = self.handler.ok_or(BuildError::MissingHandler)?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let storage: Arc<dyn Storage> = self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));

        let limiter: Arc<dyn RateLimiter> = match (self.rate_limiter, self.rate_limit) {
            (Some(limiter), _) => limiter,
            (None, Some(limit)) => match self.strategy {
                RateLimitStrategy::FixedWindow => {
                    let store = self
                        .counter_store
                        .unwrap_or_else(|| Arc::new(MemoryCounterStore::new(Arc::clone(&clock))));
                    Arc::new(WindowLimiter::new(self.name.clone(), limit, store, Arc::clone(&clock)))
                }
                RateLimitStrategy::TokenBucket => Arc::new(TokenBucketLimiter::new(limit, Arc::clone(&clock))),
            },
            (None, None) => Arc::new(Unlimited),
        };

        let signals = Arc::new(Signals::default());
        let in_flight = InFlight::default();

        let reaper = self.reservation_timeout.map(|timeout| ReaperLoop {
            queue: self.name.clone(),
            storage: Arc::clone(&storage),
            clock: Arc::clone(&clock),
            events: Arc::clone(&events),
            signals: Arc::clone(&signals),
            in_flight: in_flight.clone(),
            timeout,
        });

        let processor = Processor {
            queue: self.name,
            storage,
            handler,
            limiter,
            retry: self.retry,
            clock,
            events,
            workers: self.worker_limit.map(|n| Arc::new(Semaphore::new(n))),
            poll_interval: self.poll_interval,
            signals,
            in_flight,
        };

        Ok(Queue::start(processor, reaper, self.shutdown_timeout))
    }
}
