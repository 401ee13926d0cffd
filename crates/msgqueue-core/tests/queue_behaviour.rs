//! End-to-end queue behaviour on virtual time.
//!
//! Every test runs with tokio's clock paused, so sleeps resolve instantly
//! and elapsed times are exact up to timer granularity.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use msgqueue_core::domain::{MessageState, RateLimitError, StorageError};
use msgqueue_core::impls::MemoryStorage;
use msgqueue_core::ports::{Clock, EventSink, RateLimiter, Storage, SystemClock};
use msgqueue_core::{
    Message, MessageId, PutOutcome, QueueBuilder, QueueError, QueueEvent, RateLimit,
};

/// Elapsed times, in call order.
#[derive(Clone, Default)]
struct Timeline(Arc<Mutex<Vec<Duration>>>);

impl Timeline {
    fn mark(&self, start: Instant) {
        self.0.lock().unwrap().push(start.elapsed());
    }

    fn secs_floor(&self) -> Vec<u64> {
        let mut secs: Vec<u64> = self.0.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        secs.sort();
        secs
    }

    fn secs_ceil(&self) -> Vec<u64> {
        let mut secs: Vec<u64> = self
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_millis().div_ceil(1000) as u64)
            .collect();
        secs.sort();
        secs
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<QueueEvent>>);

impl RecordingSink {
    fn events(&self) -> Vec<QueueEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: QueueEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn half_past() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(500)
}

#[tokio::test(start_paused = true)]
async fn failing_handler_backs_off_exponentially() {
    let start = Instant::now();
    let calls = Timeline::default();
    let queue = QueueBuilder::new("backoff")
        .handler_fn({
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.mark(start);
                    Err::<(), _>("always fails")
                }
            }
        })
        .retry_limit(3)
        .min_backoff(Duration::from_secs(1))
        .build()
        .unwrap();

    let id = queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(calls.secs_floor(), vec![0, 1, 3]);
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("always fails"));

    queue.close().await.unwrap();
    assert_eq!(calls.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn delayed_message_waits_for_its_delay() {
    let start = Instant::now();
    let calls = Timeline::default();
    let queue = QueueBuilder::new("delay")
        .handler_fn({
            let calls = calls.clone();
            move |_name: String| {
                let calls = calls.clone();
                async move { calls.mark(start) }
            }
        })
        .build()
        .unwrap();

    queue
        .add(Message::from_args(vec![serde_json::json!("world")]).with_delay(Duration::from_secs(1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(calls.len(), 0);

    queue.close().await.unwrap();
    let elapsed = calls.0.lock().unwrap()[0];
    assert!(elapsed >= Duration::from_secs(1), "dispatched early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1100), "dispatched late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_allows_one_per_second() {
    let start = Instant::now();
    let done = Timeline::default();
    let queue = QueueBuilder::new("limited")
        .handler_fn({
            let done = done.clone();
            move |_name: String| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.mark(start);
                }
            }
        })
        .rate_limit(RateLimit::every(Duration::from_secs(1)))
        .clock(Arc::new(SystemClock::anchored_at(half_past())))
        .build()
        .unwrap();

    for _ in 0..5 {
        queue.call(("world",)).await.unwrap();
    }
    queue.close().await.unwrap();

    assert_eq!(done.secs_ceil(), vec![1, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn call_once_collapses_duplicates() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let queue = QueueBuilder::new("once")
        .handler_fn({
            let seen = seen.clone();
            move |name: String| {
                let seen = seen.clone();
                async move { seen.lock().unwrap().push(name) }
            }
        })
        .build()
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..10 {
        outcomes.push(queue.call_once(Duration::from_secs(1), ("world",)).await.unwrap());
    }
    assert!(!outcomes[0].is_duplicate());
    assert!(outcomes[1..].iter().all(|o| o.is_duplicate() && o.id() == outcomes[0].id()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["world".to_string()]);

    // Dispatched, so the identity starts a new window.
    let again = queue.call_once(Duration::from_secs(1), ("world",)).await.unwrap();
    assert!(!again.is_duplicate());
    assert_ne!(again.id(), outcomes[0].id());

    // A different identity never collides.
    let other = queue.call_once(Duration::from_secs(1), ("moon",)).await.unwrap();
    assert!(!other.is_duplicate());

    queue.close().await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_call_once_admits_one_message() {
    let storage = Arc::new(MemoryStorage::new());
    let seen = Arc::new(AtomicU32::new(0));
    let queue = Arc::new(
        QueueBuilder::new("once-racing")
            .handler_fn({
                let seen = seen.clone();
                move |_name: String| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .storage(storage.clone())
            .build()
            .unwrap(),
    );

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .call_once(Duration::from_millis(200), ("world",))
                    .await
                    .unwrap()
            })
        })
        .collect();
    let outcomes: Vec<PutOutcome> = futures::future::join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let inserted: Vec<MessageId> = outcomes
        .iter()
        .filter(|o| !o.is_duplicate())
        .map(|o| o.id())
        .collect();
    assert_eq!(inserted.len(), 1);
    assert!(outcomes.iter().all(|o| o.id() == inserted[0]));
    assert_eq!(storage.counts().await.unwrap().pending, 1);

    queue.close().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_limit_serializes_attempts() {
    let start = Instant::now();
    let starts = Timeline::default();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let queue = QueueBuilder::new("serial")
        .handler_fn({
            let starts = starts.clone();
            let running = running.clone();
            let peak = peak.clone();
            move |_n: u32| {
                let starts = starts.clone();
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    starts.mark(start);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        })
        .worker_limit(1)
        .build()
        .unwrap();

    for n in 0..3u32 {
        queue.call((n,)).await.unwrap();
    }
    queue.close().await.unwrap();

    assert_eq!(starts.secs_floor(), vec![0, 1, 2]);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_immediate_when_idle() {
    let queue = QueueBuilder::new("idle")
        .handler_fn(|| async {})
        .build()
        .unwrap();
    queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let before = Instant::now();
    queue.close().await.unwrap();
    queue.close().await.unwrap();
    assert_eq!(before.elapsed(), Duration::ZERO);

    assert!(matches!(queue.call(()).await, Err(QueueError::Closed)));
    assert!(queue.status().await.unwrap().closed);
}

#[tokio::test(start_paused = true)]
async fn second_close_waits_for_the_first() {
    let handled = Arc::new(AtomicU32::new(0));
    let queue = Arc::new(
        QueueBuilder::new("slow-drain")
            .handler_fn({
                let handled = handled.clone();
                move || {
                    let handled = handled.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        handled.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
            .build()
            .unwrap(),
    );
    queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let before = Instant::now();
    let first = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.close().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.close().await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(4), "returned before the drain finished");
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn every_close_reports_the_same_shutdown_timeout() {
    let queue = Arc::new(
        QueueBuilder::new("stuck")
            .handler_fn(|| async { tokio::time::sleep(Duration::from_secs(10)).await })
            .shutdown_timeout(Some(Duration::from_secs(1)))
            .build()
            .unwrap(),
    );
    let id = queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move { queue.close().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = queue.close().await;
    let first = first.await.unwrap();
    let third = queue.close().await;

    for outcome in [first, second, third] {
        match outcome {
            Err(QueueError::ShutdownTimeout { abandoned, pending }) => {
                assert_eq!(abandoned, vec![id]);
                assert_eq!(pending, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn adding_an_in_flight_message_again_is_rejected() {
    let queue = QueueBuilder::new("reused-id")
        .handler_fn(|| async { tokio::time::sleep(Duration::from_secs(1)).await })
        .build()
        .unwrap();
    let msg = Message::new();
    let id = msg.id;
    queue.add(msg.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        queue.add(msg).await,
        Err(QueueError::Storage(StorageError::AlreadyExists(existing))) if existing == id
    ));
    let stored = queue.message(id).await.unwrap().unwrap();
    assert_eq!(stored.state, MessageState::Reserved);

    queue.close().await.unwrap();
    assert!(queue.message(id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn argument_mismatch_is_dead_lettered_without_running_user_code() {
    let invoked = Arc::new(AtomicU32::new(0));
    let queue = QueueBuilder::new("mismatch")
        .handler_fn({
            let invoked = invoked.clone();
            move |_name: String| {
                let invoked = invoked.clone();
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .retry_limit(5)
        .build()
        .unwrap();

    queue.call(("a", "b")).await.unwrap();
    queue.close().await.unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
    assert_eq!(
        dead[0].last_error.as_deref(),
        Some("got 2 args, handler expects 1 args")
    );
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_retried_and_processor_survives() {
    let attempts = Arc::new(AtomicU32::new(0));
    let events = Arc::new(RecordingSink::default());
    let queue = QueueBuilder::new("panics")
        .handler_fn({
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first attempt explodes");
                    }
                }
            }
        })
        .retry_limit(2)
        .event_sink(events.clone())
        .build()
        .unwrap();

    let id = queue.call(()).await.unwrap();
    queue.close().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let events = events.events();
    assert!(matches!(
        &events[0],
        QueueEvent::Retrying { error, retry_count: 1, .. } if error.contains("first attempt explodes")
    ));
    assert_eq!(
        events[1],
        QueueEvent::Completed {
            queue: "panics".into(),
            id
        }
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_deadline_reports_abandoned_work() {
    let events = Arc::new(RecordingSink::default());
    let queue = QueueBuilder::new("slow")
        .handler_fn(|| async { tokio::time::sleep(Duration::from_secs(10)).await })
        .shutdown_timeout(Some(Duration::from_secs(1)))
        .event_sink(events.clone())
        .build()
        .unwrap();

    let id = queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let before = Instant::now();
    let err = queue.close().await.unwrap_err();
    let waited = before.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));

    match err {
        QueueError::ShutdownTimeout { abandoned, pending } => {
            assert_eq!(abandoned, vec![id]);
            assert_eq!(pending, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    let msg = queue.message(id).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Pending);
    assert_eq!(msg.retry_count, 0);
    assert!(events.events().contains(&QueueEvent::Abandoned {
        queue: "slow".into(),
        id
    }));
}

#[tokio::test(start_paused = true)]
async fn messages_due_after_the_deadline_are_reported_at_once() {
    let queue = QueueBuilder::new("later")
        .handler_fn(|| async {})
        .shutdown_timeout(Some(Duration::from_secs(1)))
        .build()
        .unwrap();

    queue
        .add(Message::new().with_delay(Duration::from_secs(3600)))
        .await
        .unwrap();

    let before = Instant::now();
    let err = queue.close().await.unwrap_err();
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert!(matches!(
        err,
        QueueError::ShutdownTimeout { ref abandoned, pending: 1 } if abandoned.is_empty()
    ));
}

struct DownLimiter;

#[async_trait]
impl RateLimiter for DownLimiter {
    async fn acquire(&self, _cancel: &CancellationToken) -> Result<(), RateLimitError> {
        Err(RateLimitError::Unavailable("connection refused".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn unavailable_limiter_fails_the_attempt_but_keeps_the_message() {
    let invoked = Arc::new(AtomicU32::new(0));
    let queue = QueueBuilder::new("no-limiter")
        .handler_fn({
            let invoked = invoked.clone();
            move || {
                let invoked = invoked.clone();
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .rate_limiter(Arc::new(DownLimiter))
        .retry_limit(2)
        .build()
        .unwrap();

    queue.call(()).await.unwrap();
    queue.close().await.unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn dead_letters_can_be_requeued() {
    let broken = Arc::new(AtomicBool::new(true));
    let processed = Arc::new(AtomicU32::new(0));
    let queue = QueueBuilder::new("redrive")
        .handler_fn({
            let broken = broken.clone();
            let processed = processed.clone();
            move || {
                let broken = broken.clone();
                let processed = processed.clone();
                async move {
                    if broken.load(Ordering::SeqCst) {
                        return Err("downstream offline");
                    }
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build()
        .unwrap();

    let id = queue.call(()).await.unwrap();
    let done = queue.call(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.dead_letters().await.unwrap().len(), 2);

    broken.store(false, Ordering::SeqCst);
    queue.requeue_dead(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert!(queue.message(id).await.unwrap().is_none());

    let status = queue.status().await.unwrap();
    assert_eq!(status.counts.dead, 1);
    assert_eq!(status.counts.pending, 0);
    assert_eq!(queue.message(done).await.unwrap().unwrap().state, MessageState::Dead);

    assert!(matches!(
        queue.requeue_dead(MessageId::generate()).await,
        Err(QueueError::Storage(_))
    ));
    let pending = queue
        .add(Message::new().with_delay(Duration::from_secs(1)))
        .await
        .unwrap()
        .id();
    assert!(matches!(
        queue.requeue_dead(pending).await,
        Err(QueueError::NotDead(id)) if id == pending
    ));

    queue.close().await.unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn purge_drops_only_pending_messages() {
    let queue = QueueBuilder::new("purge")
        .handler_fn(|| async {})
        .shutdown_timeout(Some(Duration::from_secs(1)))
        .build()
        .unwrap();

    for _ in 0..3 {
        queue
            .add(Message::new().with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
    }
    assert_eq!(queue.status().await.unwrap().counts.pending, 3);
    assert_eq!(queue.purge().await.unwrap(), 3);
    assert!(queue.status().await.unwrap().is_idle());
    queue.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reservation_left_by_a_dead_process_is_reclaimed() {
    let start = Instant::now();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let storage = Arc::new(MemoryStorage::new());

    // Another process reserved this message and then died.
    let mut orphan = Message::new();
    orphan.not_before = Some(clock.now());
    let orphan_id = orphan.id;
    storage.put(orphan).await.unwrap();
    assert!(storage.reserve_ready(clock.now()).await.unwrap().is_some());

    let handled = Timeline::default();
    let events = Arc::new(RecordingSink::default());
    let queue = QueueBuilder::new("reaped")
        .handler_fn({
            let handled = handled.clone();
            move || {
                let handled = handled.clone();
                async move { handled.mark(start) }
            }
        })
        .storage(storage.clone())
        .clock(clock)
        .event_sink(events.clone())
        .reservation_timeout(Some(Duration::from_secs(2)))
        .build()
        .unwrap();

    queue.close().await.unwrap();

    let at = handled.secs_floor();
    assert_eq!(at.len(), 1);
    assert!((2..4).contains(&at[0]), "reclaimed at {at:?}");
    assert!(events.events().contains(&QueueEvent::Reclaimed {
        queue: "reaped".into(),
        id: orphan_id
    }));
}
