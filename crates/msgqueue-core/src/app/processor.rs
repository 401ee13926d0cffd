//! Processor: the dispatch loop and the per-message workers.
//!
//! One dispatcher task per queue runs
//! `worker slot -> ready message -> rate permit -> reserve -> spawn worker`.
//! Each worker invokes the handler inside a panic boundary and applies the
//! retry decision through storage. All state changes go through `Storage`;
//! the processor keeps only the reservations it currently holds.
//!
//! The order of the steps matters. The worker slot is taken first so a
//! saturated queue does not consume rate permits it cannot use, and the
//! permit is taken before the reservation so a message never sits reserved
//! while its worker waits on the limiter. Reserving last also means the
//! reservation clock starts when the handler is about to run, which keeps the
//! reaper's timeout meaningful.
//!
//! A worker's outcome is written back fenced to the reservation it ran under
//! (its `reserved_at`). If the reaper of another process sharing the store
//! reclaimed the message in the meantime, storage answers `Conflict` and the
//! outcome is dropped with a warning: by then the message belongs to its new
//! holder, and at-least-once delivery covers the lost result.
//!
//! Panics are caught per attempt and recorded as `HandlerError::Panicked`, so
//! they count against the retry budget like any other failure. Nothing a
//! handler does can take down the dispatcher.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::message::after;
use crate::domain::{
    HandlerError, Message, MessageId, MessageUpdate, QueueEvent, RateLimitError, RetryDecision,
    RetryPolicy, StorageError,
};
use crate::handler::Handler;
use crate::ports::{Clock, EventSink, RateLimiter, Storage};

/// Wake-ups shared between the queue facade, the dispatcher and workers.
#[derive(Default)]
pub(crate) struct Signals {
    /// Something may have become ready: a new message, a finished attempt.
    pub(crate) wakeup: Notify,
    /// An attempt finished. Waited on by `close`.
    pub(crate) settled: Notify,
}

/// Reservations taken by this process and not yet settled, by message id.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    ids: Arc<Mutex<HashMap<MessageId, DateTime<Utc>>>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, DateTime<Utc>>> {
        self.ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, id: MessageId, reserved_at: DateTime<Utc>) {
        self.lock().insert(id, reserved_at);
    }

    pub(crate) fn remove(&self, id: MessageId) {
        self.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Empty the set, returning each id with its reservation time.
    pub(crate) fn take_all(&self) -> Vec<(MessageId, DateTime<Utc>)> {
        let mut held: Vec<(MessageId, DateTime<Utc>)> = self.lock().drain().collect();
        held.sort();
        held
    }
}

/// The dispatcher observed cancellation.
struct Stopped;

pub(crate) struct Processor {
    pub(crate) queue: String,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) retry: RetryPolicy,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<dyn EventSink>,
    /// `None` means no worker limit.
    pub(crate) workers: Option<Arc<Semaphore>>,
    pub(crate) poll_interval: Duration,
    pub(crate) signals: Arc<Signals>,
    pub(crate) in_flight: InFlight,
}

impl Processor {
    /// Dispatch until `cancel` fires. Returns the still-running workers so
    /// the caller decides whether to await or abort them.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        debug!(queue = %self.queue, "processor started");

        loop {
            while let Some(joined) = workers.try_join_next() {
                self.log_join(joined);
            }

            let Ok(slot) = self.worker_slot(&cancel).await else {
                break;
            };
            if self.wait_ready(&cancel).await.is_err() {
                break;
            }
            let limiter_failure = match self.limiter.acquire(&cancel).await {
                Ok(()) => None,
                Err(RateLimitError::Cancelled) => break,
                Err(RateLimitError::Unavailable(reason)) => {
                    warn!(queue = %self.queue, %reason, "rate limiter unavailable");
                    Some(HandlerError::RateLimiterUnavailable(reason))
                }
            };

            let now = self.clock.now();
            let msg = match self.storage.reserve_ready(now).await {
                Ok(Some(msg)) => msg,
                // Another process reserved it first.
                Ok(None) => continue,
                Err(err) => {
                    error!(queue = %self.queue, error = %err, "reserve failed");
                    if self.pause(&cancel).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            debug!(queue = %self.queue, message_id = %msg.id, retry_count = msg.retry_count, "message reserved");
            let reserved_at = msg.reserved_at.unwrap_or(now);
            self.in_flight.insert(msg.id, reserved_at);
            let this = Arc::clone(&self);
            workers.spawn(async move {
                let _slot = slot;
                this.attempt(msg, reserved_at, limiter_failure).await;
            });
        }

        debug!(queue = %self.queue, in_flight = workers.len(), "processor stopped");
        workers
    }

    async fn worker_slot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, Stopped> {
        let Some(workers) = &self.workers else {
            return Ok(None);
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Stopped),
            permit = Arc::clone(workers).acquire_owned() => permit.map(Some).map_err(|_| Stopped),
        }
    }

    /// Wait until storage reports a message whose `not_before` has passed.
    ///
    /// Re-polls at least every `poll_interval`, since other processes may
    /// write to a shared store without waking us.
    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<(), Stopped> {
        loop {
            if cancel.is_cancelled() {
                return Err(Stopped);
            }
            let now = self.clock.now();
            let wait = match self.storage.next_ready_at().await {
                Ok(Some(at)) if at <= now => return Ok(()),
                Ok(Some(at)) => (at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.poll_interval),
                Ok(None) => self.poll_interval,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "polling storage failed");
                    self.poll_interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Stopped),
                _ = self.signals.wakeup.notified() => {}
                _ = self.clock.sleep(wait) => {}
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), Stopped> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Stopped),
            _ = self.clock.sleep(self.poll_interval) => Ok(()),
        }
    }

    /// One attempt on a reserved message, start to settled state.
    async fn attempt(
        &self,
        msg: Message,
        reserved_at: DateTime<Utc>,
        limiter_failure: Option<HandlerError>,
    ) {
        let id = msg.id;
        let result = match limiter_failure {
            Some(err) => Err(err),
            None => self.invoke(&msg).await,
        };
        self.settle(msg, reserved_at, result).await;

        self.in_flight.remove(id);
        self.signals.wakeup.notify_one();
        self.signals.settled.notify_waiters();
    }

    /// Run the handler. A panic is contained to this attempt.
    async fn invoke(&self, msg: &Message) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.handle_message(msg))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Record the outcome of an attempt, fenced to the reservation it ran
    /// under. If that reservation was reclaimed meanwhile the outcome is
    /// dropped: the message belongs to its new holder.
    async fn settle(
        &self,
        msg: Message,
        reserved_at: DateTime<Utc>,
        result: Result<(), HandlerError>,
    ) {
        let error = match result {
            Ok(()) => {
                match self.storage.complete(msg.id, reserved_at).await {
                    Ok(()) => self.events.emit(QueueEvent::Completed {
                        queue: self.queue.clone(),
                        id: msg.id,
                    }),
                    Err(err @ (StorageError::Conflict(_) | StorageError::NotFound(_))) => {
                        warn!(queue = %self.queue, message_id = %msg.id, error = %err, "reservation lost, result dropped");
                    }
                    Err(err) => {
                        error!(queue = %self.queue, message_id = %msg.id, error = %err, "failed to remove processed message");
                    }
                }
                return;
            }
            Err(error) => error,
        };

        let reason = error.to_string();
        let (update, event) = match self.retry.decide(msg.retry_count, &error) {
            RetryDecision::Retry { retry_count, delay } => (
                MessageUpdate::retry(retry_count, after(self.clock.now(), delay), reason.clone()),
                QueueEvent::Retrying {
                    queue: self.queue.clone(),
                    id: msg.id,
                    retry_count,
                    delay,
                    error: reason,
                },
            ),
            RetryDecision::Dead { retry_count } => (
                MessageUpdate::dead(retry_count, reason.clone()),
                QueueEvent::DeadLettered {
                    queue: self.queue.clone(),
                    id: msg.id,
                    retry_count,
                    error: reason,
                },
            ),
        };

        match self.storage.update_state(msg.id, update.fenced(reserved_at)).await {
            Ok(()) => self.events.emit(event),
            Err(err @ (StorageError::Conflict(_) | StorageError::NotFound(_))) => {
                warn!(queue = %self.queue, message_id = %msg.id, error = %err, "reservation lost, result dropped");
            }
            Err(err) => {
                // Stays reserved; the reaper returns it once the reservation expires.
                error!(queue = %self.queue, message_id = %msg.id, error = %err, "failed to record attempt");
            }
        }
    }

    fn log_join(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined
            && !err.is_cancelled()
        {
            error!(queue = %self.queue, error = %err, "worker task failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageState, QueueCounts};
    use crate::handler::{HandlerFn, handler_fn};
    use crate::impls::MemoryStorage;
    use crate::ports::{SystemClock, Unlimited};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorded(StdMutex<Vec<QueueEvent>>);

    impl EventSink for Recorded {
        fn emit(&self, event: QueueEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn processor(handler: Arc<dyn Handler>, retry: RetryPolicy) -> (Arc<Processor>, Arc<Recorded>) {
        let events = Arc::new(Recorded::default());
        let processor = Processor {
            queue: "test".to_string(),
            storage: Arc::new(MemoryStorage::new()),
            handler,
            limiter: Arc::new(Unlimited),
            retry,
            clock: Arc::new(SystemClock::new()),
            events: events.clone(),
            workers: None,
            poll_interval: Duration::from_secs(1),
            signals: Arc::new(Signals::default()),
            in_flight: InFlight::default(),
        };
        (Arc::new(processor), events)
    }

    async fn reserve(processor: &Processor, msg: Message) -> Message {
        let mut msg = msg;
        msg.schedule(processor.clock.now());
        processor.storage.put(msg).await.unwrap();
        processor
            .storage
            .reserve_ready(processor.clock.now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_removes_message() {
        let (p, events) = processor(Arc::new(handler_fn(|| async {})), RetryPolicy::no_retry());
        let msg = reserve(&p, Message::new()).await;
        let (id, at) = (msg.id, msg.reserved_at.unwrap());

        p.attempt(msg, at, None).await;

        assert!(p.storage.get(id).await.unwrap().is_none());
        assert_eq!(
            *events.0.lock().unwrap(),
            vec![QueueEvent::Completed {
                queue: "test".into(),
                id
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panic_becomes_failed_attempt() {
        let handler = HandlerFn::new(|msg: Message| async move {
            if msg.args.is_empty() {
                panic!("handler exploded");
            }
        });
        let (p, _) = processor(Arc::new(handler), RetryPolicy::new(3, Duration::from_secs(1)));
        let msg = reserve(&p, Message::new()).await;
        let (id, at) = (msg.id, msg.reserved_at.unwrap());

        p.attempt(msg, at, None).await;

        let stored = p.storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("handler panicked: handler exploded")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn argument_mismatch_dead_letters_immediately() {
        let handler = handler_fn(|_name: String| async {});
        let (p, events) = processor(Arc::new(handler), RetryPolicy::new(5, Duration::from_secs(1)));
        let msg = reserve(&p, Message::new()).await;
        let (id, at) = (msg.id, msg.reserved_at.unwrap());

        p.attempt(msg, at, None).await;

        let stored = p.storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Dead);
        assert_eq!(stored.retry_count, 1);
        assert!(matches!(
            events.0.lock().unwrap()[0],
            QueueEvent::DeadLettered { retry_count: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_failure_counts_as_attempt_and_keeps_message() {
        let (p, _) = processor(Arc::new(handler_fn(|| async {})), RetryPolicy::new(2, Duration::from_secs(1)));
        let msg = reserve(&p, Message::new()).await;
        let (id, at) = (msg.id, msg.reserved_at.unwrap());

        p.attempt(msg, at, Some(HandlerError::RateLimiterUnavailable("down".into())))
            .await;

        let stored = p.storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(
            p.storage.counts().await.unwrap(),
            QueueCounts {
                pending: 1,
                reserved: 0,
                dead: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_of_reclaimed_reservation_is_dropped() {
        let handler = handler_fn(|| async { Err::<(), _>("late failure") });
        let (p, events) = processor(Arc::new(handler), RetryPolicy::new(3, Duration::from_secs(1)));
        let msg = reserve(&p, Message::new()).await;
        let (id, stale) = (msg.id, msg.reserved_at.unwrap());

        // Reclaimed and taken by another holder while this attempt runs.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let later = p.clock.now();
        assert_eq!(p.storage.release_expired(later, &[]).await.unwrap(), vec![id]);
        let current = p.storage.reserve_ready(later).await.unwrap().unwrap();

        p.attempt(msg, stale, None).await;

        let stored = p.storage.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, MessageState::Reserved);
        assert_eq!(stored.reserved_at, current.reserved_at);
        assert_eq!(stored.retry_count, 0);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let (p, _) = processor(Arc::new(handler_fn(|| async {})), RetryPolicy::no_retry());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&p).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let workers = handle.await.unwrap();
        assert!(workers.is_empty());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
