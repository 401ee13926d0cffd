//! Queue: the public facade over storage and the processor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processor::{InFlight, Processor, Signals};
use super::reaper_loop::ReaperLoop;
use super::status::QueueStatus;
use crate::domain::message::after;
use crate::domain::{
    CodecError, Message, MessageId, MessageState, MessageUpdate, QueueError, QueueEvent,
    StorageError,
};
use crate::ports::{Clock, EventSink, PutOutcome, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Idle,
    Deadline,
    /// Only pending messages are left and none is due before the deadline.
    Stranded,
}

/// Background tasks owned by a running queue.
struct Running {
    dispatcher: JoinHandle<JoinSet<()>>,
    reaper: Option<JoinHandle<()>>,
}

/// Guarded by one async lock held for the whole of `close`, so concurrent
/// callers queue behind the first and all see its outcome.
struct Lifecycle {
    running: Option<Running>,
    closed_with: Option<Result<(), QueueError>>,
}

/// A named queue with a running processor.
///
/// Built by [`QueueBuilder`](super::QueueBuilder). Cheap to share behind an
/// `Arc`; every operation takes `&self`.
///
/// ```ignore
/// let queue = QueueBuilder::new("greetings")
///     .handler_fn(|name: String| async move { tracing::info!("hello {name}") })
///     .build()?;
///
/// queue.call(("world",)).await?;
/// queue.close().await?;
/// ```
pub struct Queue {
    name: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    signals: Arc<Signals>,
    in_flight: InFlight,
    shutdown_timeout: Option<Duration>,
    poll_interval: Duration,
    closed: AtomicBool,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl Queue {
    /// Spawn the processor (and the reaper, if any) on the current runtime.
    pub(crate) fn start(
        processor: Processor,
        reaper: Option<ReaperLoop>,
        shutdown_timeout: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let processor = Arc::new(processor);
        let name = processor.queue.clone();
        let storage = Arc::clone(&processor.storage);
        let clock = Arc::clone(&processor.clock);
        let events = Arc::clone(&processor.events);
        let signals = Arc::clone(&processor.signals);
        let in_flight = processor.in_flight.clone();
        let poll_interval = processor.poll_interval;

        let dispatcher = tokio::spawn(processor.run(cancel.clone()));
        let reaper = reaper.map(|reaper| tokio::spawn(reaper.run(cancel.clone())));
        info!(queue = %name, "queue started");

        Queue {
            name,
            storage,
            clock,
            events,
            signals,
            in_flight,
            shutdown_timeout,
            poll_interval,
            closed: AtomicBool::new(false),
            cancel,
            lifecycle: Mutex::new(Lifecycle {
                running: Some(Running { dispatcher, reaper }),
                closed_with: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Store a message. It becomes eligible after `msg.delay`.
    ///
    /// With a dedup key the insert is first-writer-wins: if an active message
    /// already holds the key, nothing is stored and `Duplicate` names the
    /// existing message.
    pub async fn add(&self, mut msg: Message) -> Result<PutOutcome, QueueError> {
        self.ensure_open()?;
        msg.schedule(self.clock.now());
        let id = msg.id;

        let outcome = if msg.dedup_key.is_some() {
            self.storage.put_if_absent(msg).await?
        } else {
            self.storage.put(msg).await?;
            PutOutcome::Inserted(id)
        };

        match outcome {
            PutOutcome::Inserted(id) => {
                debug!(queue = %self.name, message_id = %id, "message added");
                self.signals.wakeup.notify_one();
            }
            PutOutcome::Duplicate(existing) => {
                debug!(queue = %self.name, message_id = %existing, "duplicate message dropped");
            }
        }
        Ok(outcome)
    }

    /// Enqueue a call with `args` as the handler's arguments.
    ///
    /// `args` is usually a tuple: `("world",)` or `(a, b)`. `()` means no
    /// arguments. A bare non-sequence value is a single argument; a bare
    /// sequence is spread, so wrap a `Vec` argument in a 1-tuple.
    pub async fn call<A: Serialize>(&self, args: A) -> Result<MessageId, QueueError> {
        let args = to_args(&args)?;
        let outcome = self.add(Message::from_args(args)).await?;
        Ok(outcome.id())
    }

    /// Like [`call`](Self::call), but at most one message per identical
    /// argument list is active at a time.
    ///
    /// The stored message is delayed by `window`, so duplicates arriving
    /// within the window collapse into it. Once it is handled (or dead) the
    /// key is free again.
    pub async fn call_once<A: Serialize>(
        &self,
        window: Duration,
        args: A,
    ) -> Result<PutOutcome, QueueError> {
        let args = to_args(&args)?;
        let key = self.dedup_key(&args)?;
        let msg = Message::from_args(args)
            .with_delay(window)
            .with_dedup_key(key);
        self.add(msg).await
    }

    /// Stop accepting messages, drain, then stop the processor.
    ///
    /// Waits until nothing is reserved and every pending message has been
    /// handled, bounded by the shutdown timeout. At the deadline, attempts
    /// still running are cancelled and their messages released back to
    /// pending. Both those and the remaining pending messages are reported in
    /// `QueueError::ShutdownTimeout`; nothing is dropped from storage.
    ///
    /// Idempotent: a call made while another is draining waits for it, and
    /// every call returns the outcome of the first.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(outcome) = &lifecycle.closed_with {
            return outcome.clone();
        }
        // An earlier close was dropped before it finished.
        let Some(running) = lifecycle.running.take() else {
            self.cancel.cancel();
            return Ok(());
        };

        let outcome = self.shut_down(running).await;
        lifecycle.closed_with = Some(outcome.clone());
        outcome
    }

    async fn shut_down(&self, running: Running) -> Result<(), QueueError> {
        info!(queue = %self.name, "closing queue");

        let drain = self.drain().await;
        self.cancel.cancel();

        if let Some(reaper) = running.reaper
            && let Err(err) = reaper.await
        {
            warn!(queue = %self.name, error = %err, "reaper task failed");
        }
        let mut workers = running
            .dispatcher
            .await
            .map_err(|err| QueueError::Worker(err.to_string()))?;

        if drain == Drain::Idle {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    error!(queue = %self.name, error = %err, "worker task failed");
                }
            }
            info!(queue = %self.name, "queue closed");
            return Ok(());
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}

        let abandoned = self.release_abandoned().await;
        let pending = match self.storage.counts().await {
            Ok(counts) => counts.pending,
            Err(err) => {
                warn!(queue = %self.name, error = %err, "counting pending messages failed");
                0
            }
        };

        warn!(queue = %self.name, abandoned = abandoned.len(), pending, "queue closed before draining");
        Err(QueueError::ShutdownTimeout { abandoned, pending })
    }

    async fn drain(&self) -> Drain {
        let (mut deadline, deadline_at): (BoxFuture<'_, ()>, _) = match self.shutdown_timeout {
            Some(timeout) => (
                self.clock.sleep(timeout),
                Some(after(self.clock.now(), timeout)),
            ),
            None => (future::pending().boxed(), None),
        };

        loop {
            let settled = self.signals.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            match self.storage.counts().await {
                Ok(counts) if counts.is_idle() && self.in_flight.is_empty() => return Drain::Idle,
                Ok(counts) if counts.reserved == 0 && self.in_flight.is_empty() => {
                    // Only pending left. Give up early if none can become
                    // ready before the deadline.
                    if let (Some(deadline_at), Ok(Some(next))) =
                        (deadline_at, self.storage.next_ready_at().await)
                        && next > deadline_at
                    {
                        return Drain::Stranded;
                    }
                }
                Ok(counts) => {
                    debug!(queue = %self.name, pending = counts.pending, reserved = counts.reserved, "draining");
                }
                Err(err) => warn!(queue = %self.name, error = %err, "counting messages failed"),
            }

            tokio::select! {
                _ = &mut deadline => return Drain::Deadline,
                _ = settled => {}
                _ = self.clock.sleep(self.poll_interval) => {}
            }
        }
    }

    /// Return messages whose attempts were cancelled at the deadline to
    /// pending. Returns the ids actually released.
    async fn release_abandoned(&self) -> Vec<MessageId> {
        let now = self.clock.now();
        let mut abandoned = Vec::new();
        for (id, reserved_at) in self.in_flight.take_all() {
            let release = MessageUpdate::release(now).fenced(reserved_at);
            match self.storage.update_state(id, release).await {
                Ok(()) => {
                    self.events.emit(QueueEvent::Abandoned {
                        queue: self.name.clone(),
                        id,
                    });
                    abandoned.push(id);
                }
                // Settled just before it was cancelled, or reclaimed elsewhere.
                Err(StorageError::NotFound(_) | StorageError::Conflict(_)) => {}
                Err(err) => {
                    error!(queue = %self.name, message_id = %id, error = %err, "failed to release abandoned message");
                    abandoned.push(id);
                }
            }
        }
        abandoned
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            name: self.name.clone(),
            counts: self.storage.counts().await?,
            in_flight: self.in_flight.len(),
            closed: self.is_closed(),
        })
    }

    pub async fn message(&self, id: MessageId) -> Result<Option<Message>, QueueError> {
        Ok(self.storage.get(id).await?)
    }

    /// Dead-lettered messages, each with its last error.
    pub async fn dead_letters(&self) -> Result<Vec<Message>, QueueError> {
        Ok(self.storage.dead_letters().await?)
    }

    /// Move a dead message back to pending with a fresh retry budget.
    pub async fn requeue_dead(&self, id: MessageId) -> Result<(), QueueError> {
        self.ensure_open()?;
        let msg = self
            .storage
            .get(id)
            .await?
            .ok_or(StorageError::NotFound(id))?;
        if msg.state != MessageState::Dead {
            return Err(QueueError::NotDead(id));
        }
        self.storage
            .update_state(id, MessageUpdate::redrive(self.clock.now()))
            .await?;
        info!(queue = %self.name, message_id = %id, "dead message requeued");
        self.signals.wakeup.notify_one();
        Ok(())
    }

    /// Delete every pending message. Reserved and dead messages are kept.
    pub async fn purge(&self) -> Result<usize, QueueError> {
        let purged = self.storage.purge().await?;
        info!(queue = %self.name, purged, "queue purged");
        Ok(purged)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn dedup_key(&self, args: &[Value]) -> Result<String, QueueError> {
        let encoded = serde_json::to_string(args).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(format!("{}:{}", self.name, encoded))
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn to_args<A: Serialize>(args: &A) -> Result<Vec<Value>, QueueError> {
    let value = serde_json::to_value(args).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Array(values) => values,
        value => vec![value],
    })
}
