//! ReaperLoop: return abandoned reservations to the queue.
//!
//! A reservation is abandoned when the process holding it died before
//! settling the message. Once `reserved_at` is older than the reservation
//! timeout the message becomes pending again with its retry count unchanged.
//! Ids still held by this process are never released.
//!
//! The reaper is what makes a shared store safe against crashed workers, but
//! it cannot tell a dead holder from a slow one in another process. When it
//! guesses wrong the slow holder's eventual result is fenced out by storage
//! (`StorageError::Conflict`), so the message is handled at least once and
//! never settled by two holders.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::processor::{InFlight, Signals};
use crate::domain::QueueEvent;
use crate::ports::{Clock, EventSink, Storage};

pub(crate) struct ReaperLoop {
    pub(crate) queue: String,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) signals: Arc<Signals>,
    pub(crate) in_flight: InFlight,
    pub(crate) timeout: Duration,
}

impl ReaperLoop {
    /// Sweep every half timeout until cancelled.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let interval = (self.timeout / 2).max(Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(interval) => {}
            }
            self.reap_once().await;
        }
        debug!(queue = %self.queue, "reaper stopped");
    }

    /// One sweep. Returns how many messages were released.
    pub(crate) async fn reap_once(&self) -> usize {
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return 0;
        };
        let Some(cutoff) = self.clock.now().checked_sub_signed(timeout) else {
            return 0;
        };

        let held = self.in_flight.snapshot();
        match self.storage.release_expired(cutoff, &held).await {
            Ok(ids) => {
                for &id in &ids {
                    self.events.emit(QueueEvent::Reclaimed {
                        queue: self.queue.clone(),
                        id,
                    });
                }
                if !ids.is_empty() {
                    self.signals.wakeup.notify_one();
                }
                ids.len()
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "releasing expired reservations failed");
                0
            }
        }
    }
}
