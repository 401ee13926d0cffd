//! Default failure-reporting hook: every event becomes a tracing record.

use tracing::{debug, error, warn};

use crate::domain::QueueEvent;
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: QueueEvent) {
        match event {
            QueueEvent::Completed { queue, id } => {
                debug!(%queue, message_id = %id, "message processed");
            }
            QueueEvent::Retrying {
                queue,
                id,
                retry_count,
                delay,
                error,
            } => {
                warn!(
                    %queue,
                    message_id = %id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "handler failed, retry scheduled"
                );
            }
            QueueEvent::DeadLettered {
                queue,
                id,
                retry_count,
                error,
            } => {
                error!(%queue, message_id = %id, retry_count, %error, "message moved to dead letters");
            }
            QueueEvent::Abandoned { queue, id } => {
                error!(%queue, message_id = %id, "in-flight message abandoned at shutdown deadline");
            }
            QueueEvent::Reclaimed { queue, id } => {
                warn!(%queue, message_id = %id, "reservation expired, message returned to pending");
            }
        }
    }
}
