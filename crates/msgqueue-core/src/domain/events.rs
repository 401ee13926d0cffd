//! Observable processor events, delivered to an `EventSink`.

use std::time::Duration;

use super::ids::MessageId;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Handler succeeded; the message was removed.
    Completed { queue: String, id: MessageId },

    /// Attempt failed; the message will be visible again after `delay`.
    Retrying {
        queue: String,
        id: MessageId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },

    /// Final failure; the message stays in storage as a dead letter.
    DeadLettered {
        queue: String,
        id: MessageId,
        retry_count: u32,
        error: String,
    },

    /// In-flight when the shutdown deadline fired; released back to pending.
    Abandoned { queue: String, id: MessageId },

    /// Reservation outlived its timeout and was returned to pending.
    Reclaimed { queue: String, id: MessageId },
}

impl QueueEvent {
    pub fn id(&self) -> MessageId {
        match self {
            QueueEvent::Completed { id, .. }
            | QueueEvent::Retrying { id, .. }
            | QueueEvent::DeadLettered { id, .. }
            | QueueEvent::Abandoned { id, .. }
            | QueueEvent::Reclaimed { id, .. } => *id,
        }
    }
}
