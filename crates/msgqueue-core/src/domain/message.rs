//! Message: the unit of work plus its scheduling metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::CodecError;
use super::ids::MessageId;
use super::state::MessageState;
use crate::ports::Codec;

/// One unit of work.
///
/// Arguments travel either pre-encoded in `body` or as already-typed JSON
/// values in `args`. Handlers prefer `body` when it is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,

    /// Initial delay before the first attempt.
    #[serde(default)]
    pub delay: Duration,

    /// Set when the message is stored; never dispatched before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,

    pub state: MessageState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new() -> Self {
        Self {
            id: MessageId::generate(),
            body: Vec::new(),
            args: Vec::new(),
            delay: Duration::ZERO,
            not_before: None,
            retry_count: 0,
            dedup_key: None,
            state: MessageState::Pending,
            last_error: None,
            created_at: None,
            reserved_at: None,
        }
    }

    pub fn from_args(args: Vec<serde_json::Value>) -> Self {
        Self {
            args,
            ..Self::new()
        }
    }

    /// Build a message whose arguments are carried in `body`.
    pub fn encoded(codec: &dyn Codec, args: &[serde_json::Value]) -> Result<Self, CodecError> {
        let body = codec.encode(args)?;
        Ok(Self {
            body,
            ..Self::new()
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Stamp creation metadata. `not_before` becomes `now + delay`.
    pub(crate) fn schedule(&mut self, now: DateTime<Utc>) {
        self.state = MessageState::Pending;
        self.created_at = Some(now);
        self.not_before = Some(after(now, self.delay));
        self.reserved_at = None;
    }

    /// A message without `not_before` is ready immediately.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Pending && self.not_before.is_none_or(|at| at <= now)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields changed by a single state transition.
///
/// Storage applies an update atomically; `None` fields keep their value.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub state: MessageState,
    pub retry_count: Option<u32>,
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Apply only while the message is reserved with this `reserved_at`.
    pub reservation: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    /// Back to `Pending`, visible again at `not_before`.
    pub fn retry(retry_count: u32, not_before: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            state: MessageState::Pending,
            retry_count: Some(retry_count),
            not_before: Some(not_before),
            last_error: Some(error.into()),
            reservation: None,
        }
    }

    pub fn dead(retry_count: u32, error: impl Into<String>) -> Self {
        Self {
            state: MessageState::Dead,
            retry_count: Some(retry_count),
            not_before: None,
            last_error: Some(error.into()),
            reservation: None,
        }
    }

    /// Return a reserved message to `Pending` without counting an attempt.
    pub fn release(not_before: DateTime<Utc>) -> Self {
        Self {
            state: MessageState::Pending,
            retry_count: None,
            not_before: Some(not_before),
            last_error: None,
            reservation: None,
        }
    }

    /// Redrive a dead message with a fresh retry budget.
    pub fn redrive(not_before: DateTime<Utc>) -> Self {
        Self {
            state: MessageState::Pending,
            retry_count: Some(0),
            not_before: Some(not_before),
            last_error: None,
            reservation: None,
        }
    }

    /// Fence the update to the reservation taken at `reserved_at`. Storage
    /// rejects it with `StorageError::Conflict` once that reservation has
    /// expired or been replaced.
    pub fn fenced(mut self, reserved_at: DateTime<Utc>) -> Self {
        self.reservation = Some(reserved_at);
        self
    }

    /// Whether a fenced update still targets the reservation `message` holds.
    pub fn holds(&self, message: &Message) -> bool {
        match self.reservation {
            Some(at) => message.state == MessageState::Reserved && message.reserved_at == Some(at),
            None => true,
        }
    }

    pub(crate) fn apply(&self, message: &mut Message) {
        message.state = self.state;
        if let Some(count) = self.retry_count {
            message.retry_count = count;
        }
        if let Some(at) = self.not_before {
            message.not_before = Some(at);
        }
        if let Some(error) = &self.last_error {
            message.last_error = Some(error.clone());
        }
        if self.state != MessageState::Reserved {
            message.reserved_at = None;
        }
    }
}

/// `now + duration`, saturating at the end of chrono's range.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
