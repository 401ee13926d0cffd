//! Storage port: the single source of truth for message state.
//!
//! Every state transition goes through this trait. Implementations must make
//! each call atomic; `reserve_ready` and `put_if_absent` in particular are the
//! synchronization points between workers and between processes sharing a
//! store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Message, MessageId, MessageUpdate, QueueCounts, StorageError};

/// Result of a dedup-aware insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted(MessageId),
    /// An active message already holds the dedup key; nothing was written.
    Duplicate(MessageId),
}

impl PutOutcome {
    pub fn id(&self) -> MessageId {
        match self {
            PutOutcome::Inserted(id) | PutOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, PutOutcome::Duplicate(_))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store a scheduled message. Fails with `AlreadyExists` if a message
    /// with the same id is stored.
    async fn put(&self, message: Message) -> Result<(), StorageError>;

    /// Store `message` unless an active message holds its dedup key.
    ///
    /// The check and the insert are one atomic step (first writer wins).
    /// Messages without a dedup key are inserted as by `put`.
    async fn put_if_absent(&self, message: Message) -> Result<PutOutcome, StorageError>;

    /// The active message holding `key`, if any.
    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<Message>, StorageError>;

    /// Atomically claim the earliest ready pending message.
    async fn reserve_ready(&self, now: DateTime<Utc>) -> Result<Option<Message>, StorageError>;

    /// Earliest `not_before` among pending messages.
    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Apply `update` to a stored message.
    ///
    /// A fenced update (see [`MessageUpdate::fenced`]) is applied only while
    /// the message is still reserved by that reservation; otherwise nothing
    /// changes and the call fails with `StorageError::Conflict`. Workers
    /// settle attempts this way, so a holder whose reservation was reclaimed
    /// cannot overwrite the state of the message's next holder.
    async fn update_state(&self, id: MessageId, update: MessageUpdate)
    -> Result<(), StorageError>;

    /// Delete a processed message if the reservation taken at `reserved_at`
    /// still holds it. `Conflict` if it does not.
    async fn complete(&self, id: MessageId, reserved_at: DateTime<Utc>)
    -> Result<(), StorageError>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError>;

    /// Return messages reserved before `cutoff` to pending, except those in
    /// `held` (still being worked on by the caller). Returns the released ids.
    async fn release_expired(
        &self,
        cutoff: DateTime<Utc>,
        held: &[MessageId],
    ) -> Result<Vec<MessageId>, StorageError>;

    async fn counts(&self) -> Result<QueueCounts, StorageError>;

    async fn dead_letters(&self) -> Result<Vec<Message>, StorageError>;

    /// Delete every pending message. Returns how many were deleted.
    async fn purge(&self) -> Result<usize, StorageError>;
}
