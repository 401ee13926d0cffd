//! Message state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored message.
///
/// Transitions:
/// - Pending -> Reserved -> Done (removed from storage)
/// - Pending -> Reserved -> Pending (retry with backoff)
/// - Pending -> Reserved -> Dead (retries exhausted or permanent failure)
/// - Reserved -> Pending (reservation expired or abandoned at shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting for `not_before` to elapse, then eligible for reservation.
    Pending,

    /// Claimed by exactly one worker.
    Reserved,

    /// Handled successfully.
    Done,

    /// Kept for inspection after the final failed attempt.
    Dead,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Done | MessageState::Dead)
    }

    /// Messages in these states keep their dedup key occupied.
    pub fn is_active(self) -> bool {
        matches!(self, MessageState::Pending | MessageState::Reserved)
    }
}

/// Message counts by state, as reported by storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub reserved: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Nothing left to dispatch or finish.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.reserved == 0
    }
}
