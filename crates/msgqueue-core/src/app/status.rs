//! Point-in-time queue status.

use serde::Serialize;

use crate::domain::QueueCounts;

/// Snapshot returned by `Queue::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub name: String,
    /// Counts across every process sharing the store.
    pub counts: QueueCounts,
    /// Messages this process is working on right now.
    pub in_flight: usize,
    pub closed: bool,
}

impl QueueStatus {
    /// Nothing pending or reserved anywhere.
    pub fn is_idle(&self) -> bool {
        self.counts.is_idle() && self.in_flight == 0
    }
}
