//! EventSink port: failure-reporting hook.
//!
//! The processor never surfaces per-message failures to callers of `add`.
//! They are delivered here instead.

use crate::domain::QueueEvent;

pub trait EventSink: Send + Sync {
    /// Must not block; called from worker tasks.
    fn emit(&self, event: QueueEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: QueueEvent) {}
}
