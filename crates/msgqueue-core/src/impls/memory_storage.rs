//! In-process storage.
//!
//! Everything lives behind one async mutex: the message table, a min-heap of
//! pending messages keyed by `not_before`, and the index of active dedup
//! keys. Holding a single lock for each trait call is what makes
//! `reserve_ready` and `put_if_absent` atomic, so two workers can never
//! claim the same message and two concurrent `call_once` callers can never
//! both insert.
//!
//! The heap is lazy. Rescheduling or reserving a message does not search the
//! heap for its old entry; it pushes a new one and leaves the old entry to be
//! recognised as stale and dropped when it reaches the top. A message can
//! therefore have several entries, but only the one matching its current
//! `not_before` while it is pending is ever served.
//!
//! Reservations are identified by their `reserved_at`. Settling a message
//! (`complete`, or a fenced `update_state`) checks it, so a worker whose
//! reservation was reclaimed and handed to someone else gets `Conflict`
//! instead of clobbering the new holder's state.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Message, MessageId, MessageState, MessageUpdate, QueueCounts, StorageError};
use crate::ports::{PutOutcome, Storage};

/// Heap entry for a pending message.
///
/// Entries are never removed eagerly; an entry is stale once its message is
/// gone, no longer pending, or rescheduled to a different `not_before`.
/// `seq` breaks ties in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    not_before: DateTime<Utc>,
    seq: u64,
    id: MessageId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest entry first.
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<MessageId, Message>,
    schedule: BinaryHeap<Scheduled>,
    /// Active dedup key -> message holding it.
    dedup: HashMap<String, MessageId>,
    next_seq: u64,
}

impl MemoryState {
    fn is_current(&self, entry: &Scheduled) -> bool {
        self.messages.get(&entry.id).is_some_and(|m| {
            m.state == MessageState::Pending && m.not_before.unwrap_or(entry.not_before) == entry.not_before
        })
    }

    fn push_schedule(&mut self, message: &Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.schedule.push(Scheduled {
            not_before: message.not_before.unwrap_or(DateTime::<Utc>::MIN_UTC),
            seq,
            id: message.id,
        });
    }

    /// Drop stale entries from the top of the heap.
    fn prune(&mut self) {
        while let Some(top) = self.schedule.peek() {
            if self.is_current(top) {
                break;
            }
            self.schedule.pop();
        }
    }

    fn insert(&mut self, message: Message) {
        if let Some(key) = &message.dedup_key
            && message.state.is_active()
        {
            self.dedup.insert(key.clone(), message.id);
        }
        if message.state == MessageState::Pending {
            self.push_schedule(&message);
        }
        self.messages.insert(message.id, message);
    }

    fn release_dedup(&mut self, message: &Message) {
        if let Some(key) = &message.dedup_key
            && self.dedup.get(key) == Some(&message.id)
        {
            self.dedup.remove(key);
        }
    }

    fn active_holder(&self, key: &str) -> Option<&Message> {
        self.dedup
            .get(key)
            .and_then(|id| self.messages.get(id))
            .filter(|m| m.state.is_active())
    }
}

/// Storage held in process memory. All operations take one async lock, which
/// makes each of them atomic.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, message: Message) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.id) {
            return Err(StorageError::AlreadyExists(message.id));
        }
        state.insert(message);
        Ok(())
    }

    async fn put_if_absent(&self, message: Message) -> Result<PutOutcome, StorageError> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.id) {
            return Err(StorageError::AlreadyExists(message.id));
        }
        if let Some(key) = &message.dedup_key
            && let Some(existing) = state.active_holder(key)
        {
            return Ok(PutOutcome::Duplicate(existing.id));
        }
        let id = message.id;
        state.insert(message);
        Ok(PutOutcome::Inserted(id))
    }

    async fn find_by_dedup_key(&self, key: &str) -> Result<Option<Message>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.active_holder(key).cloned())
    }

    async fn reserve_ready(&self, now: DateTime<Utc>) -> Result<Option<Message>, StorageError> {
        let mut state = self.state.lock().await;
        state.prune();
        let Some(top) = state.schedule.peek() else {
            return Ok(None);
        };
        if top.not_before > now {
            return Ok(None);
        }
        let Some(entry) = state.schedule.pop() else {
            return Ok(None);
        };
        let Some(message) = state.messages.get_mut(&entry.id) else {
            return Ok(None);
        };
        message.state = MessageState::Reserved;
        message.reserved_at = Some(now);
        Ok(Some(message.clone()))
    }

    async fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let mut state = self.state.lock().await;
        state.prune();
        Ok(state.schedule.peek().map(|entry| entry.not_before))
    }

    async fn update_state(
        &self,
        id: MessageId,
        update: MessageUpdate,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&id) else {
            return Err(StorageError::NotFound(id));
        };
        if !update.holds(message) {
            return Err(StorageError::Conflict(id));
        }
        update.apply(message);
        let message = message.clone();

        if message.state.is_terminal() {
            state.release_dedup(&message);
        }
        if message.state == MessageState::Done {
            state.messages.remove(&id);
        }
        if message.state == MessageState::Pending {
            if let Some(key) = &message.dedup_key {
                state.dedup.entry(key.clone()).or_insert(id);
            }
            state.push_schedule(&message);
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: MessageId,
        reserved_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get(&id) else {
            return Err(StorageError::NotFound(id));
        };
        if message.state != MessageState::Reserved || message.reserved_at != Some(reserved_at) {
            return Err(StorageError::Conflict(id));
        }
        if let Some(message) = state.messages.remove(&id) {
            state.release_dedup(&message);
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.messages.get(&id).cloned())
    }

    async fn release_expired(
        &self,
        cutoff: DateTime<Utc>,
        held: &[MessageId],
    ) -> Result<Vec<MessageId>, StorageError> {
        let mut state = self.state.lock().await;
        let mut expired: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| m.state == MessageState::Reserved && m.reserved_at.is_some_and(|at| at < cutoff))
            .filter(|m| !held.contains(&m.id))
            .map(|m| m.id)
            .collect();
        expired.sort();

        for id in &expired {
            if let Some(message) = state.messages.get_mut(id) {
                message.state = MessageState::Pending;
                message.reserved_at = None;
                let message = message.clone();
                state.push_schedule(&message);
            }
        }
        Ok(expired)
    }

    async fn counts(&self) -> Result<QueueCounts, StorageError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for message in state.messages.values() {
            match message.state {
                MessageState::Pending => counts.pending += 1,
                MessageState::Reserved => counts.reserved += 1,
                MessageState::Dead => counts.dead += 1,
                MessageState::Done => {}
            }
        }
        Ok(counts)
    }

    async fn dead_letters(&self) -> Result<Vec<Message>, StorageError> {
        let state = self.state.lock().await;
        let mut dead: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.state == MessageState::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|m| m.id);
        Ok(dead)
    }

    async fn purge(&self) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let pending: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.state == MessageState::Pending)
            .cloned()
            .collect();
        for message in &pending {
            state.messages.remove(&message.id);
            state.release_dedup(message);
        }
        state.prune();
        Ok(pending.len())
    }
}
