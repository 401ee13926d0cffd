//! Error taxonomy.
//!
//! - `HandlerError`: one failed attempt. Always recovered by the processor and
//!   turned into a retry or dead-letter decision.
//! - `StorageError` / `RateLimitError` / `CodecError`: collaborator failures.
//! - `BuildError`: fatal configuration problems, reported by `QueueBuilder::build`.
//! - `QueueError`: what the public `Queue` operations return.

use thiserror::Error;

use super::ids::MessageId;

/// Failure of a single handler attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("got {got} args, handler expects {expected} args")]
    ArgumentMismatch { got: usize, expected: usize },

    #[error("argument {index} has the wrong shape: {reason}")]
    InvalidArgument { index: usize, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("rate limiter unavailable: {0}")]
    RateLimiterUnavailable(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    /// Deterministic failures: retrying the same message cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HandlerError::ArgumentMismatch { .. } | HandlerError::InvalidArgument { .. }
        )
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::InvalidArgument {
            index: 0,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("message {0} already exists")]
    AlreadyExists(MessageId),

    /// The caller's reservation expired or was replaced by another holder.
    #[error("message {0} is no longer held by this reservation")]
    Conflict(MessageId),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limiter wait cancelled")]
    Cancelled,

    #[error("rate limiter backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),

    #[error("decode: {0}")]
    Decode(String),
}

/// Configuration rejected by `QueueBuilder::build`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("queue has no handler")]
    MissingHandler,

    #[error("queue name must not be empty")]
    EmptyName,

    #[error("worker_limit must be at least 1")]
    ZeroWorkerLimit,

    #[error("rate limit needs at least one permit per non-zero interval")]
    InvalidRateLimit,

    #[error("poll_interval must be non-zero")]
    ZeroPollInterval,

    #[error("reservation_timeout must be non-zero")]
    ZeroReservationTimeout,

    #[error("queues must be built inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("shutdown deadline reached: {} in-flight messages abandoned, {pending} pending", abandoned.len())]
    ShutdownTimeout {
        abandoned: Vec<MessageId>,
        pending: usize,
    },

    #[error("message {0} is not dead-lettered")]
    NotDead(MessageId),

    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("queue '{0}' is already registered")]
    AlreadyRegistered(String),
}
