//! Domain model: messages, their states, the retry policy and errors.

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod retry;
pub mod state;

pub use self::errors::{
    BuildError, CodecError, HandlerError, QueueError, RateLimitError, RegistryError, StorageError,
};
pub use self::events::QueueEvent;
pub use self::ids::MessageId;
pub use self::message::{Message, MessageUpdate};
pub use self::retry::{RetryDecision, RetryPolicy};
pub use self::state::{MessageState, QueueCounts};
