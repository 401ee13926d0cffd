//! msgqueue-core
//!
//! A task-queue engine: messages are stored, scheduled, rate-limited and
//! dispatched to a handler by a bounded worker pool, with exponential-backoff
//! retries and a dead-letter state.
//!
//! # Modules
//! - **domain**: messages, states, retry policy, events, errors
//! - **ports**: traits at the seams (Storage, RateLimiter, Clock, Codec, EventSink)
//! - **handler**: the `Handler` capability and typed-function adapters
//! - **impls**: in-process implementations of the ports
//! - **app**: builder, queue facade, processor, reaper, registry
//!
//! ```ignore
//! use msgqueue_core::{QueueBuilder, RateLimit};
//!
//! let queue = QueueBuilder::new("greetings")
//!     .handler_fn(|name: String| async move { tracing::info!("hello {name}") })
//!     .retry_limit(3)
//!     .rate_limit(RateLimit::every(Duration::from_secs(1)))
//!     .build()?;
//!
//! queue.call(("world",)).await?;
//! queue.close().await?;
//! ```

pub mod app;
pub mod domain;
pub mod handler;
pub mod impls;
pub mod ports;

pub use crate::app::{Queue, QueueBuilder, QueueConfig, QueueRegistry, QueueStatus};
pub use crate::domain::{
    HandlerError, Message, MessageId, MessageState, QueueError, QueueEvent, RetryPolicy,
};
pub use crate::handler::{Handler, handler_fn};
pub use crate::ports::{PutOutcome, RateLimit};
