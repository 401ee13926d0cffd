//! App layer: wires ports into a running queue.
//!
//! - **QueueBuilder** / **QueueConfig**: construction and validation
//! - **Queue**: the public facade (`add`, `call`, `call_once`, `close`)
//! - **Processor**: dispatcher loop and per-message workers
//! - **ReaperLoop**: reclaims expired reservations
//! - **QueueRegistry**: named queues closed together

pub mod builder;
pub mod config;
mod processor;
pub mod queue;
mod reaper_loop;
pub mod registry;
pub mod status;

pub use self::builder::QueueBuilder;
pub use self::config::{QueueConfig, RateLimitConfig, RateLimitStrategy};
pub use self::queue::Queue;
pub use self::registry::QueueRegistry;
pub use self::status::QueueStatus;
