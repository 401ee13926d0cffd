//! Implementations of the ports.
//!
//! Everything here is process-local. Shared backends implement `Storage` and
//! `CounterStore` in their own crates and are injected through `QueueBuilder`.

pub mod json_codec;
pub mod memory_storage;
pub mod token_bucket;
pub mod tracing_sink;
pub mod window_limiter;

pub use self::json_codec::JsonCodec;
pub use self::memory_storage::MemoryStorage;
pub use self::token_bucket::TokenBucketLimiter;
pub use self::tracing_sink::TracingEventSink;
pub use self::window_limiter::{MemoryCounterStore, WindowLimiter};
