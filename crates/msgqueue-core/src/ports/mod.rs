//! Ports: the traits at every seam between the engine and its collaborators.
//!
//! Storage and rate limiting are injected into `Queue` construction; nothing
//! is looked up from process-wide state.

pub mod clock;
pub mod codec;
pub mod event_sink;
pub mod rate_limiter;
pub mod storage;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::codec::Codec;
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::rate_limiter::{CounterStore, RateLimit, RateLimiter, Unlimited};
pub use self::storage::{PutOutcome, Storage};
