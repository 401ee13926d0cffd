//! Handler dispatch.
//!
//! Two ways to process messages:
//! - **`Handler`**: implement `handle_message(&Message)` directly. Full access
//!   to message metadata.
//! - **`FnHandler`**: wrap a plain async function over typed arguments. The
//!   arguments are decoded from the message and bound positionally.
//!
//! Both end up as `Arc<dyn Handler>` inside the processor.

pub mod dispatch;
pub mod func;
pub mod result;

pub use self::dispatch::{Handler, HandlerFn};
pub use self::func::{FnHandler, HandlerFunc, handler_fn};
pub use self::result::IntoHandlerResult;
