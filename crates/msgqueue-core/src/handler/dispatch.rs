//! The `Handler` capability and its message-level closure adapter.

use std::future::Future;

use async_trait::async_trait;

use super::result::IntoHandlerResult;
use crate::domain::{HandlerError, Message};

/// Processes one message. `Err` is a failed attempt; the processor decides
/// whether to retry.
///
/// Implement this directly when the handler needs message metadata (id,
/// retry count, raw body). Plain functions over typed arguments go through
/// [`FnHandler`](super::FnHandler) instead.
///
/// ```ignore
/// struct Audit;
///
/// #[async_trait]
/// impl Handler for Audit {
///     async fn handle_message(&self, msg: &Message) -> Result<(), HandlerError> {
///         tracing::info!(message_id = %msg.id, retry = msg.retry_count, "audit");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_message(&self, msg: &Message) -> Result<(), HandlerError>;
}

/// Adapts `Fn(Message) -> Future` into a `Handler`.
pub struct HandlerFn<F> {
    func: F,
}

impl<F> HandlerFn<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut, R> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult,
{
    async fn handle_message(&self, msg: &Message) -> Result<(), HandlerError> {
        (self.func)(msg.clone()).await.into_handler_result()
    }
}
