//! Plain functions as handlers.
//!
//! `FnHandler` adapts any `Fn(A, B, ..) -> impl Future` whose parameters are
//! `DeserializeOwned` into a [`Handler`]. The parameter shape is fixed at
//! compile time through [`HandlerFunc`]; at run time only the argument count
//! and each argument's JSON shape are checked.
//!
//! Arguments come from the message body (decoded with the handler's codec)
//! when the body is non-empty, otherwise from `Message::args` in order.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use super::dispatch::Handler;
use super::result::IntoHandlerResult;
use crate::domain::{HandlerError, Message};
use crate::impls::JsonCodec;
use crate::ports::Codec;

/// A function callable with decoded arguments of shape `Args`.
///
/// Implemented for closures and fns of up to eight parameters. `Args` is the
/// parameter tuple and only exists to keep the impls apart.
pub trait HandlerFunc<Args>: Send + Sync + 'static {
    /// Declared parameter count.
    const ARITY: usize;

    /// Bind `args` to the parameters and start the call.
    ///
    /// `args.len()` must equal `ARITY`.
    fn call(&self, args: Vec<serde_json::Value>)
    -> Result<BoxFuture<'static, Result<(), HandlerError>>, HandlerError>;
}

fn bind<T: DeserializeOwned>(index: usize, value: serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(value).map_err(|e| HandlerError::InvalidArgument {
        index,
        reason: e.to_string(),
    })
}

macro_rules! impl_handler_func {
    ($arity:expr; $($ty:ident),*) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<F, Fut, R, $($ty,)*> HandlerFunc<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: IntoHandlerResult,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn call(
                &self,
                args: Vec<serde_json::Value>,
            ) -> Result<BoxFuture<'static, Result<(), HandlerError>>, HandlerError> {
                let got = args.len();
                let mut args = args.into_iter().enumerate();
                $(
                    let $ty: $ty = match args.next() {
                        Some((index, value)) => bind(index, value)?,
                        None => return Err(HandlerError::ArgumentMismatch { got, expected: $arity }),
                    };
                )*
                let fut = (self)($($ty),*);
                Ok(Box::pin(async move { fut.await.into_handler_result() }))
            }
        }
    };
}

impl_handler_func!(0;);
impl_handler_func!(1; A1);
impl_handler_func!(2; A1, A2);
impl_handler_func!(3; A1, A2, A3);
impl_handler_func!(4; A1, A2, A3, A4);
impl_handler_func!(5; A1, A2, A3, A4, A5);
impl_handler_func!(6; A1, A2, A3, A4, A5, A6);
impl_handler_func!(7; A1, A2, A3, A4, A5, A6, A7);
impl_handler_func!(8; A1, A2, A3, A4, A5, A6, A7, A8);

/// A [`HandlerFunc`] adapted into a [`Handler`].
pub struct FnHandler<F, Args> {
    func: F,
    codec: Arc<dyn Codec>,
    _marker: PhantomData<fn() -> Args>,
}

impl<F, Args> FnHandler<F, Args>
where
    F: HandlerFunc<Args>,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            codec: Arc::new(JsonCodec),
            _marker: PhantomData,
        }
    }

    /// Codec used to decode non-empty message bodies.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn arity(&self) -> usize {
        F::ARITY
    }

    fn arguments(&self, msg: &Message) -> Result<Vec<serde_json::Value>, HandlerError> {
        if msg.body.is_empty() {
            return Ok(msg.args.clone());
        }
        Ok(self.codec.decode(&msg.body)?)
    }
}

#[async_trait]
impl<F, Args> Handler for FnHandler<F, Args>
where
    F: HandlerFunc<Args>,
    Args: 'static,
{
    async fn handle_message(&self, msg: &Message) -> Result<(), HandlerError> {
        let args = self.arguments(msg)?;
        if args.len() != F::ARITY {
            return Err(HandlerError::ArgumentMismatch {
                got: args.len(),
                expected: F::ARITY,
            });
        }
        self.func.call(args)?.await
    }
}

/// Shorthand for [`FnHandler::new`].
pub fn handler_fn<F, Args>(func: F) -> FnHandler<F, Args>
where
    F: HandlerFunc<Args>,
{
    FnHandler::new(func)
}
