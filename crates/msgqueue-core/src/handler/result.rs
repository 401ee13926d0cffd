//! Conversion of handler return values into an attempt result.

use std::fmt::Display;

use crate::domain::HandlerError;

/// A handler's return value. `()` always succeeds; `Err(e)` becomes
/// `HandlerError::Failed(e.to_string())`.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> Result<(), HandlerError>;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl<E: Display> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> Result<(), HandlerError> {
        self.map_err(|e| HandlerError::Failed(e.to_string()))
    }
}
