//! Message handler capability.
//!
//! A handler is called once per delivery that passed fencing and duplicate
//! detection. Returning `Err` nacks the message for redelivery; the worker
//! keeps running.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::types::Message;

/// Processes messages for a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Adapter turning a synchronous closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.f)(message)
    }
}

/// Wrap a closure as a handler.
///
/// ```rust
/// use partition_groups::handler::{MessageHandler, handler_fn};
///
/// let handler = handler_fn(|message| {
///     println!("got {}", message.id);
///     Ok(())
/// });
/// # let _: &dyn MessageHandler = &handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler { f }
}
