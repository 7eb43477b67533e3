//! Broker transport abstraction.
//!
//! The crate never talks to a broker directly. Producers publish to partition
//! channels (`"{destination}-{partition}"`) and workers pull from them through
//! [`MessageTransport`]. The broker only needs plain queues with
//! acknowledgements; ordering and exclusivity come from the partition leases.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Delivery, Message};

#[cfg(any(test, feature = "test-utilities"))]
mod in_memory;

#[cfg(any(test, feature = "test-utilities"))]
pub use in_memory::InMemoryBroker;

/// Queue-style broker operations.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Make sure `channel` exists. Idempotent.
    async fn declare_channel(&self, channel: &str) -> Result<()>;

    /// Publish `message` to `channel`.
    async fn publish(&self, channel: &str, message: Message) -> Result<()>;

    /// Wait up to `timeout` for the next delivery on `channel`.
    ///
    /// Returns `Ok(None)` on timeout. Must be cancel-safe: dropping the future
    /// never loses a message.
    async fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery; the broker forgets the message.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery. With `requeue` the message is delivered again.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}
