//! Duplicate message detection.
//!
//! Delivery is at-least-once: a message can reach a worker again after a
//! rebalance, a handler error or a lost ack. Workers consult a
//! [`DuplicateMessageDetector`] before invoking the handler and ack
//! duplicates without handling them.

use async_trait::async_trait;
use dashmap::DashSet;

use crate::error::Result;

/// Decides whether a message was already processed by a consumer.
#[async_trait]
pub trait DuplicateMessageDetector: Send + Sync {
    /// Returns `true` if `(consumer_id, message_id)` was seen before.
    ///
    /// Implementations record the pair on the first call, so the first
    /// delivery is never a duplicate.
    async fn is_duplicate(&self, consumer_id: &str, message_id: &str) -> Result<bool>;

    /// Forget a pair whose handling failed, so the redelivery is handled.
    async fn processing_failed(&self, _consumer_id: &str, _message_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Never reports duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDuplicateDetector;

#[async_trait]
impl DuplicateMessageDetector for NoopDuplicateDetector {
    async fn is_duplicate(&self, _consumer_id: &str, _message_id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Process-local detector backed by a concurrent set.
///
/// Grows without bound; meant for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryDuplicateDetector {
    seen: DashSet<(String, String)>,
}

impl InMemoryDuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a message as processed without going through a worker.
    pub fn mark_processed(&self, consumer_id: &str, message_id: &str) {
        self.seen
            .insert((consumer_id.to_string(), message_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl DuplicateMessageDetector for InMemoryDuplicateDetector {
    async fn is_duplicate(&self, consumer_id: &str, message_id: &str) -> Result<bool> {
        // insert returns false if the pair was already present
        Ok(!self
            .seen
            .insert((consumer_id.to_string(), message_id.to_string())))
    }

    async fn processing_failed(&self, consumer_id: &str, message_id: &str) -> Result<()> {
        self.seen
            .remove(&(consumer_id.to_string(), message_id.to_string()));
        Ok(())
    }
}
