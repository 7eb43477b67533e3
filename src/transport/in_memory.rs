//! In-process broker for tests and demos.
//!
//! Each channel is a FIFO of ready messages plus a table of unacked
//! deliveries. A requeueing nack puts the message back at the front, flagged
//! as redelivered. Clones share the same channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use super::MessageTransport;
use crate::error::{Error, Result};
use crate::types::{Delivery, Message};

#[derive(Debug, Default)]
struct QueueState {
    /// (message, redelivered)
    ready: VecDeque<(Message, bool)>,
    unacked: HashMap<u64, Message>,
    dropped: u64,
}

#[derive(Debug, Default)]
struct ChannelQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Shared in-memory [`MessageTransport`].
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    channels: Arc<DashMap<String, Arc<ChannelQueue>>>,
    next_tag: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_tag: Arc::new(AtomicU64::new(1)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the broker.
    pub fn set_available(&self, available: bool) {
        info!(available, "In-memory broker availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting to be delivered on `channel`.
    pub async fn pending_count(&self, channel: &str) -> usize {
        match self.channels.get(channel).map(|q| q.clone()) {
            Some(queue) => queue.state.lock().await.ready.len(),
            None => 0,
        }
    }

    /// Deliveries on `channel` neither acked nor nacked yet.
    pub async fn unacked_count(&self, channel: &str) -> usize {
        match self.channels.get(channel).map(|q| q.clone()) {
            Some(queue) => queue.state.lock().await.unacked.len(),
            None => 0,
        }
    }

    /// Messages discarded by a nack without requeue.
    pub async fn dropped_count(&self, channel: &str) -> u64 {
        match self.channels.get(channel).map(|q| q.clone()) {
            Some(queue) => queue.state.lock().await.dropped,
            None => 0,
        }
    }

    /// Names of all channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transport("in-memory broker is unavailable".to_string()))
        }
    }

    fn queue(&self, channel: &str) -> Arc<ChannelQueue> {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl MessageTransport for InMemoryBroker {
    async fn declare_channel(&self, channel: &str) -> Result<()> {
        self.ensure_available()?;
        self.queue(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: Message) -> Result<()> {
        self.ensure_available()?;
        let queue = self.queue(channel);
        queue.state.lock().await.ready.push_back((message, false));
        queue.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, channel: &str, timeout: Duration) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let queue = self.queue(channel);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking, so a publish between the
            // check and the wait is not missed.
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = queue.state.lock().await;
                if let Some((message, redelivered)) = state.ready.pop_front() {
                    let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
                    state.unacked.insert(delivery_tag, message.clone());
                    // Pass the wakeup on if more messages are waiting
                    if !state.ready.is_empty() {
                        queue.notify.notify_one();
                    }
                    return Ok(Some(Delivery {
                        channel: channel.to_string(),
                        delivery_tag,
                        redelivered,
                        message,
                    }));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;
        let queue = self.queue(&delivery.channel);
        let mut state = queue.state.lock().await;
        state
            .unacked
            .remove(&delivery.delivery_tag)
            .map(|_| ())
            .ok_or_else(|| {
                Error::Transport(format!(
                    "unknown delivery tag {} on {}",
                    delivery.delivery_tag, delivery.channel
                ))
            })
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_available()?;
        let queue = self.queue(&delivery.channel);
        let mut state = queue.state.lock().await;
        let message = state.unacked.remove(&delivery.delivery_tag).ok_or_else(|| {
            Error::Transport(format!(
                "unknown delivery tag {} on {}",
                delivery.delivery_tag, delivery.channel
            ))
        })?;

        if requeue {
            state.ready.push_front((message, true));
            drop(state);
            queue.notify.notify_one();
        } else {
            state.dropped += 1;
            debug!(channel = %delivery.channel, message_id = %message.id, "Dropped nacked message");
        }
        Ok(())
    }
}
