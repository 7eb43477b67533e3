//! Partition-aware message producer.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::constants::MAX_PARTITION_COUNT;
use crate::error::{Error, Result};
use crate::group::{CoordinationClient, metrics, retry};
use crate::router::{PartitionRouter, Route};
use crate::transport::MessageTransport;
use crate::types::{Message, partition_channel};

/// Publishes messages to the partition channel chosen by their key.
pub struct MessageProducer {
    coordinator: Arc<dyn CoordinationClient>,
    transport: Arc<dyn MessageTransport>,
    router: PartitionRouter,
}

impl MessageProducer {
    pub fn new(
        coordinator: Arc<dyn CoordinationClient>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            router: PartitionRouter::new(coordinator.clone()),
            coordinator,
            transport,
        }
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    /// Declare `destination` so messages can be sent before any consumer
    /// subscribes. Returns the stored partition count, which wins over
    /// `partition_count` if the destination already existed.
    pub async fn declare_destination(&self, destination: &str, partition_count: u32) -> Result<u32> {
        if partition_count == 0 || partition_count > MAX_PARTITION_COUNT {
            return Err(Error::Config(format!(
                "partition_count ({}) must be between 1 and {}",
                partition_count, MAX_PARTITION_COUNT
            )));
        }

        let stored = retry::with_coordination_policy("declare_destination", || {
            self.coordinator
                .declare_destination(destination, partition_count)
        })
        .await?;
        if stored != partition_count {
            warn!(
                destination,
                requested = partition_count,
                stored,
                "Destination already declared with another partition count"
            );
        }

        for partition in 0..stored {
            let channel = partition_channel(destination, partition);
            retry::with_transport_policy("declare_channel", || {
                self.transport.declare_channel(&channel)
            })
            .await?;
        }
        self.router.cache_partition_count(destination, stored);
        Ok(stored)
    }

    /// Send `payload` keyed by `key`.
    pub async fn send(
        &self,
        destination: &str,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.send_message(destination, Message::new(key, payload))
            .await
            .map(|_| ())
    }

    /// Send a prepared message, returning where it was routed.
    ///
    /// Stamps the `ID`, `DESTINATION` and `PARTITION_ID` headers. Transport
    /// errors are returned as-is.
    pub async fn send_message(&self, destination: &str, mut message: Message) -> Result<Route> {
        let route = self.router.route(destination, &message.key).await?;
        message.stamp_routing(destination, route.partition);
        let message_id = message.id.clone();

        match self.transport.publish(&route.channel, message).await {
            Ok(()) => {
                metrics::record_publish(destination, "success");
                debug!(
                    destination,
                    partition = route.partition,
                    message_id = %message_id,
                    "Published message"
                );
                Ok(route)
            }
            Err(e) => {
                metrics::record_publish(destination, "error");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer")
            .field("router", &self.router)
            .finish()
    }
}
