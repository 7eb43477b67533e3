//! # partition-groups
//! Partition-aware consumer groups for message brokers that have no native
//! partitions.
//!
//! A logical destination is split into `N` physical channels
//! (`{destination}-{p}`). Producers route each message by key with Kafka's
//! murmur2 partitioner, so equal keys always land on the same channel.
//! Consumers sharing a subscriber id form a group per destination; every
//! member computes the same range assignment over the same membership
//! snapshot and takes exclusive, fenced leases on its share.
//!
//! The result is per-key ordering with at most one live consumer delivering
//! a given partition at any time, even across rebalances, session loss and
//! backend outages.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use partition_groups::prelude::*;
//! use partition_groups::group::InMemoryCoordinator;
//! use partition_groups::transport::InMemoryBroker;
//!
//! #[tokio::main]
//! async fn main() -> partition_groups::Result<()> {
//!     let coordinator = Arc::new(InMemoryCoordinator::new());
//!     let broker = Arc::new(InMemoryBroker::new());
//!
//!     let producer = MessageProducer::new(coordinator.clone(), broker.clone());
//!     producer.declare_destination("orders", 4).await?;
//!
//!     let consumer = MessageConsumer::new(
//!         coordinator,
//!         broker,
//!         Arc::new(NoopDuplicateDetector),
//!         ConsumerConfig::default().with_partition_count(4),
//!     );
//!     let subscription = consumer
//!         .subscribe(
//!             "billing",
//!             ["orders"],
//!             handler_fn(|message| {
//!                 println!("{} -> {:?}", message.key, message.partition());
//!                 Ok(())
//!             }),
//!         )
//!         .await?;
//!
//!     producer.send("orders", "customer-42", "created").await?;
//!
//!     subscription.close().await
//! }
//! ```
//!
//! The in-memory coordinator and broker require the `test-utilities`
//! feature. Production deployments implement
//! [`CoordinationClient`](group::CoordinationClient) and
//! [`MessageTransport`](transport::MessageTransport) for their own backend.

#![forbid(unsafe_code)]

pub mod constants;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod group;
pub mod handler;
pub mod producer;
pub mod router;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use consumer::{MessageConsumer, Subscription};
pub use dedup::{DuplicateMessageDetector, InMemoryDuplicateDetector, NoopDuplicateDetector};
pub use error::{Error, HandlerError, Result};
pub use group::{ConfigProfile, ConsumerConfig, MemberState};
pub use producer::MessageProducer;
pub use types::{Delivery, FencingToken, Message, PartitionId};

pub mod prelude {
    //! Everything needed to produce and consume.
    pub use crate::consumer::{MessageConsumer, Subscription};
    pub use crate::dedup::{DuplicateMessageDetector, NoopDuplicateDetector};
    pub use crate::error::{Error, HandlerError, Result};
    pub use crate::group::{ConfigProfile, ConsumerConfig, MemberState};
    pub use crate::handler::{MessageHandler, handler_fn};
    pub use crate::producer::MessageProducer;
    pub use crate::types::{Message, PartitionId};

    pub use bytes;
}
