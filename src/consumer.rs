//! Partition-aware message consumer.
//!
//! [`MessageConsumer::subscribe`] joins one consumer group per destination
//! (`{subscriber_id}:{destination}`). Each group member runs its own
//! [`RebalanceCoordinator`]; the returned [`Subscription`] owns them all and
//! leaves every group on [`Subscription::close`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use partition_groups::{ConsumerConfig, MessageConsumer, NoopDuplicateDetector};
//! use partition_groups::group::InMemoryCoordinator;
//! use partition_groups::handler::handler_fn;
//! use partition_groups::transport::InMemoryBroker;
//!
//! # async fn example() -> partition_groups::Result<()> {
//! let consumer = MessageConsumer::new(
//!     Arc::new(InMemoryCoordinator::new()),
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(NoopDuplicateDetector),
//!     ConsumerConfig::default().with_partition_count(8),
//! );
//!
//! let subscription = consumer
//!     .subscribe(
//!         "billing",
//!         ["orders"],
//!         handler_fn(|message| {
//!             println!("{}", message.key);
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//! subscription.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::dedup::DuplicateMessageDetector;
use crate::error::{Error, Result};
use crate::group::{
    ConsumerConfig, CoordinationClient, MemberParams, MemberState, MemberSummary,
    RebalanceCoordinator,
};
use crate::handler::MessageHandler;
use crate::transport::MessageTransport;
use crate::types::{PartitionId, new_member_id};

/// Creates subscriptions that share one coordinator, transport and
/// duplicate detector.
pub struct MessageConsumer {
    coordinator: Arc<dyn CoordinationClient>,
    transport: Arc<dyn MessageTransport>,
    dedup: Arc<dyn DuplicateMessageDetector>,
    config: ConsumerConfig,
}

impl MessageConsumer {
    pub fn new(
        coordinator: Arc<dyn CoordinationClient>,
        transport: Arc<dyn MessageTransport>,
        dedup: Arc<dyn DuplicateMessageDetector>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            coordinator,
            transport,
            dedup,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Join the group of every destination in `destinations` as a new member.
    ///
    /// Duplicate destinations are joined once. If any join fails the members
    /// already joined leave again and the error is returned.
    pub async fn subscribe<I, S, H>(
        &self,
        subscriber_id: &str,
        destinations: I,
        handler: H,
    ) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: MessageHandler + 'static,
    {
        self.config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        if subscriber_id.trim().is_empty() {
            return Err(Error::Config("subscriber_id must not be empty".to_string()));
        }

        let destinations: BTreeSet<String> = destinations.into_iter().map(Into::into).collect();
        if destinations.is_empty() {
            return Err(Error::Config(
                "at least one destination is required".to_string(),
            ));
        }
        if destinations.iter().any(|d| d.trim().is_empty()) {
            return Err(Error::Config("destination names must not be empty".to_string()));
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let mut members = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let params = MemberParams {
                subscriber_id: subscriber_id.to_string(),
                destination: destination.clone(),
                member_id: new_member_id(),
                config: self.config.clone(),
                coordinator: self.coordinator.clone(),
                transport: self.transport.clone(),
                dedup: self.dedup.clone(),
                handler: handler.clone(),
            };

            match RebalanceCoordinator::join(params).await {
                Ok(member) => members.push(member),
                Err(e) => {
                    warn!(
                        subscriber_id,
                        destination = %destination,
                        error = %e,
                        "Subscribe failed, leaving groups already joined"
                    );
                    for member in &members {
                        let _ = member.close().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            subscriber_id,
            destinations = members.len(),
            "Subscription started"
        );
        Ok(Subscription {
            subscriber_id: subscriber_id.to_string(),
            members,
            closed: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("config", &self.config)
            .finish()
    }
}

/// A running subscription: one group member per destination.
///
/// Dropping it signals every member to leave; [`close`](Self::close) also
/// waits for them.
pub struct Subscription {
    subscriber_id: String,
    members: Vec<RebalanceCoordinator>,
    closed: AtomicBool,
}

impl Subscription {
    /// The subscriber id shared by every group this subscription joined.
    pub fn id(&self) -> &str {
        &self.subscriber_id
    }

    /// Destinations in ascending order.
    pub fn destinations(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.destination()).collect()
    }

    /// Member id per destination.
    pub fn member_ids(&self) -> BTreeMap<String, String> {
        self.members
            .iter()
            .map(|m| (m.destination().to_string(), m.member_id().to_string()))
            .collect()
    }

    pub fn member(&self, destination: &str) -> Option<&RebalanceCoordinator> {
        self.members.iter().find(|m| m.destination() == destination)
    }

    pub fn members(&self) -> &[RebalanceCoordinator] {
        &self.members
    }

    /// Owned partitions per destination.
    pub fn owned_partitions(&self) -> BTreeMap<String, Vec<PartitionId>> {
        self.members
            .iter()
            .map(|m| (m.destination().to_string(), m.owned_partitions()))
            .collect()
    }

    /// Member state per destination.
    pub fn state(&self) -> BTreeMap<String, MemberState> {
        self.members
            .iter()
            .map(|m| (m.destination().to_string(), m.state()))
            .collect()
    }

    pub fn summaries(&self) -> Vec<MemberSummary> {
        self.members.iter().map(|m| m.state_summary()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Leave every group and wait for the members to stop.
    ///
    /// Returns [`Error::Closed`] if the subscription was already closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        let mut first_error = None;
        for member in &self.members {
            if let Err(e) = member.close().await {
                warn!(
                    member_id = %member.member_id(),
                    group = %member.group(),
                    error = %e,
                    "Member did not shut down cleanly"
                );
                first_error.get_or_insert(e);
            }
        }
        info!(subscriber_id = %self.subscriber_id, "Subscription closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("members", &self.members)
            .field("closed", &self.is_closed())
            .finish()
    }
}
