//! Shared harness for consumer-group integration tests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use partition_groups::group::{
    CoordinationClient, InMemoryCoordinator, MemberSession, MembershipWatch, SessionMonitorConfig,
};
use partition_groups::handler::{FnHandler, MessageHandler, handler_fn};
use partition_groups::transport::InMemoryBroker;
use partition_groups::{
    ConsumerConfig, DuplicateMessageDetector, Error, FencingToken, HandlerError, MemberState,
    Message, MessageConsumer, MessageProducer, NoopDuplicateDetector, PartitionId, Subscription,
};

pub const DESTINATION: &str = "orders";
pub const SUBSCRIBER: &str = "billing";

/// Default deadline for convergence checks.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Short timings so rebalances settle in milliseconds.
pub fn fast_config(partition_count: u32) -> ConsumerConfig {
    ConsumerConfig {
        partition_count,
        heartbeat_interval: Duration::from_millis(30),
        rebalance_tick_interval: Duration::from_millis(20),
        max_consecutive_heartbeat_failures: 2,
        poll_timeout: Duration::from_millis(20),
        worker_drain_timeout: Duration::from_secs(2),
    }
}

pub fn random_key() -> String {
    format!("key-{}", fastrand::u32(..))
}

/// Messages received by one consumer, in handling order.
#[derive(Clone, Default)]
pub struct Received {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl Received {
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|m| m.id.clone()).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handler that records every message and succeeds.
    pub fn handler(
        &self,
    ) -> FnHandler<impl Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static> {
        let messages = self.messages.clone();
        handler_fn(move |message: &Message| {
            messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.clone());
            Ok(())
        })
    }
}

/// In-memory backend, broker and producer shared by all consumers of a test.
pub struct Cluster {
    pub coordinator: InMemoryCoordinator,
    pub broker: InMemoryBroker,
    pub producer: MessageProducer,
    pub partition_count: u32,
}

impl Cluster {
    pub async fn new(partition_count: u32) -> Self {
        Self::with_coordinator(InMemoryCoordinator::new(), partition_count).await
    }

    /// Cluster whose backend expires sessions per `session_config`.
    pub async fn with_session_config(
        partition_count: u32,
        session_config: SessionMonitorConfig,
    ) -> Self {
        Self::with_coordinator(
            InMemoryCoordinator::with_session_config(session_config),
            partition_count,
        )
        .await
    }

    async fn with_coordinator(coordinator: InMemoryCoordinator, partition_count: u32) -> Self {
        let broker = InMemoryBroker::new();
        let producer = MessageProducer::new(Arc::new(coordinator.clone()), Arc::new(broker.clone()));
        producer
            .declare_destination(DESTINATION, partition_count)
            .await
            .expect("declare destination");
        Self {
            coordinator,
            broker,
            producer,
            partition_count,
        }
    }

    pub fn consumer(&self) -> MessageConsumer {
        self.consumer_with_dedup(Arc::new(NoopDuplicateDetector))
    }

    pub fn consumer_with_dedup(&self, dedup: Arc<dyn DuplicateMessageDetector>) -> MessageConsumer {
        MessageConsumer::new(
            Arc::new(self.coordinator.clone()),
            Arc::new(self.broker.clone()),
            dedup,
            fast_config(self.partition_count),
        )
    }

    /// Consumer with its own coordination client and config.
    pub fn custom_consumer(
        &self,
        coordinator: Arc<dyn CoordinationClient>,
        config: ConsumerConfig,
    ) -> MessageConsumer {
        MessageConsumer::new(
            coordinator,
            Arc::new(self.broker.clone()),
            Arc::new(NoopDuplicateDetector),
            config,
        )
    }

    /// Subscribe a new recording consumer to [`DESTINATION`].
    pub async fn join(&self) -> (Subscription, Received) {
        self.join_with(self.consumer()).await
    }

    /// Subscribe a recording handler through `consumer`.
    pub async fn join_with(&self, consumer: MessageConsumer) -> (Subscription, Received) {
        let received = Received::default();
        let subscription = consumer
            .subscribe(SUBSCRIBER, [DESTINATION], received.handler())
            .await
            .expect("subscribe");
        (subscription, received)
    }

    /// Subscribe `handler` through a consumer using `config`.
    pub async fn join_handler<H: MessageHandler + 'static>(
        &self,
        config: ConsumerConfig,
        handler: H,
    ) -> Subscription {
        self.custom_consumer(Arc::new(self.coordinator.clone()), config)
            .subscribe(SUBSCRIBER, [DESTINATION], handler)
            .await
            .expect("subscribe")
    }

    /// Send `count` messages with random keys and sequence-numbered payloads.
    pub async fn send_random(&self, count: usize) {
        for seq in 0..count {
            self.producer
                .send(DESTINATION, random_key(), seq.to_string())
                .await
                .expect("send");
        }
    }
}

/// True once every subscription is `Stable` on the latest snapshot, owns
/// exactly its assigned partitions, and together they own each partition
/// exactly once.
pub fn converged(subscriptions: &[&Subscription], partition_count: u32) -> bool {
    let mut seen = BTreeSet::new();
    for subscription in subscriptions {
        let Some(member) = subscription.member(DESTINATION) else {
            return false;
        };
        let status = member.status();
        if status.state != MemberState::Stable || status.group_size != subscriptions.len() {
            return false;
        }
        let owned = member.owned_partitions();
        if owned != status.assigned {
            return false;
        }
        for partition in owned {
            if !seen.insert(partition) {
                return false;
            }
        }
    }
    seen.len() == partition_count as usize
}

pub fn total(received: &[&Received]) -> usize {
    received.iter().map(|r| r.count()).sum()
}

/// Coordination client of a member that can go silent, as if its process
/// froze: heartbeats are swallowed and every other call fails.
#[derive(Clone)]
pub struct SilencingCoordinator {
    inner: InMemoryCoordinator,
    silent: Arc<AtomicBool>,
}

impl SilencingCoordinator {
    pub fn new(inner: InMemoryCoordinator) -> Self {
        Self {
            inner,
            silent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn go_silent(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> partition_groups::Result<()> {
        if self.silent.load(Ordering::SeqCst) {
            Err(Error::CoordinationUnavailable("member is silent".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationClient for SilencingCoordinator {
    async fn declare_destination(&self, destination: &str, partition_count: u32) -> partition_groups::Result<u32> {
        self.check()?;
        self.inner.declare_destination(destination, partition_count).await
    }

    async fn partition_count(&self, destination: &str) -> partition_groups::Result<Option<u32>> {
        self.check()?;
        self.inner.partition_count(destination).await
    }

    async fn register(&self, group: &str, member_id: &str) -> partition_groups::Result<MemberSession> {
        self.check()?;
        self.inner.register(group, member_id).await
    }

    async fn heartbeat(&self, session: &MemberSession) -> partition_groups::Result<()> {
        if self.silent.load(Ordering::SeqCst) {
            // Dropped on the floor: the backend never hears from the member
            return Ok(());
        }
        self.inner.heartbeat(session).await
    }

    async fn deregister(&self, session: &MemberSession) -> partition_groups::Result<()> {
        self.check()?;
        self.inner.deregister(session).await
    }

    async fn watch_members(&self, group: &str) -> partition_groups::Result<MembershipWatch> {
        self.check()?;
        self.inner.watch_members(group).await
    }

    async fn try_acquire_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
    ) -> partition_groups::Result<Option<FencingToken>> {
        self.check()?;
        self.inner.try_acquire_lease(session, partition).await
    }

    async fn release_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
        token: FencingToken,
    ) -> partition_groups::Result<()> {
        self.check()?;
        self.inner.release_lease(session, partition, token).await
    }
}
