//! Partition consumer worker.
//!
//! One worker task runs per owned partition lease. It pulls deliveries from
//! the partition channel and passes each one through:
//!
//! 1. the [`DeliveryGuard`] - on failure the delivery is requeued and the
//!    worker exits with [`WorkerExit::Fenced`]
//! 2. the duplicate detector - duplicates are acked without handling
//! 3. the handler - `Ok` acks, `Err` or a panic requeues and the worker keeps
//!    running
//!
//! Stopping never interrupts a handler call: the stop signal is only observed
//! between deliveries and while waiting for the next one.
//!
//! Every received delivery stays in the worker's unsettled set until the
//! broker accepted its ack or nack. A failed settlement is retried before the
//! next receive, and whatever is still unsettled when the task ends (aborted
//! after the drain timeout, panicked, broker down) is settled by
//! [`PartitionWorker::stop`]: pending acks are acked, everything else is
//! requeued.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::metrics;
use super::ownership_guard::DeliveryGuard;
use super::retry;
use crate::constants::MAX_TRANSPORT_BACKOFF_MS;
use crate::dedup::DuplicateMessageDetector;
use crate::error::HandlerError;
use crate::handler::MessageHandler;
use crate::transport::MessageTransport;
use crate::types::{Delivery, FencingToken, GroupId, PartitionId};

const INITIAL_BACKOFF_MS: u64 = 10;

/// Why a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request after finishing its in-flight delivery.
    Stopped,
    /// The delivery guard failed; ownership was lost.
    Fenced,
    /// Did not stop within the drain timeout and was aborted, or panicked.
    Aborted,
}

/// How an unsettled delivery must be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
}

/// Deliveries received but not yet acked or nacked by the broker.
#[derive(Debug, Default)]
struct Unsettled {
    deliveries: Mutex<Vec<(Delivery, Settle)>>,
}

impl Unsettled {
    fn lock(&self) -> MutexGuard<'_, Vec<(Delivery, Settle)>> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a fresh delivery; it is requeued unless handled.
    fn track(&self, delivery: &Delivery) {
        self.lock().push((delivery.clone(), Settle::Requeue));
    }

    fn mark(&self, delivery_tag: u64, settle: Settle) {
        if let Some(entry) = self.lock().iter_mut().find(|(d, _)| d.delivery_tag == delivery_tag) {
            entry.1 = settle;
        }
    }

    fn settled(&self, delivery_tag: u64) {
        self.lock().retain(|(d, _)| d.delivery_tag != delivery_tag);
    }

    fn take(&self) -> Vec<(Delivery, Settle)> {
        std::mem::take(&mut *self.lock())
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Everything a worker needs to consume one partition.
#[derive(Clone)]
pub struct WorkerContext {
    pub group: GroupId,
    pub subscriber_id: String,
    pub channel: String,
    pub guard: DeliveryGuard,
    pub transport: Arc<dyn MessageTransport>,
    pub dedup: Arc<dyn DuplicateMessageDetector>,
    pub handler: Arc<dyn MessageHandler>,
    pub poll_timeout: Duration,
}

/// Handle to a running worker task.
pub struct PartitionWorker {
    partition: PartitionId,
    token: FencingToken,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
    channel: String,
    transport: Arc<dyn MessageTransport>,
    unsettled: Arc<Unsettled>,
}

impl PartitionWorker {
    pub fn spawn(ctx: WorkerContext) -> Self {
        let partition = ctx.guard.partition();
        let token = ctx.guard.token();
        let (stop_tx, stop_rx) = watch::channel(false);
        let channel = ctx.channel.clone();
        let transport = ctx.transport.clone();
        let unsettled = Arc::new(Unsettled::default());

        metrics::inc_active_workers();
        let task_unsettled = unsettled.clone();
        let handle = tokio::spawn(async move {
            let exit = run(ctx, task_unsettled, stop_rx).await;
            metrics::dec_active_workers();
            exit
        });

        Self {
            partition,
            token,
            stop_tx,
            handle,
            channel,
            transport,
            unsettled,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn token(&self) -> FencingToken {
        self.token
    }

    /// True once the task has ended on its own (fenced) or was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the worker to stop without waiting for it.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop the worker and wait until its in-flight delivery is finished.
    ///
    /// Aborts the task if it does not finish within `drain_timeout`. Deliveries
    /// the task left unsettled are settled here, so none stays unacked.
    pub async fn stop(mut self, drain_timeout: Duration) -> WorkerExit {
        self.signal_stop();
        let exit = match tokio::time::timeout(drain_timeout, &mut self.handle).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                error!(partition = self.partition, error = %e, "Partition worker task failed");
                metrics::dec_active_workers();
                WorkerExit::Aborted
            }
            Err(_) => {
                warn!(
                    partition = self.partition,
                    drain_timeout_ms = drain_timeout.as_millis() as u64,
                    "Partition worker did not drain in time, aborting"
                );
                self.handle.abort();
                let _ = tokio::time::timeout(drain_timeout, &mut self.handle).await;
                metrics::dec_active_workers();
                WorkerExit::Aborted
            }
        };
        self.settle_leftovers().await;
        exit
    }

    async fn settle_leftovers(&self) {
        for (delivery, settle) in self.unsettled.take() {
            info!(
                partition = self.partition,
                channel = %self.channel,
                message_id = %delivery.message.id,
                settle = ?settle,
                "Settling delivery left by stopped worker"
            );
            if let Err(e) = settle_with_retry(self.transport.as_ref(), &delivery, settle).await {
                error!(
                    channel = %delivery.channel,
                    message_id = %delivery.message.id,
                    error = %e,
                    "Failed to settle delivery left by stopped worker"
                );
            }
        }
    }
}

impl std::fmt::Debug for PartitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWorker")
            .field("partition", &self.partition)
            .field("token", &self.token)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Exponential backoff with jitter, capped at `MAX_TRANSPORT_BACKOFF_MS`.
fn backoff_delay(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_TRANSPORT_BACKOFF_MS);
    let jitter = fastrand::u64(0..=base / 2);
    Duration::from_millis((base + jitter).min(MAX_TRANSPORT_BACKOFF_MS))
}

/// Sleep unless a stop is requested first. Returns `true` if stopped.
async fn sleep_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

enum Step {
    Continue,
    Retry,
    Fenced,
}

async fn run(
    ctx: WorkerContext,
    unsettled: Arc<Unsettled>,
    mut stop_rx: watch::Receiver<bool>,
) -> WorkerExit {
    let partition = ctx.guard.partition();
    info!(
        group = %ctx.group,
        partition,
        token = ctx.guard.token().value(),
        channel = %ctx.channel,
        "Partition worker started"
    );

    let mut failures: u32 = 0;
    let exit = loop {
        if *stop_rx.borrow() {
            break WorkerExit::Stopped;
        }

        if !unsettled.is_empty() && !retry_unsettled(&ctx, &unsettled).await {
            failures = failures.saturating_add(1);
            if sleep_or_stop(backoff_delay(failures), &mut stop_rx).await {
                break WorkerExit::Stopped;
            }
            continue;
        }

        let received = tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break WorkerExit::Stopped;
                }
                continue;
            }
            received = ctx.transport.receive(&ctx.channel, ctx.poll_timeout) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => {
                unsettled.track(&delivery);
                delivery
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    group = %ctx.group,
                    partition,
                    error = %e,
                    "Failed to receive from partition channel"
                );
                failures = failures.saturating_add(1);
                if sleep_or_stop(backoff_delay(failures), &mut stop_rx).await {
                    break WorkerExit::Stopped;
                }
                continue;
            }
        };

        match process(&ctx, &unsettled, delivery).await {
            Step::Continue => failures = 0,
            Step::Retry => {
                failures = failures.saturating_add(1);
                if sleep_or_stop(backoff_delay(failures), &mut stop_rx).await {
                    break WorkerExit::Stopped;
                }
            }
            Step::Fenced => break WorkerExit::Fenced,
        }
    };

    info!(group = %ctx.group, partition, exit = ?exit, "Partition worker stopped");
    exit
}

async fn process(ctx: &WorkerContext, unsettled: &Unsettled, delivery: Delivery) -> Step {
    let partition = ctx.guard.partition();

    let permit = match ctx.guard.validate_for_delivery() {
        Ok(permit) => permit,
        Err(e) => {
            debug!(group = %ctx.group, partition, error = %e, "Requeueing fenced delivery");
            nack(ctx, unsettled, &delivery).await;
            metrics::record_delivery(&ctx.group, "fenced");
            return Step::Fenced;
        }
    };

    let message_id = delivery.message.id.as_str();
    match ctx.dedup.is_duplicate(&ctx.subscriber_id, message_id).await {
        Ok(true) => {
            debug!(group = %ctx.group, partition, message_id, "Acking duplicate message");
            ack(ctx, unsettled, &delivery).await;
            metrics::record_delivery(&ctx.group, "duplicate");
            return Step::Continue;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(group = %ctx.group, partition, message_id, error = %e, "Duplicate check failed");
            nack(ctx, unsettled, &delivery).await;
            metrics::record_delivery(&ctx.group, "dedup_error");
            return Step::Retry;
        }
    }

    let outcome = AssertUnwindSafe(ctx.handler.handle(&delivery.message))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

    match outcome {
        Ok(()) => {
            debug!(
                group = %ctx.group,
                partition = permit.partition(),
                token = permit.token().value(),
                message_id,
                "Handled message"
            );
            ack(ctx, unsettled, &delivery).await;
            metrics::record_delivery(&ctx.group, "handled");
            Step::Continue
        }
        Err(e) => {
            warn!(
                group = %ctx.group,
                partition,
                message_id,
                redelivered = delivery.redelivered,
                error = %e,
                "Handler failed, requeueing message"
            );
            if let Err(e) = ctx
                .dedup
                .processing_failed(&ctx.subscriber_id, message_id)
                .await
            {
                warn!(group = %ctx.group, message_id, error = %e, "Failed to reset duplicate detector");
            }
            nack(ctx, unsettled, &delivery).await;
            metrics::record_delivery(&ctx.group, "handler_error");
            Step::Retry
        }
    }
}

async fn ack(ctx: &WorkerContext, unsettled: &Unsettled, delivery: &Delivery) {
    settle_delivery(ctx, unsettled, delivery, Settle::Ack).await;
}

async fn nack(ctx: &WorkerContext, unsettled: &Unsettled, delivery: &Delivery) {
    settle_delivery(ctx, unsettled, delivery, Settle::Requeue).await;
}

async fn settle_delivery(
    ctx: &WorkerContext,
    unsettled: &Unsettled,
    delivery: &Delivery,
    settle: Settle,
) {
    match settle_with_retry(ctx.transport.as_ref(), delivery, settle).await {
        Ok(()) => unsettled.settled(delivery.delivery_tag),
        Err(e) => {
            unsettled.mark(delivery.delivery_tag, settle);
            error!(
                channel = %delivery.channel,
                message_id = %delivery.message.id,
                settle = ?settle,
                error = %e,
                "Failed to settle delivery, keeping it for retry"
            );
        }
    }
}

async fn settle_with_retry(
    transport: &dyn MessageTransport,
    delivery: &Delivery,
    settle: Settle,
) -> crate::error::Result<()> {
    match settle {
        Settle::Ack => retry::with_transport_policy("ack", || transport.ack(delivery)).await,
        Settle::Requeue => {
            retry::with_transport_policy("nack", || transport.nack(delivery, true)).await
        }
    }
}

/// Retry settlements that failed earlier. Returns `true` once none is left.
async fn retry_unsettled(ctx: &WorkerContext, unsettled: &Unsettled) -> bool {
    for (delivery, settle) in unsettled.take() {
        let result = match settle {
            Settle::Ack => ctx.transport.ack(&delivery).await,
            Settle::Requeue => ctx.transport.nack(&delivery, true).await,
        };
        match result {
            Ok(()) => debug!(
                group = %ctx.group,
                message_id = %delivery.message.id,
                settle = ?settle,
                "Settled delivery after earlier failure"
            ),
            Err(e) => {
                debug!(group = %ctx.group, message_id = %delivery.message.id, error = %e, "Settlement still failing");
                unsettled.lock().push((delivery, settle));
            }
        }
    }
    unsettled.is_empty()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{InMemoryDuplicateDetector, NoopDuplicateDetector};
    use crate::group::suspension::SuspensionState;
    use crate::group::traits::MemberSession;
    use crate::handler::handler_fn;
    use crate::transport::InMemoryBroker;
    use crate::types::Message;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHANNEL: &str = "orders-0";

    struct Harness {
        broker: InMemoryBroker,
        owned: Arc<DashMap<PartitionId, FencingToken>>,
        suspension: Arc<SuspensionState>,
        handled: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let owned = Arc::new(DashMap::new());
            owned.insert(0, FencingToken(1));
            Self {
                broker: InMemoryBroker::new(),
                owned,
                suspension: Arc::new(SuspensionState::new()),
                handled: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn spawn_with(
            &self,
            handler: Arc<dyn MessageHandler>,
            dedup: Arc<dyn DuplicateMessageDetector>,
        ) -> PartitionWorker {
            let guard = DeliveryGuard::new(
                "sub:orders".to_string(),
                0,
                FencingToken(1),
                self.owned.clone(),
                self.suspension.clone(),
                MemberSession::new("sub:orders", "member-a", 1),
            );
            PartitionWorker::spawn(WorkerContext {
                group: "sub:orders".to_string(),
                subscriber_id: "sub".to_string(),
                channel: CHANNEL.to_string(),
                guard,
                transport: Arc::new(self.broker.clone()),
                dedup,
                handler,
                poll_timeout: Duration::from_millis(20),
            })
        }

        fn spawn(&self) -> PartitionWorker {
            let handled = self.handled.clone();
            self.spawn_with(
                Arc::new(handler_fn(move |_| {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                Arc::new(NoopDuplicateDetector),
            )
        }

        async fn publish(&self, id: &str) {
            self.broker
                .publish(CHANNEL, Message::with_id(id, "k", "v"))
                .await
                .unwrap();
        }

        async fn wait_for_handled(&self, expected: usize) {
            for _ in 0..200 {
                if self.handled.load(Ordering::SeqCst) >= expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "expected {} handled, got {}",
                expected,
                self.handled.load(Ordering::SeqCst)
            );
        }
    }

    #[tokio::test]
    async fn test_worker_handles_and_acks() {
        let harness = Harness::new();
        let worker = harness.spawn();
        for i in 0..5 {
            harness.publish(&format!("m-{i}")).await;
        }

        harness.wait_for_handled(5).await;
        assert_eq!(worker.stop(Duration::from_secs(1)).await, WorkerExit::Stopped);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 0);
        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_without_handling() {
        let harness = Harness::new();
        let dedup = Arc::new(InMemoryDuplicateDetector::new());
        dedup.mark_processed("sub", "dup");
        let handled = harness.handled.clone();
        let worker = harness.spawn_with(
            Arc::new(handler_fn(move |_| {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            dedup,
        );

        harness.publish("dup").await;
        harness.publish("fresh").await;
        harness.wait_for_handled(1).await;
        worker.stop(Duration::from_secs(1)).await;

        assert_eq!(harness.handled.load(Ordering::SeqCst), 1);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 0);
        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_redelivers_and_keeps_running() {
        let harness = Harness::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handled = harness.handled.clone();
        let counter = attempts.clone();
        let worker = harness.spawn_with(
            Arc::new(handler_fn(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(HandlerError::failed("not yet"));
                }
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Arc::new(InMemoryDuplicateDetector::new()),
        );

        harness.publish("flaky").await;
        harness.wait_for_handled(1).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!worker.is_finished());
        worker.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let harness = Harness::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let handled = harness.handled.clone();
        let counter = attempts.clone();
        let worker = harness.spawn_with(
            Arc::new(handler_fn(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Arc::new(NoopDuplicateDetector),
        );

        harness.publish("explosive").await;
        harness.wait_for_handled(1).await;
        assert_eq!(worker.stop(Duration::from_secs(1)).await, WorkerExit::Stopped);
    }

    #[tokio::test]
    async fn test_lost_ownership_fences_and_requeues() {
        let harness = Harness::new();
        let worker = harness.spawn();
        harness.owned.remove(&0);

        harness.publish("orphan").await;

        for _ in 0..200 {
            if worker.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.stop(Duration::from_secs(1)).await, WorkerExit::Fenced);
        assert_eq!(harness.handled.load(Ordering::SeqCst), 0);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 1);
    }

    #[tokio::test]
    async fn test_suspension_fences() {
        let harness = Harness::new();
        let worker = harness.spawn();
        harness.suspension.enter();

        harness.publish("during-suspension").await;
        for _ in 0..200 {
            if worker.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.stop(Duration::from_secs(1)).await, WorkerExit::Fenced);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 1);
        harness.suspension.force_exit("shutdown");
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let harness = Harness::new();
        harness.broker.set_available(false);
        let worker = harness.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished());

        harness.broker.set_available(true);
        harness.publish("after-outage").await;
        harness.wait_for_handled(1).await;
        worker.stop(Duration::from_secs(1)).await;
    }

    /// Sleeps in the handler, flagging when it started.
    struct SlowHandler {
        started: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    /// Broker whose first `failing_acks` acks fail without touching the queue.
    struct FlakyAckBroker {
        inner: InMemoryBroker,
        failing_acks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageTransport for FlakyAckBroker {
        async fn declare_channel(&self, channel: &str) -> crate::error::Result<()> {
            self.inner.declare_channel(channel).await
        }

        async fn publish(&self, channel: &str, message: Message) -> crate::error::Result<()> {
            self.inner.publish(channel, message).await
        }

        async fn receive(
            &self,
            channel: &str,
            timeout: Duration,
        ) -> crate::error::Result<Option<Delivery>> {
            self.inner.receive(channel, timeout).await
        }

        async fn ack(&self, delivery: &Delivery) -> crate::error::Result<()> {
            let failing = self
                .failing_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(crate::error::Error::Closed);
            }
            self.inner.ack(delivery).await
        }

        async fn nack(&self, delivery: &Delivery, requeue: bool) -> crate::error::Result<()> {
            self.inner.nack(delivery, requeue).await
        }
    }

    #[tokio::test]
    async fn test_aborted_worker_requeues_in_flight_delivery() {
        let harness = Harness::new();
        let started = Arc::new(AtomicUsize::new(0));
        let worker = harness.spawn_with(
            Arc::new(SlowHandler {
                started: started.clone(),
                delay: Duration::from_secs(5),
            }),
            Arc::new(NoopDuplicateDetector),
        );

        harness.publish("slow").await;
        for _ in 0..200 {
            if started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);

        assert_eq!(
            worker.stop(Duration::from_millis(50)).await,
            WorkerExit::Aborted
        );
        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 0);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 1);

        let delivery = harness
            .broker
            .receive(CHANNEL, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.id, "slow");
        assert!(delivery.redelivered);
    }

    #[tokio::test]
    async fn test_failed_ack_is_retried_before_next_receive() {
        let harness = Harness::new();
        let transport = Arc::new(FlakyAckBroker {
            inner: harness.broker.clone(),
            failing_acks: AtomicUsize::new(1),
        });
        let handled = harness.handled.clone();
        let guard = DeliveryGuard::new(
            "sub:orders".to_string(),
            0,
            FencingToken(1),
            harness.owned.clone(),
            harness.suspension.clone(),
            MemberSession::new("sub:orders", "member-a", 1),
        );
        let worker = PartitionWorker::spawn(WorkerContext {
            group: "sub:orders".to_string(),
            subscriber_id: "sub".to_string(),
            channel: CHANNEL.to_string(),
            guard,
            transport: transport.clone(),
            dedup: Arc::new(NoopDuplicateDetector),
            handler: Arc::new(handler_fn(move |_| {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            poll_timeout: Duration::from_millis(20),
        });

        harness.publish("once").await;
        harness.wait_for_handled(1).await;
        for _ in 0..200 {
            if harness.broker.unacked_count(CHANNEL).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 0);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 0);
        assert_eq!(transport.failing_acks.load(Ordering::SeqCst), 0);
        assert_eq!(worker.stop(Duration::from_secs(1)).await, WorkerExit::Stopped);
        assert_eq!(harness.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_settles_pending_ack() {
        let harness = Harness::new();
        let transport = Arc::new(FlakyAckBroker {
            inner: harness.broker.clone(),
            failing_acks: AtomicUsize::new(usize::MAX),
        });
        let handled = harness.handled.clone();
        let guard = DeliveryGuard::new(
            "sub:orders".to_string(),
            0,
            FencingToken(1),
            harness.owned.clone(),
            harness.suspension.clone(),
            MemberSession::new("sub:orders", "member-a", 1),
        );
        let worker = PartitionWorker::spawn(WorkerContext {
            group: "sub:orders".to_string(),
            subscriber_id: "sub".to_string(),
            channel: CHANNEL.to_string(),
            guard,
            transport: transport.clone(),
            dedup: Arc::new(NoopDuplicateDetector),
            handler: Arc::new(handler_fn(move |_| {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            poll_timeout: Duration::from_millis(20),
        });

        harness.publish("stuck").await;
        harness.wait_for_handled(1).await;
        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 1);

        transport.failing_acks.store(0, Ordering::SeqCst);
        worker.stop(Duration::from_secs(1)).await;

        assert_eq!(harness.broker.unacked_count(CHANNEL).await, 0);
        assert_eq!(harness.broker.pending_count(CHANNEL).await, 0);
        assert_eq!(harness.handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..40 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(MAX_TRANSPORT_BACKOFF_MS));
        }
        assert!(backoff_delay(1) >= Duration::from_millis(INITIAL_BACKOFF_MS));
    }
}
