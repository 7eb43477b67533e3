//! Per-member rebalance state machine.
//!
//! Each member of a consumer group runs one coordinator task that owns all of
//! the member's mutable state (session, membership watch, workers) and moves
//! through:
//!
//! ```text
//! Joining ──► Rebalancing ──► Stable ──► Rebalancing ──► Stable ...
//!                                │
//!                                ├──► Suspended ──(rejoin)──► Rebalancing
//!                                │
//!                                └──► Leaving ──► Left
//! ```
//!
//! # Rebalance
//!
//! On every membership snapshot newer than the last one processed:
//!
//! 1. compute the assignment from the snapshot's sorted member list
//! 2. for every partition no longer assigned: fence it, stop its worker, then
//!    release the lease (stop-before-release)
//! 3. acquire every newly assigned partition and start a worker per grant
//!
//! Denied acquisitions are retried on the periodic tick; the previous owner
//! releases as soon as it processes the same snapshot.
//!
//! # Suspension
//!
//! After `max_consecutive_heartbeat_failures` failed heartbeats, or as soon as
//! the backend reports the session as expired, the member suspends: workers
//! are fenced and stopped and local leases are forgotten. On the next
//! heartbeat interval the member re-registers with a fresh session (which
//! frees whatever the old one still held) and rebalances from scratch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::assignment::assign_partitions;
use super::config::ConsumerConfig;
use super::lease_manager::{LeaseManager, LeaseStats};
use super::metrics;
use super::ownership_guard::DeliveryGuard;
use super::retry;
use super::suspension::{SuspendReason, SuspensionState};
use super::traits::{CoordinationClient, MemberSession, MembershipSnapshot, MembershipWatch};
use super::worker::{PartitionWorker, WorkerContext};
use crate::constants::DEFAULT_JITTER_FACTOR;
use crate::dedup::DuplicateMessageDetector;
use crate::error::{Error, Result};
use crate::handler::MessageHandler;
use crate::transport::MessageTransport;
use crate::types::{FencingToken, GroupId, MemberId, PartitionId, group_id, partition_channel};

/// Add +/- 15% jitter so members do not heartbeat in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 1.0 - DEFAULT_JITTER_FACTOR + fastrand::f64() * 2.0 * DEFAULT_JITTER_FACTOR;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// Lifecycle state of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Joining,
    Stable,
    Rebalancing,
    /// Lost the session or the backend; not delivering.
    Suspended,
    Leaving,
    Left,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Joining => "joining",
            MemberState::Stable => "stable",
            MemberState::Rebalancing => "rebalancing",
            MemberState::Suspended => "suspended",
            MemberState::Leaving => "leaving",
            MemberState::Left => "left",
        }
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published view of a member, updated by the coordinator task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub state: MemberState,
    /// Epoch of the last processed membership snapshot.
    pub epoch: Option<u64>,
    /// Live members in the last processed snapshot.
    pub group_size: usize,
    /// Partitions the current assignment gives to this member.
    pub assigned: Vec<PartitionId>,
}

#[derive(Debug, Default)]
struct RebalanceCounters {
    rebalances: AtomicU64,
    stale_snapshots: AtomicU64,
    suspensions: AtomicU64,
    rejoins: AtomicU64,
}

/// Point-in-time summary of a member, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSummary {
    pub member_id: MemberId,
    pub group: GroupId,
    pub destination: String,
    pub state: MemberState,
    pub epoch: Option<u64>,
    pub assigned: Vec<PartitionId>,
    pub owned: Vec<PartitionId>,
    pub rebalances: u64,
    pub stale_snapshots: u64,
    pub suspensions: u64,
    pub rejoins: u64,
    pub leases: LeaseStats,
}

/// Collaborators and identity of a member about to join.
#[derive(Clone)]
pub struct MemberParams {
    pub subscriber_id: String,
    pub destination: String,
    pub member_id: MemberId,
    pub config: ConsumerConfig,
    pub coordinator: Arc<dyn CoordinationClient>,
    pub transport: Arc<dyn MessageTransport>,
    pub dedup: Arc<dyn DuplicateMessageDetector>,
    pub handler: Arc<dyn MessageHandler>,
}

/// Handle to one member's coordinator task.
pub struct RebalanceCoordinator {
    member_id: MemberId,
    group: GroupId,
    destination: String,
    leases: Arc<LeaseManager>,
    suspension: Arc<SuspensionState>,
    status_rx: watch::Receiver<MemberStatus>,
    counters: Arc<RebalanceCounters>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RebalanceCoordinator {
    /// Join the group for `params.destination` and start the coordinator task.
    ///
    /// Declares the destination (first writer wins), verifies the partition
    /// count, registers the member and opens the membership watch. Fails with
    /// `PartitionCountMismatch` if the destination exists with another count.
    pub async fn join(params: MemberParams) -> Result<Self> {
        let group = group_id(&params.subscriber_id, &params.destination);
        let requested = params.config.partition_count;
        let coordinator = params.coordinator.clone();

        let declared = retry::with_coordination_policy("declare_destination", || {
            coordinator.declare_destination(&params.destination, requested)
        })
        .await?;
        if declared != requested {
            return Err(Error::PartitionCountMismatch {
                destination: params.destination.clone(),
                declared,
                requested,
            });
        }

        for partition in 0..declared {
            let channel = partition_channel(&params.destination, partition);
            retry::with_transport_policy("declare_channel", || {
                params.transport.declare_channel(&channel)
            })
            .await?;
        }

        let session = retry::with_coordination_policy("register", || {
            coordinator.register(&group, &params.member_id)
        })
        .await?;

        let membership = match retry::with_coordination_policy("watch_members", || {
            coordinator.watch_members(&group)
        })
        .await
        {
            Ok(membership) => membership,
            Err(e) => {
                let _ = coordinator.deregister(&session).await;
                return Err(e);
            }
        };

        let leases = Arc::new(LeaseManager::new(
            group.clone(),
            params.destination.clone(),
            declared,
            coordinator.clone(),
        ));
        let suspension = Arc::new(SuspensionState::new());
        let counters = Arc::new(RebalanceCounters::default());
        let (status_tx, status_rx) = watch::channel(MemberStatus {
            state: MemberState::Joining,
            epoch: None,
            group_size: 0,
            assigned: Vec::new(),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!(
            member_id = %params.member_id,
            group = %group,
            partition_count = declared,
            session_id = session.session_id,
            "Member joined group"
        );
        metrics::record_membership_event("joined");
        metrics::inc_active_members();

        let member_loop = MemberLoop {
            member_id: params.member_id.clone(),
            subscriber_id: params.subscriber_id,
            group: group.clone(),
            destination: params.destination.clone(),
            config: params.config,
            coordinator,
            transport: params.transport,
            dedup: params.dedup,
            handler: params.handler,
            leases: leases.clone(),
            suspension: suspension.clone(),
            status_tx,
            counters: counters.clone(),
            session,
            membership,
            last_epoch: None,
            assigned: BTreeSet::new(),
            workers: HashMap::new(),
            heartbeat_failures: 0,
        };
        let task = tokio::spawn(member_loop.run(shutdown_rx));

        Ok(Self {
            member_id: params.member_id,
            group,
            destination: params.destination,
            leases,
            suspension,
            status_rx,
            counters,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn state(&self) -> MemberState {
        self.status_rx.borrow().state
    }

    pub fn status(&self) -> MemberStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<MemberStatus> {
        self.status_rx.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_active()
    }

    /// Partitions whose lease this member holds, ascending.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.leases.owned_partitions()
    }

    /// Partitions the current assignment gives to this member, ascending.
    pub fn assigned_partitions(&self) -> Vec<PartitionId> {
        self.status_rx.borrow().assigned.clone()
    }

    pub fn state_summary(&self) -> MemberSummary {
        let status = self.status();
        MemberSummary {
            member_id: self.member_id.clone(),
            group: self.group.clone(),
            destination: self.destination.clone(),
            state: status.state,
            epoch: status.epoch,
            assigned: status.assigned,
            owned: self.leases.owned_partitions(),
            rebalances: self.counters.rebalances.load(Ordering::Relaxed),
            stale_snapshots: self.counters.stale_snapshots.load(Ordering::Relaxed),
            suspensions: self.counters.suspensions.load(Ordering::Relaxed),
            rejoins: self.counters.rejoins.load(Ordering::Relaxed),
            leases: self.leases.stats(),
        }
    }

    /// Leave the group: stop workers, release leases, deregister.
    ///
    /// Waits until the member is `Left`. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        let _ = self.shutdown_tx.send(());
        task.await.map_err(|e| {
            error!(member_id = %self.member_id, error = %e, "Member task failed");
            Error::Closed
        })
    }
}

impl Drop for RebalanceCoordinator {
    fn drop(&mut self) {
        // The task leaves the group on its own once signalled
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("member_id", &self.member_id)
            .field("group", &self.group)
            .field("state", &self.state())
            .field("owned", &self.owned_partitions())
            .finish()
    }
}

/// State owned by the coordinator task.
struct MemberLoop {
    member_id: MemberId,
    subscriber_id: String,
    group: GroupId,
    destination: String,
    config: ConsumerConfig,
    coordinator: Arc<dyn CoordinationClient>,
    transport: Arc<dyn MessageTransport>,
    dedup: Arc<dyn DuplicateMessageDetector>,
    handler: Arc<dyn MessageHandler>,
    leases: Arc<LeaseManager>,
    suspension: Arc<SuspensionState>,
    status_tx: watch::Sender<MemberStatus>,
    counters: Arc<RebalanceCounters>,
    session: MemberSession,
    membership: MembershipWatch,
    last_epoch: Option<u64>,
    assigned: BTreeSet<PartitionId>,
    workers: HashMap<PartitionId, PartitionWorker>,
    heartbeat_failures: u32,
}

impl MemberLoop {
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let initial = self.membership.current();
        self.on_snapshot(initial).await;

        let mut next_heartbeat =
            tokio::time::Instant::now() + with_jitter(self.config.heartbeat_interval);
        let mut next_tick =
            tokio::time::Instant::now() + with_jitter(self.config.rebalance_tick_interval);

        loop {
            let suspended = self.suspension.is_active();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!(member_id = %self.member_id, "Member loop received shutdown signal");
                    break;
                }
                changed = self.membership.changed(), if !suspended => match changed {
                    Ok(snapshot) => self.on_snapshot(snapshot).await,
                    Err(e) => self.suspend(SuspendReason::CoordinationUnavailable, &e).await,
                },
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    if suspended {
                        self.try_rejoin().await;
                    } else {
                        self.heartbeat().await;
                    }
                    next_heartbeat =
                        tokio::time::Instant::now() + with_jitter(self.config.heartbeat_interval);
                }
                _ = tokio::time::sleep_until(next_tick), if !suspended => {
                    if let Err(e) = self.acquire_assigned().await {
                        self.handle_error(e).await;
                    }
                    next_tick = tokio::time::Instant::now()
                        + with_jitter(self.config.rebalance_tick_interval);
                }
            }
        }

        self.leave().await;
    }

    fn set_state(&self, state: MemberState) {
        self.status_tx.send_if_modified(|status| {
            if status.state == state {
                false
            } else {
                status.state = state;
                true
            }
        });
    }

    // ========================================================================
    // Rebalance
    // ========================================================================

    async fn on_snapshot(&mut self, snapshot: MembershipSnapshot) {
        if let Some(last) = self.last_epoch
            && snapshot.epoch <= last
        {
            self.counters.stale_snapshots.fetch_add(1, Ordering::Relaxed);
            metrics::record_stale_snapshot();
            debug!(
                member_id = %self.member_id,
                epoch = snapshot.epoch,
                last_epoch = last,
                "Discarding stale membership snapshot"
            );
            return;
        }
        self.last_epoch = Some(snapshot.epoch);
        self.rebalance(snapshot).await;
    }

    async fn rebalance(&mut self, snapshot: MembershipSnapshot) {
        let started = Instant::now();
        self.set_state(MemberState::Rebalancing);

        let assignment = assign_partitions(&snapshot.members, self.leases.partition_count());
        self.assigned = assignment
            .partitions_for(&self.member_id)
            .into_iter()
            .collect();
        let assigned: Vec<PartitionId> = self.assigned.iter().copied().collect();
        self.status_tx.send_modify(|status| {
            status.epoch = Some(snapshot.epoch);
            status.group_size = snapshot.members.len();
            status.assigned = assigned.clone();
        });

        info!(
            member_id = %self.member_id,
            group = %self.group,
            epoch = snapshot.epoch,
            members = snapshot.members.len(),
            assigned = ?assigned,
            "Rebalancing"
        );

        let result = match self.release_unassigned().await {
            Ok(()) => self.acquire_assigned().await,
            Err(e) => Err(e),
        };

        self.counters.rebalances.fetch_add(1, Ordering::Relaxed);
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_rebalance(&self.group, status, started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.set_state(MemberState::Stable);
                info!(
                    member_id = %self.member_id,
                    group = %self.group,
                    epoch = snapshot.epoch,
                    owned = ?self.leases.owned_partitions(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Rebalance complete"
                );
            }
            Err(e) => self.handle_error(e).await,
        }
    }

    /// Stop and release every partition the assignment no longer gives us.
    async fn release_unassigned(&mut self) -> Result<()> {
        let mut lost: BTreeSet<PartitionId> = self
            .leases
            .owned_partitions()
            .into_iter()
            .filter(|p| !self.assigned.contains(p))
            .collect();
        lost.extend(
            self.workers
                .keys()
                .filter(|p| !self.assigned.contains(*p))
                .copied(),
        );

        // Fence and signal everything first so workers drain in parallel
        let mut releasing = Vec::with_capacity(lost.len());
        for partition in lost {
            let token = self.leases.begin_release(partition).await?;
            if let Some(worker) = self.workers.get(&partition) {
                worker.signal_stop();
            }
            releasing.push((partition, token));
        }

        for (partition, token) in releasing {
            if let Some(worker) = self.workers.remove(&partition) {
                let exit = worker.stop(self.config.worker_drain_timeout).await;
                debug!(member_id = %self.member_id, partition, exit = ?exit, "Worker stopped for release");
            }
            if token.is_some() {
                self.leases.complete_release(&self.session, partition).await?;
            }
        }
        Ok(())
    }

    /// Acquire every assigned partition that is not yet owned and make sure
    /// each owned one has a running worker.
    async fn acquire_assigned(&mut self) -> Result<()> {
        if !self.session.is_alive() {
            return Err(Error::SessionExpired {
                member_id: self.member_id.clone(),
            });
        }
        let assigned: Vec<PartitionId> = self.assigned.iter().copied().collect();
        for partition in assigned {
            if let Some(worker) = self.workers.get(&partition) {
                if !worker.is_finished() {
                    continue;
                }
                if let Some(worker) = self.workers.remove(&partition) {
                    let exit = worker.stop(self.config.worker_drain_timeout).await;
                    debug!(member_id = %self.member_id, partition, exit = ?exit, "Reaped finished worker");
                }
            }

            match self.leases.acquire(&self.session, partition).await?.token() {
                Some(token) => self.start_worker(partition, token),
                None => {
                    debug!(
                        member_id = %self.member_id,
                        partition,
                        "Partition still held by previous owner, retrying on next tick"
                    );
                }
            }
        }
        Ok(())
    }

    fn start_worker(&mut self, partition: PartitionId, token: FencingToken) {
        let guard = DeliveryGuard::new(
            self.group.clone(),
            partition,
            token,
            self.leases.owned_view(),
            self.suspension.clone(),
            self.session.clone(),
        );
        let worker = PartitionWorker::spawn(WorkerContext {
            group: self.group.clone(),
            subscriber_id: self.subscriber_id.clone(),
            channel: partition_channel(&self.destination, partition),
            guard,
            transport: self.transport.clone(),
            dedup: self.dedup.clone(),
            handler: self.handler.clone(),
            poll_timeout: self.config.poll_timeout,
        });
        self.workers.insert(partition, worker);
    }

    async fn stop_all_workers(&mut self) {
        for worker in self.workers.values() {
            worker.signal_stop();
        }
        let drain_timeout = self.config.worker_drain_timeout;
        for (partition, worker) in self.workers.drain() {
            let exit = worker.stop(drain_timeout).await;
            debug!(member_id = %self.member_id, partition, exit = ?exit, "Worker stopped");
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    async fn heartbeat(&mut self) {
        match self.coordinator.heartbeat(&self.session).await {
            Ok(()) => {
                if self.heartbeat_failures > 0 {
                    info!(
                        member_id = %self.member_id,
                        previous_failures = self.heartbeat_failures,
                        "Heartbeat recovered after failures"
                    );
                }
                self.heartbeat_failures = 0;
            }
            Err(e @ Error::SessionExpired { .. }) => {
                self.suspend(SuspendReason::SessionExpired, &e).await;
            }
            Err(e) => {
                self.heartbeat_failures += 1;
                if self.heartbeat_failures >= self.config.max_consecutive_heartbeat_failures {
                    self.suspend(SuspendReason::HeartbeatFailures, &e).await;
                } else {
                    warn!(
                        member_id = %self.member_id,
                        consecutive_failures = self.heartbeat_failures,
                        max_failures = self.config.max_consecutive_heartbeat_failures,
                        error = %e,
                        "Failed to send heartbeat"
                    );
                }
            }
        }
    }

    async fn handle_error(&mut self, e: Error) {
        if e.requires_suspension() {
            let reason = match &e {
                Error::SessionExpired { .. } => SuspendReason::SessionExpired,
                _ => SuspendReason::CoordinationUnavailable,
            };
            self.suspend(reason, &e).await;
        } else {
            warn!(member_id = %self.member_id, group = %self.group, error = %e, "Rebalance step failed");
            self.set_state(MemberState::Stable);
        }
    }

    async fn suspend(&mut self, reason: SuspendReason, cause: &Error) {
        if !self.suspension.enter() {
            return;
        }
        error!(
            member_id = %self.member_id,
            group = %self.group,
            reason = reason.as_str(),
            error = %cause,
            "Suspending member, stopping all partition workers"
        );
        self.counters.suspensions.fetch_add(1, Ordering::Relaxed);
        metrics::record_membership_event("session_lost");
        self.set_state(MemberState::Suspended);

        self.stop_all_workers().await;
        self.leases.forget_all().await;
        self.assigned.clear();
        self.status_tx.send_modify(|status| status.assigned.clear());
    }

    /// Re-register with a fresh session and rebalance from scratch.
    async fn try_rejoin(&mut self) {
        let episode = self.suspension.episode();

        let session = match self.coordinator.register(&self.group, &self.member_id).await {
            Ok(session) => session,
            Err(e) => {
                debug!(member_id = %self.member_id, error = %e, "Rejoin failed, still suspended");
                return;
            }
        };
        let membership = match self.coordinator.watch_members(&self.group).await {
            Ok(membership) => membership,
            Err(e) => {
                debug!(member_id = %self.member_id, error = %e, "Rejoin watch failed, still suspended");
                let _ = self.coordinator.deregister(&session).await;
                return;
            }
        };

        self.session = session;
        self.membership = membership;
        self.heartbeat_failures = 0;
        self.last_epoch = None;

        if self.suspension.try_exit(episode, "rejoined") {
            self.counters.rejoins.fetch_add(1, Ordering::Relaxed);
            metrics::record_membership_event("rejoined");
            info!(
                member_id = %self.member_id,
                group = %self.group,
                session_id = self.session.session_id,
                "Rejoined group with a fresh session"
            );
            let snapshot = self.membership.current();
            self.on_snapshot(snapshot).await;
        }
    }

    // ========================================================================
    // Leaving
    // ========================================================================

    async fn leave(mut self) {
        self.set_state(MemberState::Leaving);
        info!(member_id = %self.member_id, group = %self.group, "Leaving group");

        self.assigned.clear();
        if let Err(e) = self.release_unassigned().await {
            warn!(member_id = %self.member_id, error = %e, "Failed to release leases while leaving");
        }
        self.stop_all_workers().await;

        if let Err(e) = retry::with_coordination_policy("deregister", || {
            self.coordinator.deregister(&self.session)
        })
        .await
        {
            warn!(member_id = %self.member_id, error = %e, "Failed to deregister member");
        }
        self.suspension.force_exit("shutdown");
        self.leases.forget_all().await;

        self.set_state(MemberState::Left);
        metrics::record_membership_event("left");
        metrics::dec_active_members();
        info!(member_id = %self.member_id, group = %self.group, "Member left group");
    }
}
