//! Per-member partition lease bookkeeping.
//!
//! The lease manager owns one [`LeaseState`] cell per partition of the
//! destination. Each cell is guarded by its own async mutex, so slow
//! coordination calls on one partition never block another.
//!
//! Alongside the cells it keeps a lock-free mirror of the owned leases
//! (`partition -> token`), read by delivery guards on every message.
//! A lease leaves the mirror as soon as it enters `Releasing`, which makes the
//! worker stop delivering before the lease is handed back.
//!
//! # Ordering
//!
//! The rebalance coordinator drives releases in three steps:
//!
//! 1. [`LeaseManager::begin_release`] - Owned -> Releasing, guard starts failing
//! 2. stop the partition worker and wait for it
//! 3. [`LeaseManager::complete_release`] - release in the backend, -> Unowned

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::lease_state::LeaseState;
use super::metrics;
use super::retry;
use super::traits::{CoordinationClient, MemberSession};
use crate::error::{Error, Result};
use crate::types::{FencingToken, GroupId, PartitionId};

/// Outcome of [`LeaseManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The backend granted a new lease.
    Granted(FencingToken),
    /// The lease was already held locally.
    AlreadyOwned(FencingToken),
    /// Another live member holds the lease.
    Denied,
}

impl AcquireOutcome {
    pub fn token(&self) -> Option<FencingToken> {
        match self {
            AcquireOutcome::Granted(t) | AcquireOutcome::AlreadyOwned(t) => Some(*t),
            AcquireOutcome::Denied => None,
        }
    }
}

/// Counters for observability.
#[derive(Debug, Default)]
struct LeaseCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    denied: AtomicU64,
    forgotten: AtomicU64,
}

/// Snapshot of lease counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    pub acquired: u64,
    pub released: u64,
    pub denied: u64,
    pub forgotten: u64,
}

pub struct LeaseManager {
    group: GroupId,
    destination: String,
    coordinator: Arc<dyn CoordinationClient>,
    cells: Vec<Mutex<LeaseState>>,
    owned: Arc<DashMap<PartitionId, FencingToken>>,
    counters: LeaseCounters,
}

impl LeaseManager {
    pub fn new(
        group: GroupId,
        destination: String,
        partition_count: u32,
        coordinator: Arc<dyn CoordinationClient>,
    ) -> Self {
        Self {
            group,
            destination,
            coordinator,
            cells: (0..partition_count)
                .map(|_| Mutex::new(LeaseState::Unowned))
                .collect(),
            owned: Arc::new(DashMap::new()),
            counters: LeaseCounters::default(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partition_count(&self) -> u32 {
        self.cells.len() as u32
    }

    /// Shared view of owned leases for delivery guards.
    pub fn owned_view(&self) -> Arc<DashMap<PartitionId, FencingToken>> {
        self.owned.clone()
    }

    fn cell(&self, partition: PartitionId) -> Result<&Mutex<LeaseState>> {
        self.cells
            .get(partition as usize)
            .ok_or_else(|| Error::InvalidPartition {
                destination: self.destination.clone(),
                partition,
                partition_count: self.partition_count(),
            })
    }

    /// Acquire the lease on `partition` for `session`.
    ///
    /// Unowned -> Acquiring -> Owned on a grant, back to Unowned on denial or
    /// error. Errors are returned after the lease retry policy is exhausted.
    pub async fn acquire(
        &self,
        session: &MemberSession,
        partition: PartitionId,
    ) -> Result<AcquireOutcome> {
        let mut state = self.cell(partition)?.lock().await;

        match &*state {
            LeaseState::Owned { token, .. } => return Ok(AcquireOutcome::AlreadyOwned(*token)),
            LeaseState::Releasing { .. } => {
                debug!(group = %self.group, partition, "Acquire skipped, release in progress");
                return Ok(AcquireOutcome::Denied);
            }
            LeaseState::Unowned | LeaseState::Acquiring { .. } => {}
        }

        *state = LeaseState::start_acquiring();
        let result = retry::with_lease_policy("acquire", || {
            self.coordinator.try_acquire_lease(session, partition)
        })
        .await;

        match result {
            Ok(Some(token)) => {
                *state = LeaseState::owned(token);
                self.owned.insert(partition, token);
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                metrics::record_lease_operation("acquire", "granted");
                metrics::inc_owned_partitions(&self.group);
                info!(
                    group = %self.group,
                    member_id = %session.member_id,
                    partition,
                    token = token.value(),
                    "Acquired partition lease"
                );
                Ok(AcquireOutcome::Granted(token))
            }
            Ok(None) => {
                *state = LeaseState::Unowned;
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
                metrics::record_lease_operation("acquire", "denied");
                debug!(
                    group = %self.group,
                    member_id = %session.member_id,
                    partition,
                    "Lease held by another member"
                );
                Ok(AcquireOutcome::Denied)
            }
            Err(e) => {
                *state = LeaseState::Unowned;
                metrics::record_lease_operation("acquire", "error");
                warn!(
                    group = %self.group,
                    partition,
                    error = %e,
                    "Failed to acquire partition lease"
                );
                Err(e)
            }
        }
    }

    /// Owned -> Releasing. Returns the token being released, or `None` if the
    /// partition was not owned.
    ///
    /// The lease leaves the owned view immediately, so delivery guards for
    /// this partition fail from here on.
    pub async fn begin_release(&self, partition: PartitionId) -> Result<Option<FencingToken>> {
        let mut state = self.cell(partition)?.lock().await;
        let LeaseState::Owned { token, .. } = &*state else {
            return Ok(None);
        };
        let token = *token;
        self.owned.remove(&partition);
        *state = LeaseState::start_releasing(token);
        debug!(group = %self.group, partition, token = token.value(), "Releasing partition lease");
        Ok(Some(token))
    }

    /// Releasing -> Unowned, releasing the lease in the backend.
    ///
    /// Must only be called after the partition's worker has stopped. The local
    /// state becomes Unowned even when the backend call fails: the caller
    /// treats the error as a lost backend and suspends, and the stale lease is
    /// freed with the session.
    pub async fn complete_release(
        &self,
        session: &MemberSession,
        partition: PartitionId,
    ) -> Result<()> {
        let mut state = self.cell(partition)?.lock().await;
        let LeaseState::Releasing { token, .. } = &*state else {
            return Ok(());
        };
        let token = *token;

        let result = retry::with_lease_policy("release", || {
            self.coordinator.release_lease(session, partition, token)
        })
        .await;

        *state = LeaseState::Unowned;
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        metrics::dec_owned_partitions(&self.group);

        match result {
            Ok(()) => {
                metrics::record_lease_operation("release", "success");
                info!(
                    group = %self.group,
                    member_id = %session.member_id,
                    partition,
                    token = token.value(),
                    "Released partition lease"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_lease_operation("release", "error");
                warn!(group = %self.group, partition, error = %e, "Failed to release partition lease");
                Err(e)
            }
        }
    }

    /// Drop every local lease without calling the backend.
    ///
    /// Used after session loss: the backend already freed the leases.
    /// Returns the partitions that were owned or releasing.
    pub async fn forget_all(&self) -> Vec<PartitionId> {
        self.owned.clear();
        let mut forgotten = Vec::new();
        for (partition, cell) in self.cells.iter().enumerate() {
            let mut state = cell.lock().await;
            if state.token().is_some() {
                forgotten.push(partition as PartitionId);
                metrics::dec_owned_partitions(&self.group);
                metrics::record_lease_operation("forget", "success");
            }
            *state = LeaseState::Unowned;
        }
        self.counters
            .forgotten
            .fetch_add(forgotten.len() as u64, Ordering::Relaxed);
        if !forgotten.is_empty() {
            info!(group = %self.group, partitions = ?forgotten, "Forgot local leases after session loss");
        }
        forgotten
    }

    /// True if `partition` is owned with exactly `token`. Lock-free.
    #[inline]
    pub fn is_owned(&self, partition: PartitionId, token: FencingToken) -> bool {
        self.owned.get(&partition).is_some_and(|t| *t == token)
    }

    /// Token of an owned partition. Lock-free.
    pub fn owned_token(&self, partition: PartitionId) -> Option<FencingToken> {
        self.owned.get(&partition).map(|t| *t)
    }

    /// Owned partitions, ascending. Lock-free.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.owned.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    pub async fn state_of(&self, partition: PartitionId) -> Result<LeaseState> {
        Ok(self.cell(partition)?.lock().await.clone())
    }

    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            forgotten: self.counters.forgotten.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("group", &self.group)
            .field("partition_count", &self.partition_count())
            .field("owned", &self.owned_partitions())
            .finish()
    }
}
