//! Coordination backend abstraction.
//!
//! Group membership, partition leases and session liveness all go through
//! [`CoordinationClient`], so the membership protocol is independent of the
//! backend that stores it (ZooKeeper-style ephemeral nodes, a Raft log, or the
//! in-memory implementation used in tests).
//!
//! # Available Implementations
//!
//! - [`InMemoryCoordinator`](super::InMemoryCoordinator): shared in-process
//!   backend with fault injection (`test-utilities` feature)
//!
//! # Failure Semantics
//!
//! Every call fails with [`Error::CoordinationUnavailable`](crate::Error) while
//! the backend is unreachable. Callers treat that as "assignment unknown" and
//! stop delivering from held partitions until connectivity returns.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{FencingToken, GroupId, MemberId, PartitionId};

/// An ephemeral registration of one member in one group.
///
/// Leases are bound to the session, not to the member id: when the backend
/// expires the session, every lease it held is freed.
#[derive(Clone)]
pub struct MemberSession {
    pub group: GroupId,
    pub member_id: MemberId,
    pub session_id: u64,
    alive: Arc<AtomicBool>,
}

impl MemberSession {
    pub fn new(group: impl Into<GroupId>, member_id: impl Into<MemberId>, session_id: u64) -> Self {
        Self {
            group: group.into(),
            member_id: member_id.into(),
            session_id,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// False once the backend expired or closed this session.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the session dead. Called by backends on expiry or deregistration.
    pub fn invalidate(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemberSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberSession")
            .field("group", &self.group)
            .field("member_id", &self.member_id)
            .field("session_id", &self.session_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for MemberSession {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.member_id == other.member_id
            && self.session_id == other.session_id
    }
}

impl Eq for MemberSession {}

/// Group membership at one point in time.
///
/// `epoch` increases on every membership change; `members` is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub epoch: u64,
    pub members: Vec<MemberId>,
}

impl MembershipSnapshot {
    pub fn contains(&self, member_id: &str) -> bool {
        self.members.binary_search_by(|m| m.as_str().cmp(member_id)).is_ok()
    }
}

/// Subscription to a group's membership.
///
/// Backed by a `tokio::sync::watch` channel: only the latest snapshot is kept,
/// so bursts of joins and leaves coalesce into a single notification.
#[derive(Debug)]
pub struct MembershipWatch {
    rx: watch::Receiver<MembershipSnapshot>,
}

impl MembershipWatch {
    pub fn new(rx: watch::Receiver<MembershipSnapshot>) -> Self {
        Self { rx }
    }

    /// Latest snapshot, marking it as seen.
    pub fn current(&mut self) -> MembershipSnapshot {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for a snapshot newer than the last one seen. Cancel-safe.
    pub async fn changed(&mut self) -> Result<MembershipSnapshot> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::CoordinationUnavailable("membership watch closed".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Group membership and partition lease primitives.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    // ========================================================================
    // Destination Topology
    // ========================================================================

    /// Declare `destination` with `partition_count` partitions.
    ///
    /// The first declaration wins; returns the stored count, which may differ
    /// from the requested one.
    async fn declare_destination(&self, destination: &str, partition_count: u32) -> Result<u32>;

    /// Stored partition count of `destination`, if declared.
    async fn partition_count(&self, destination: &str) -> Result<Option<u32>>;

    // ========================================================================
    // Membership
    // ========================================================================

    /// Register `member_id` in `group` with a fresh ephemeral session.
    ///
    /// Registering a member id that already has a session replaces it; the old
    /// session's leases are freed.
    async fn register(&self, group: &str, member_id: &str) -> Result<MemberSession>;

    /// Keep the session alive.
    ///
    /// Fails with `SessionExpired` if the backend already dropped it.
    async fn heartbeat(&self, session: &MemberSession) -> Result<()>;

    /// Close the session explicitly, releasing all of its leases.
    async fn deregister(&self, session: &MemberSession) -> Result<()>;

    /// Watch the membership of `group`.
    async fn watch_members(&self, group: &str) -> Result<MembershipWatch>;

    // ========================================================================
    // Partition Leases
    // ========================================================================

    /// Try to take the lease on `partition` for `session`.
    ///
    /// Returns `Ok(None)` if another live session holds it.
    async fn try_acquire_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
    ) -> Result<Option<FencingToken>>;

    /// Release a lease held by `session`. A stale `token` makes this a no-op.
    async fn release_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
        token: FencingToken,
    ) -> Result<()>;
}
