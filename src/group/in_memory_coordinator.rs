//! In-memory coordination backend for tests and demos.
//!
//! All clones share one state, so several `MessageConsumer`s in one process
//! behave like independent processes talking to the same backend.
//!
//! Besides the [`CoordinationClient`] surface it offers fault injection
//! (`set_available`, `expire_session`) and a lease audit log that tests use to
//! prove that no two sessions ever held the same partition at once.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! partition-groups = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use super::session_monitor::{SessionHealth, SessionMonitor, SessionMonitorConfig};
use super::traits::{CoordinationClient, MemberSession, MembershipSnapshot, MembershipWatch};
use crate::error::{Error, Result};
use crate::types::{FencingToken, GroupId, MemberId, PartitionId};

/// Lease key: (group, partition).
pub type LeaseKey = (GroupId, PartitionId);

/// What happened to a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Granted,
    Released,
    /// Freed because the holding session expired or deregistered.
    SessionEnded,
}

/// One entry of the lease audit log.
#[derive(Debug, Clone)]
pub struct LeaseAuditEntry {
    pub group: GroupId,
    pub partition: PartitionId,
    pub member_id: MemberId,
    pub session_id: u64,
    pub token: FencingToken,
    pub event: LeaseEvent,
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    session_id: u64,
    member_id: MemberId,
    token: FencingToken,
}

#[derive(Debug)]
struct GroupRecord {
    /// member id -> session id
    members: BTreeMap<MemberId, u64>,
    epoch: u64,
    tx: watch::Sender<MembershipSnapshot>,
}

impl GroupRecord {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(MembershipSnapshot::default());
        Self {
            members: BTreeMap::new(),
            epoch: 0,
            tx,
        }
    }

    fn publish(&mut self) {
        self.epoch += 1;
        self.tx.send_replace(MembershipSnapshot {
            epoch: self.epoch,
            members: self.members.keys().cloned().collect(),
        });
    }
}

#[derive(Debug, Default)]
struct BackendState {
    destinations: HashMap<String, u32>,
    groups: HashMap<GroupId, GroupRecord>,
    sessions: HashMap<u64, MemberSession>,
    leases: HashMap<LeaseKey, LeaseRecord>,
    last_tokens: HashMap<LeaseKey, FencingToken>,
    audit: Vec<LeaseAuditEntry>,
}

impl BackendState {
    fn group_mut(&mut self, group: &str) -> &mut GroupRecord {
        self.groups
            .entry(group.to_string())
            .or_insert_with(GroupRecord::new)
    }

    /// Drop a session, free its leases and publish the new membership.
    fn end_session(&mut self, session_id: u64) -> Option<MemberSession> {
        let session = self.sessions.remove(&session_id)?;
        session.invalidate();

        let freed: Vec<LeaseKey> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.session_id == session_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in freed {
            if let Some(lease) = self.leases.remove(&key) {
                self.audit.push(LeaseAuditEntry {
                    group: key.0,
                    partition: key.1,
                    member_id: lease.member_id,
                    session_id,
                    token: lease.token,
                    event: LeaseEvent::SessionEnded,
                    at: Instant::now(),
                });
            }
        }

        let group = self.group_mut(&session.group);
        if group.members.get(&session.member_id) == Some(&session_id) {
            group.members.remove(&session.member_id);
            group.publish();
        }
        Some(session)
    }
}

/// Shared in-memory [`CoordinationClient`].
#[derive(Clone)]
pub struct InMemoryCoordinator {
    state: Arc<RwLock<BackendState>>,
    monitor: Arc<SessionMonitor>,
    available: Arc<AtomicBool>,
    next_session_id: Arc<AtomicU64>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::with_session_config(SessionMonitorConfig::default())
    }

    pub fn with_session_config(config: SessionMonitorConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BackendState::default())),
            monitor: Arc::new(SessionMonitor::new(config)),
            available: Arc::new(AtomicBool::new(true)),
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ========================================================================
    // Fault Injection
    // ========================================================================

    /// Simulate losing (`false`) or regaining (`true`) the backend.
    pub fn set_available(&self, available: bool) {
        info!(available, "In-memory coordinator availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Expire every session of `member_id`, as if it stopped heartbeating.
    ///
    /// Returns the number of sessions expired.
    pub async fn expire_session(&self, member_id: &str) -> usize {
        let mut state = self.state.write().await;
        let ids: Vec<u64> = state
            .sessions
            .values()
            .filter(|s| s.member_id == member_id)
            .map(|s| s.session_id)
            .collect();
        for id in &ids {
            self.monitor.expire(*id);
            self.monitor.unregister(*id);
            state.end_session(*id);
        }
        if !ids.is_empty() {
            info!(member_id, sessions = ids.len(), "Expired member sessions");
        }
        ids.len()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Current members of `group`, sorted.
    pub async fn members(&self, group: &str) -> Vec<MemberId> {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Holder and token of the lease on `partition`, if any.
    pub async fn lease_holder(
        &self,
        group: &str,
        partition: PartitionId,
    ) -> Option<(MemberId, FencingToken)> {
        self.state
            .read()
            .await
            .leases
            .get(&(group.to_string(), partition))
            .map(|l| (l.member_id.clone(), l.token))
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn audit_log(&self) -> Vec<LeaseAuditEntry> {
        self.state.read().await.audit.clone()
    }

    /// Replay the audit log and report every grant that happened while another
    /// session still held the same partition.
    pub async fn verify_exclusive(&self) -> std::result::Result<(), Vec<String>> {
        let state = self.state.read().await;
        let mut holders: HashMap<LeaseKey, (u64, FencingToken)> = HashMap::new();
        let mut last_token: HashMap<LeaseKey, FencingToken> = HashMap::new();
        let mut violations = Vec::new();

        for entry in &state.audit {
            let key = (entry.group.clone(), entry.partition);
            match entry.event {
                LeaseEvent::Granted => {
                    if let Some((holder, token)) = holders.get(&key)
                        && *holder != entry.session_id
                    {
                        violations.push(format!(
                            "{}/{} granted to session {} (token {}) while session {} held token {}",
                            entry.group, entry.partition, entry.session_id, entry.token, holder, token
                        ));
                    }
                    if let Some(prev) = last_token.get(&key)
                        && entry.token <= *prev
                    {
                        violations.push(format!(
                            "{}/{} token {} not greater than previous {}",
                            entry.group, entry.partition, entry.token, prev
                        ));
                    }
                    last_token.insert(key.clone(), entry.token);
                    holders.insert(key, (entry.session_id, entry.token));
                }
                LeaseEvent::Released | LeaseEvent::SessionEnded => {
                    if holders.get(&key).map(|(s, t)| (*s, *t))
                        == Some((entry.session_id, entry.token))
                    {
                        holders.remove(&key);
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable(
                "in-memory coordinator is unavailable".to_string(),
            ))
        }
    }

    /// End every session the monitor considers expired.
    fn reap_expired(&self, state: &mut BackendState) {
        for change in self.monitor.check_sessions() {
            if change.current == SessionHealth::Expired {
                self.monitor.unregister(change.session_id);
                if let Some(session) = state.end_session(change.session_id) {
                    info!(
                        member_id = %session.member_id,
                        group = %session.group,
                        session_id = session.session_id,
                        "Reaped expired session"
                    );
                }
            }
        }
    }

    fn live_session(state: &BackendState, session: &MemberSession) -> Result<()> {
        if state.sessions.contains_key(&session.session_id) {
            Ok(())
        } else {
            Err(Error::SessionExpired {
                member_id: session.member_id.clone(),
            })
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinator {
    async fn declare_destination(&self, destination: &str, partition_count: u32) -> Result<u32> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let stored = *state
            .destinations
            .entry(destination.to_string())
            .or_insert(partition_count);
        Ok(stored)
    }

    async fn partition_count(&self, destination: &str) -> Result<Option<u32>> {
        self.ensure_available()?;
        Ok(self.state.read().await.destinations.get(destination).copied())
    }

    async fn register(&self, group: &str, member_id: &str) -> Result<MemberSession> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        self.reap_expired(&mut state);

        let previous = state
            .groups
            .get(group)
            .and_then(|g| g.members.get(member_id).copied());
        if let Some(old) = previous {
            debug!(member_id, group, old_session = old, "Replacing existing session");
            self.monitor.unregister(old);
            state.end_session(old);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = MemberSession::new(group, member_id, session_id);
        state.sessions.insert(session_id, session.clone());
        self.monitor.register(session_id);

        let record = state.group_mut(group);
        record.members.insert(member_id.to_string(), session_id);
        record.publish();

        debug!(member_id, group, session_id, "Registered member");
        Ok(session)
    }

    async fn heartbeat(&self, session: &MemberSession) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        self.reap_expired(&mut state);
        Self::live_session(&state, session)?;

        if self.monitor.record_heartbeat(session.session_id) {
            Ok(())
        } else {
            Err(Error::SessionExpired {
                member_id: session.member_id.clone(),
            })
        }
    }

    async fn deregister(&self, session: &MemberSession) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        self.monitor.unregister(session.session_id);
        if state.end_session(session.session_id).is_some() {
            debug!(member_id = %session.member_id, group = %session.group, "Deregistered member");
        }
        Ok(())
    }

    async fn watch_members(&self, group: &str) -> Result<MembershipWatch> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        Ok(MembershipWatch::new(state.group_mut(group).tx.subscribe()))
    }

    async fn try_acquire_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
    ) -> Result<Option<FencingToken>> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        self.reap_expired(&mut state);
        Self::live_session(&state, session)?;

        let key = (session.group.clone(), partition);
        if let Some(lease) = state.leases.get(&key)
            && lease.session_id != session.session_id
        {
            return Ok(None);
        }

        let token = state
            .last_tokens
            .get(&key)
            .copied()
            .unwrap_or_default()
            .next();
        state.last_tokens.insert(key.clone(), token);
        state.leases.insert(
            key,
            LeaseRecord {
                session_id: session.session_id,
                member_id: session.member_id.clone(),
                token,
            },
        );
        state.audit.push(LeaseAuditEntry {
            group: session.group.clone(),
            partition,
            member_id: session.member_id.clone(),
            session_id: session.session_id,
            token,
            event: LeaseEvent::Granted,
            at: Instant::now(),
        });
        Ok(Some(token))
    }

    async fn release_lease(
        &self,
        session: &MemberSession,
        partition: PartitionId,
        token: FencingToken,
    ) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let key = (session.group.clone(), partition);

        let held = state
            .leases
            .get(&key)
            .is_some_and(|l| l.session_id == session.session_id && l.token == token);
        if held {
            state.leases.remove(&key);
            state.audit.push(LeaseAuditEntry {
                group: session.group.clone(),
                partition,
                member_id: session.member_id.clone(),
                session_id: session.session_id,
                token,
                event: LeaseEvent::Released,
                at: Instant::now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const GROUP: &str = "sub:orders";

    // ========================================================================
    // Destination Tests
    // ========================================================================

    #[tokio::test]
    async fn test_declare_destination_first_writer_wins() {
        let coord = InMemoryCoordinator::new();
        assert_eq!(coord.declare_destination("orders", 4).await.unwrap(), 4);
        assert_eq!(coord.declare_destination("orders", 8).await.unwrap(), 4);
        assert_eq!(coord.partition_count("orders").await.unwrap(), Some(4));
        assert_eq!(coord.partition_count("payments").await.unwrap(), None);
    }

    // ========================================================================
    // Membership Tests
    // ========================================================================

    #[tokio::test]
    async fn test_register_publishes_sorted_snapshot() {
        let coord = InMemoryCoordinator::new();
        let mut watch = coord.watch_members(GROUP).await.unwrap();

        coord.register(GROUP, "member-b").await.unwrap();
        coord.register(GROUP, "member-a").await.unwrap();

        let snapshot = watch.current();
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(snapshot.members, vec!["member-a", "member-b"]);
    }

    #[tokio::test]
    async fn test_deregister_releases_leases_and_removes_member() {
        let coord = InMemoryCoordinator::new();
        let session = coord.register(GROUP, "member-a").await.unwrap();
        coord.try_acquire_lease(&session, 0).await.unwrap().unwrap();

        coord.deregister(&session).await.unwrap();

        assert!(!session.is_alive());
        assert!(coord.members(GROUP).await.is_empty());
        assert_eq!(coord.lease_holder(GROUP, 0).await, None);
        assert!(matches!(
            coord.heartbeat(&session).await,
            Err(Error::SessionExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_reregister_replaces_session() {
        let coord = InMemoryCoordinator::new();
        let first = coord.register(GROUP, "member-a").await.unwrap();
        coord.try_acquire_lease(&first, 1).await.unwrap().unwrap();

        let second = coord.register(GROUP, "member-a").await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert!(!first.is_alive());
        assert_eq!(coord.lease_holder(GROUP, 1).await, None);
        assert_eq!(coord.members(GROUP).await, vec!["member-a"]);
    }

    #[tokio::test]
    async fn test_session_expires_without_heartbeats() {
        let coord = InMemoryCoordinator::with_session_config(SessionMonitorConfig {
            heartbeat_interval: Duration::from_millis(10),
            suspect_after: 2,
            expire_after: 4,
            jitter_tolerance: Duration::ZERO,
            startup_grace_period: Duration::ZERO,
        });
        let stale = coord.register(GROUP, "member-a").await.unwrap();
        coord.try_acquire_lease(&stale, 0).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Any call reaps expired sessions
        let other = coord.register(GROUP, "member-b").await.unwrap();
        assert_eq!(coord.members(GROUP).await, vec!["member-b"]);
        assert!(!stale.is_alive());
        assert!(coord.try_acquire_lease(&other, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expire_session_fault_injection() {
        let coord = InMemoryCoordinator::new();
        let session = coord.register(GROUP, "member-a").await.unwrap();

        assert_eq!(coord.expire_session("member-a").await, 1);
        assert!(!session.is_alive());
        assert!(matches!(
            coord.heartbeat(&session).await,
            Err(Error::SessionExpired { .. })
        ));
        assert_eq!(coord.expire_session("member-a").await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let coord = InMemoryCoordinator::new();
        let session = coord.register(GROUP, "member-a").await.unwrap();
        coord.set_available(false);

        assert!(matches!(
            coord.heartbeat(&session).await,
            Err(Error::CoordinationUnavailable(_))
        ));
        assert!(matches!(
            coord.try_acquire_lease(&session, 0).await,
            Err(Error::CoordinationUnavailable(_))
        ));
        assert!(matches!(
            coord.register(GROUP, "member-b").await,
            Err(Error::CoordinationUnavailable(_))
        ));

        coord.set_available(true);
        assert!(coord.heartbeat(&session).await.is_ok());
    }

    // ========================================================================
    // Lease Tests
    // ========================================================================

    #[tokio::test]
    async fn test_lease_denied_while_held() {
        let coord = InMemoryCoordinator::new();
        let a = coord.register(GROUP, "member-a").await.unwrap();
        let b = coord.register(GROUP, "member-b").await.unwrap();

        let token = coord.try_acquire_lease(&a, 0).await.unwrap().unwrap();
        assert_eq!(coord.try_acquire_lease(&b, 0).await.unwrap(), None);

        coord.release_lease(&a, 0, token).await.unwrap();
        let next = coord.try_acquire_lease(&b, 0).await.unwrap().unwrap();
        assert!(next > token);
    }

    #[tokio::test]
    async fn test_stale_release_is_noop() {
        let coord = InMemoryCoordinator::new();
        let a = coord.register(GROUP, "member-a").await.unwrap();
        let token = coord.try_acquire_lease(&a, 0).await.unwrap().unwrap();

        coord
            .release_lease(&a, 0, FencingToken(token.value() + 10))
            .await
            .unwrap();
        assert_eq!(
            coord.lease_holder(GROUP, 0).await,
            Some(("member-a".to_string(), token))
        );
    }

    #[tokio::test]
    async fn test_tokens_increase_across_sessions() {
        let coord = InMemoryCoordinator::new();
        let mut last = FencingToken::default();
        for i in 0..5 {
            let session = coord.register(GROUP, &format!("member-{i}")).await.unwrap();
            let token = coord.try_acquire_lease(&session, 3).await.unwrap().unwrap();
            assert!(token > last);
            last = token;
            coord.deregister(&session).await.unwrap();
        }
        assert!(coord.verify_exclusive().await.is_ok());
    }

    #[tokio::test]
    async fn test_audit_log_records_grants_and_releases() {
        let coord = InMemoryCoordinator::new();
        let a = coord.register(GROUP, "member-a").await.unwrap();
        let token = coord.try_acquire_lease(&a, 0).await.unwrap().unwrap();
        coord.release_lease(&a, 0, token).await.unwrap();

        let log = coord.audit_log().await;
        let events: Vec<_> = log.iter().map(|e| e.event).collect();
        assert_eq!(events, vec![LeaseEvent::Granted, LeaseEvent::Released]);
        assert!(coord.verify_exclusive().await.is_ok());
    }
}
