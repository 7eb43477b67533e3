//! Delivery fencing: the single check a worker runs before handing a message
//! to the handler.
//!
//! A member may deliver from a partition only while all of these hold:
//!
//! 1. the member is not suspended (it can reach the backend and trusts its view)
//! 2. the session that acquired the lease is still alive
//! 3. the partition is still owned locally with the token the worker started with
//!
//! Check 3 fails as soon as the lease enters `Releasing`, so a worker being
//! stopped for a rebalance never delivers while its lease is handed back.
//!
//! # Example
//!
//! ```text
//! let guard = DeliveryGuard::new(group, partition, token, owned, suspension, session);
//!
//! let permit = guard.validate_for_delivery()?;
//! handler.handle(message).await;
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error as ThisError;

use super::metrics;
use super::suspension::SuspensionState;
use super::traits::MemberSession;
use crate::types::{FencingToken, GroupId, PartitionId};

/// Why a delivery was refused.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum FencingError {
    /// The member is suspended after losing its backend or session.
    #[error("Member suspended, refusing delivery for {group}/{partition}")]
    Suspended { group: GroupId, partition: PartitionId },

    /// The session holding the lease has ended.
    #[error("Session lost for {group}/{partition}")]
    SessionLost { group: GroupId, partition: PartitionId },

    /// The partition is no longer owned locally.
    #[error("Partition {group}/{partition} not owned by this member")]
    NotOwned { group: GroupId, partition: PartitionId },

    /// The partition was re-acquired with a newer token.
    #[error("Token superseded for {group}/{partition}: expected {expected}, current {current}")]
    TokenSuperseded {
        group: GroupId,
        partition: PartitionId,
        expected: FencingToken,
        current: FencingToken,
    },
}

impl FencingError {
    pub fn group(&self) -> &str {
        match self {
            FencingError::Suspended { group, .. }
            | FencingError::SessionLost { group, .. }
            | FencingError::NotOwned { group, .. }
            | FencingError::TokenSuperseded { group, .. } => group,
        }
    }

    pub fn partition(&self) -> PartitionId {
        match self {
            FencingError::Suspended { partition, .. }
            | FencingError::SessionLost { partition, .. }
            | FencingError::NotOwned { partition, .. }
            | FencingError::TokenSuperseded { partition, .. } => *partition,
        }
    }

    pub fn as_metric_label(&self) -> &'static str {
        match self {
            FencingError::Suspended { .. } => "suspended",
            FencingError::SessionLost { .. } => "session_lost",
            FencingError::NotOwned { .. } => "not_owned",
            FencingError::TokenSuperseded { .. } => "token_superseded",
        }
    }
}

/// Ownership check bound to one worker's (partition, token).
///
/// Cheap to clone; all state is shared through `Arc`s.
#[derive(Clone)]
pub struct DeliveryGuard {
    group: GroupId,
    partition: PartitionId,
    token: FencingToken,
    owned: Arc<DashMap<PartitionId, FencingToken>>,
    suspension: Arc<SuspensionState>,
    session: MemberSession,
}

impl DeliveryGuard {
    pub fn new(
        group: GroupId,
        partition: PartitionId,
        token: FencingToken,
        owned: Arc<DashMap<PartitionId, FencingToken>>,
        suspension: Arc<SuspensionState>,
        session: MemberSession,
    ) -> Self {
        Self {
            group,
            partition,
            token,
            owned,
            suspension,
            session,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn token(&self) -> FencingToken {
        self.token
    }

    /// Run every ownership check. Lock-free.
    pub fn validate_for_delivery(&self) -> Result<DeliveryPermit, FencingError> {
        if let Err(e) = self.check() {
            metrics::record_fencing_rejection(e.as_metric_label());
            tracing::warn!(
                group = %self.group,
                partition = self.partition,
                token = self.token.value(),
                reason = e.as_metric_label(),
                "Refusing delivery"
            );
            return Err(e);
        }
        Ok(DeliveryPermit {
            _guard: self.clone(),
        })
    }

    fn check(&self) -> Result<(), FencingError> {
        if self.suspension.is_active() {
            return Err(FencingError::Suspended {
                group: self.group.clone(),
                partition: self.partition,
            });
        }
        if !self.session.is_alive() {
            return Err(FencingError::SessionLost {
                group: self.group.clone(),
                partition: self.partition,
            });
        }
        match self.owned.get(&self.partition).map(|t| *t) {
            None => Err(FencingError::NotOwned {
                group: self.group.clone(),
                partition: self.partition,
            }),
            Some(current) if current != self.token => Err(FencingError::TokenSuperseded {
                group: self.group.clone(),
                partition: self.partition,
                expected: self.token,
                current,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Same checks as [`validate_for_delivery`](Self::validate_for_delivery)
    /// without logging or metrics.
    pub fn is_still_valid(&self) -> bool {
        self.check().is_ok()
    }
}

impl std::fmt::Debug for DeliveryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryGuard")
            .field("group", &self.group)
            .field("partition", &self.partition)
            .field("token", &self.token)
            .field("suspended", &self.suspension.is_active())
            .field("session_alive", &self.session.is_alive())
            .finish()
    }
}

/// Proof that ownership was validated for one delivery.
#[derive(Debug)]
pub struct DeliveryPermit {
    _guard: DeliveryGuard,
}

impl DeliveryPermit {
    pub fn partition(&self) -> PartitionId {
        self._guard.partition()
    }

    pub fn token(&self) -> FencingToken {
        self._guard.token()
    }
}
