//! Per-partition lease state machine.
//!
//! Each partition of a destination is, from one member's perspective, in one
//! of four states:
//!
//! ```text
//!            assignment says "mine"          grant
//! Unowned ─────────────────────────► Acquiring ─────► Owned{token}
//!    ▲                                   │                 │
//!    │            denial / error         │                 │ assignment says
//!    ├───────────────────────────────────┘                 │ "not mine"
//!    │                                                     ▼
//!    └───────────────────────────────────────────── Releasing{token}
//!            worker stopped + lease released
//! ```
//!
//! Session loss short-circuits every state back to `Unowned` without a
//! backend call (the backend already dropped the leases with the session).

use std::fmt;
use std::time::{Duration, Instant};

use crate::types::FencingToken;

/// State of one partition lease from the local member's perspective.
#[derive(Default, Clone, PartialEq, Eq)]
pub enum LeaseState {
    #[default]
    Unowned,

    /// An acquisition call is in flight.
    Acquiring { started_at: Instant },

    /// The lease is held and the worker may deliver.
    Owned {
        token: FencingToken,
        acquired_at: Instant,
    },

    /// The worker is being stopped; the lease is released afterwards.
    Releasing {
        token: FencingToken,
        started_at: Instant,
    },
}

impl fmt::Debug for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Unowned => write!(f, "Unowned"),
            LeaseState::Acquiring { started_at } => f
                .debug_struct("Acquiring")
                .field("duration", &started_at.elapsed())
                .finish(),
            LeaseState::Owned { token, acquired_at } => f
                .debug_struct("Owned")
                .field("token", token)
                .field("duration", &acquired_at.elapsed())
                .finish(),
            LeaseState::Releasing { token, started_at } => f
                .debug_struct("Releasing")
                .field("token", token)
                .field("duration", &started_at.elapsed())
                .finish(),
        }
    }
}

impl LeaseState {
    pub fn start_acquiring() -> Self {
        LeaseState::Acquiring {
            started_at: Instant::now(),
        }
    }

    pub fn owned(token: FencingToken) -> Self {
        LeaseState::Owned {
            token,
            acquired_at: Instant::now(),
        }
    }

    pub fn start_releasing(token: FencingToken) -> Self {
        LeaseState::Releasing {
            token,
            started_at: Instant::now(),
        }
    }

    /// True only in `Owned`; a releasing lease no longer admits deliveries.
    pub fn is_owned(&self) -> bool {
        matches!(self, LeaseState::Owned { .. })
    }

    pub fn is_unowned(&self) -> bool {
        matches!(self, LeaseState::Unowned)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            LeaseState::Acquiring { .. } | LeaseState::Releasing { .. }
        )
    }

    /// Token of an owned or releasing lease.
    pub fn token(&self) -> Option<FencingToken> {
        match self {
            LeaseState::Owned { token, .. } | LeaseState::Releasing { token, .. } => Some(*token),
            _ => None,
        }
    }

    /// True if the lease is owned with exactly `expected`.
    pub fn is_owned_with(&self, expected: FencingToken) -> bool {
        matches!(self, LeaseState::Owned { token, .. } if *token == expected)
    }

    pub fn duration_in_state(&self) -> Option<Duration> {
        match self {
            LeaseState::Unowned => None,
            LeaseState::Acquiring { started_at } => Some(started_at.elapsed()),
            LeaseState::Owned { acquired_at, .. } => Some(acquired_at.elapsed()),
            LeaseState::Releasing { started_at, .. } => Some(started_at.elapsed()),
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            LeaseState::Unowned => "unowned",
            LeaseState::Acquiring { .. } => "acquiring",
            LeaseState::Owned { .. } => "owned",
            LeaseState::Releasing { .. } => "releasing",
        }
    }
}
