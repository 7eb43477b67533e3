//! Suspension state of a group member.
//!
//! A member is suspended when it can no longer prove it holds its session:
//! consecutive heartbeat failures, an expired session, or an unreachable
//! coordination backend. While suspended every partition worker of the member
//! refuses to deliver, and the member's local leases are forgotten.
//!
//! Exits carry the episode number captured when recovery started, so a
//! recovery that raced with a fresh suspension does not clear the new episode.
//!
//! ```rust
//! use partition_groups::group::suspension::SuspensionState;
//!
//! let state = SuspensionState::new();
//! assert!(state.enter());
//! let episode = state.episode();
//! // ... re-register with the backend ...
//! assert!(state.try_exit(episode, "rejoined"));
//! assert!(!state.is_active());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::metrics;

/// Atomic suspension flag with episode tracking.
///
/// The flag and the episode number share one word (`episode << 1 | active`)
/// so entry and exit are single compare-and-swap transitions.
#[derive(Debug)]
pub struct SuspensionState {
    state: AtomicU64,
    /// Millis since `origin` at the last entry.
    entered_at_millis: AtomicU64,
    origin: Instant,
}

const ACTIVE_BIT: u64 = 1;

impl Default for SuspensionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspensionState {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            entered_at_millis: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) & ACTIVE_BIT != 0
    }

    /// Number of the current (or most recent) suspension episode. Zero if the
    /// member was never suspended.
    pub fn episode(&self) -> u64 {
        self.state.load(Ordering::SeqCst) >> 1
    }

    /// Enter suspension.
    ///
    /// Returns `true` if this call transitioned into suspension, `false` if
    /// the member was already suspended.
    pub fn enter(&self) -> bool {
        let entered = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current & ACTIVE_BIT != 0 {
                    None
                } else {
                    Some((((current >> 1) + 1) << 1) | ACTIVE_BIT)
                }
            })
            .is_ok();

        if entered {
            self.entered_at_millis
                .store(self.origin.elapsed().as_millis() as u64, Ordering::SeqCst);
            metrics::enter_suspension();
        }
        entered
    }

    /// Exit suspension if the episode has not changed since `expected_episode`
    /// was read.
    ///
    /// Returns `false` if the member was not suspended, was re-suspended
    /// meanwhile, or another caller exited first.
    pub fn try_exit(&self, expected_episode: u64, exit_reason: &str) -> bool {
        let suspended = (expected_episode << 1) | ACTIVE_BIT;
        let resumed = expected_episode << 1;

        match self
            .state
            .compare_exchange(suspended, resumed, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                metrics::exit_suspension(self.elapsed_secs(), exit_reason);
                true
            }
            Err(_) => false,
        }
    }

    /// Exit suspension regardless of episode. Used on shutdown.
    pub fn force_exit(&self, exit_reason: &str) -> bool {
        let previous = self.state.fetch_and(!ACTIVE_BIT, Ordering::SeqCst);
        if previous & ACTIVE_BIT != 0 {
            metrics::exit_suspension(self.elapsed_secs(), exit_reason);
            true
        } else {
            false
        }
    }

    fn elapsed_secs(&self) -> f64 {
        let now = self.origin.elapsed().as_millis() as u64;
        now.saturating_sub(self.entered_at_millis.load(Ordering::SeqCst)) as f64 / 1000.0
    }
}

/// Why a member suspended itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// `max_consecutive_heartbeat_failures` heartbeats in a row failed.
    HeartbeatFailures,
    /// The backend reported the session as expired.
    SessionExpired,
    /// A coordination call failed after exhausting its retries.
    CoordinationUnavailable,
}

impl SuspendReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspendReason::HeartbeatFailures => "heartbeat_failures",
            SuspendReason::SessionExpired => "session_expired",
            SuspendReason::CoordinationUnavailable => "coordination_unavailable",
        }
    }
}
