//! Heartbeat-based session liveness tracking.
//!
//! Used by the in-memory coordination backend to decide when a member's
//! session is gone. A session moves through:
//!
//! 1. **Live** - heartbeats received on time
//! 2. **Suspected** - some heartbeats missed (scheduler hiccup, slow network)
//! 3. **Expired** - enough heartbeats missed; the backend drops the session
//!    and every lease it held
//!
//! Expiry is terminal: an expired session never returns to `Live`, the
//! member has to register again.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_EXPIRE_AFTER_MISSED_HEARTBEATS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_SESSION_STARTUP_GRACE_MS, DEFAULT_SUSPECT_AFTER_MISSED_HEARTBEATS,
};

/// Thresholds for session liveness.
#[derive(Debug, Clone)]
pub struct SessionMonitorConfig {
    /// Interval at which members are expected to heartbeat.
    pub heartbeat_interval: Duration,

    /// Missed heartbeats before a session is suspected.
    pub suspect_after: u32,

    /// Missed heartbeats before a session expires.
    pub expire_after: u32,

    /// Heartbeats arriving within this tolerance of the expected time are not
    /// counted as missed.
    pub jitter_tolerance: Duration,

    /// Time after registration during which missed heartbeats are not counted.
    pub startup_grace_period: Duration,
}

impl Default for SessionMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            suspect_after: DEFAULT_SUSPECT_AFTER_MISSED_HEARTBEATS,
            expire_after: DEFAULT_EXPIRE_AFTER_MISSED_HEARTBEATS,
            jitter_tolerance: Duration::from_millis(50),
            startup_grace_period: Duration::from_millis(DEFAULT_SESSION_STARTUP_GRACE_MS),
        }
    }
}

impl SessionMonitorConfig {
    /// Config matching members that heartbeat every `interval`.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval,
            jitter_tolerance: interval / 10,
            startup_grace_period: interval * 2,
            ..Default::default()
        }
    }

    /// Time without heartbeats after which a session expires.
    pub fn expiry_time(&self) -> Duration {
        self.heartbeat_interval * self.expire_after + self.jitter_tolerance
    }
}

/// Liveness of a session from the backend's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Live,
    Suspected,
    Expired,
}

impl std::fmt::Display for SessionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionHealth::Live => write!(f, "live"),
            SessionHealth::Suspected => write!(f, "suspected"),
            SessionHealth::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug)]
struct SessionRecord {
    last_heartbeat: Instant,
    registered_at: Instant,
    health: SessionHealth,
}

/// Emitted when a session's health changes.
#[derive(Debug, Clone)]
pub struct SessionHealthChange {
    pub session_id: u64,
    pub previous: SessionHealth,
    pub current: SessionHealth,
    pub missed_heartbeats: u32,
}

/// Tracks heartbeats of all sessions of a backend.
pub struct SessionMonitor {
    config: SessionMonitorConfig,
    sessions: DashMap<u64, SessionRecord>,
    expirations: AtomicU64,
    recoveries: AtomicU64,
}

impl SessionMonitor {
    pub fn new(config: SessionMonitorConfig) -> Self {
        debug!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            suspect_after = config.suspect_after,
            expire_after = config.expire_after,
            "Creating session monitor"
        );

        Self {
            config,
            sessions: DashMap::new(),
            expirations: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionMonitorConfig {
        &self.config
    }

    pub fn register(&self, session_id: u64) {
        let now = Instant::now();
        self.sessions.insert(
            session_id,
            SessionRecord {
                last_heartbeat: now,
                registered_at: now,
                health: SessionHealth::Live,
            },
        );
    }

    pub fn unregister(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    /// Record a heartbeat.
    ///
    /// Returns `false` for unknown or already expired sessions.
    pub fn record_heartbeat(&self, session_id: u64) -> bool {
        let Some(mut record) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if record.health == SessionHealth::Expired {
            return false;
        }
        if record.health == SessionHealth::Suspected {
            debug!(session_id, "Session recovered from suspected state");
            self.recoveries.fetch_add(1, Ordering::Relaxed);
        }
        record.last_heartbeat = Instant::now();
        record.health = SessionHealth::Live;
        true
    }

    /// Re-evaluate every session and return the ones whose health changed.
    pub fn check_sessions(&self) -> Vec<SessionHealthChange> {
        let now = Instant::now();
        let mut changes = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let session_id = *entry.key();
            let record = entry.value_mut();

            if record.health == SessionHealth::Expired {
                continue;
            }
            if now.duration_since(record.registered_at) < self.config.startup_grace_period {
                continue;
            }

            let elapsed = now
                .duration_since(record.last_heartbeat)
                .saturating_sub(self.config.jitter_tolerance);
            let missed = if self.config.heartbeat_interval.is_zero() {
                0
            } else {
                (elapsed.as_nanos() / self.config.heartbeat_interval.as_nanos()) as u32
            };

            let previous = record.health;
            let current = if missed >= self.config.expire_after {
                SessionHealth::Expired
            } else if missed >= self.config.suspect_after {
                SessionHealth::Suspected
            } else {
                SessionHealth::Live
            };

            if current != previous {
                record.health = current;
                match current {
                    SessionHealth::Expired => {
                        warn!(session_id, missed_heartbeats = missed, "Session expired");
                        self.expirations.fetch_add(1, Ordering::Relaxed);
                    }
                    SessionHealth::Suspected => {
                        info!(session_id, missed_heartbeats = missed, "Session suspected");
                    }
                    SessionHealth::Live => {}
                }
                changes.push(SessionHealthChange {
                    session_id,
                    previous,
                    current,
                    missed_heartbeats: missed,
                });
            }
        }

        changes
    }

    /// Mark a session expired immediately.
    pub fn expire(&self, session_id: u64) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(mut record) if record.health != SessionHealth::Expired => {
                record.health = SessionHealth::Expired;
                self.expirations.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn health_of(&self, session_id: u64) -> Option<SessionHealth> {
        self.sessions.get(&session_id).map(|r| r.health)
    }

    pub fn sessions_in(&self, health: SessionHealth) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().health == health)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn total_recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new(SessionMonitorConfig::default())
    }
}
