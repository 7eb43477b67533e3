//! Centralized coordination and delivery constants.
//!
//! # Categories
//!
//! - **Message Headers**: names stamped by the producer
//! - **Membership Constants**: heartbeat and rebalance timing
//! - **Session Constants**: liveness thresholds used by the in-memory backend
//! - **Delivery Constants**: worker polling and drain limits

// =============================================================================
// Message Headers
// =============================================================================

/// Header carrying the message id.
pub const HEADER_MESSAGE_ID: &str = "ID";

/// Header carrying the logical destination.
pub const HEADER_DESTINATION: &str = "DESTINATION";

/// Header carrying the partition the router picked.
pub const HEADER_PARTITION_ID: &str = "PARTITION_ID";

// =============================================================================
// Membership Constants
// =============================================================================

/// Default number of partitions per destination.
pub const DEFAULT_PARTITION_COUNT: u32 = 2;

/// Upper bound on partitions per destination.
///
/// Each owned partition runs one worker task; this keeps a misconfigured
/// destination from spawning an unbounded number of them.
pub const MAX_PARTITION_COUNT: u32 = 4096;

/// Default heartbeat interval for member sessions.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Default interval of the periodic rebalance tick.
///
/// The tick retries denied lease acquisitions and restarts workers that
/// exited on their own.
pub const DEFAULT_REBALANCE_TICK_MS: u64 = 250;

/// Consecutive heartbeat failures before a member suspends itself.
pub const DEFAULT_MAX_CONSECUTIVE_HEARTBEAT_FAILURES: u32 = 3;

/// Jitter applied to heartbeat and tick intervals (0.0 - 1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.15;

// =============================================================================
// Session Constants
// =============================================================================

/// Missed heartbeat intervals before a session is suspected.
pub const DEFAULT_SUSPECT_AFTER_MISSED_HEARTBEATS: u32 = 3;

/// Missed heartbeat intervals before a session is expired.
pub const DEFAULT_EXPIRE_AFTER_MISSED_HEARTBEATS: u32 = 6;

/// Grace period after registration before a session can be suspected.
pub const DEFAULT_SESSION_STARTUP_GRACE_MS: u64 = 1_000;

// =============================================================================
// Delivery Constants
// =============================================================================

/// How long a worker waits for a message before re-checking its stop signal.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// How long `stop` waits for a worker to finish its in-flight message.
pub const DEFAULT_WORKER_DRAIN_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on the backoff between consume-side transport retries.
pub const MAX_TRANSPORT_BACKOFF_MS: u64 = 2_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_thresholds_ordered() {
        assert!(DEFAULT_SUSPECT_AFTER_MISSED_HEARTBEATS < DEFAULT_EXPIRE_AFTER_MISSED_HEARTBEATS);
    }

    #[test]
    fn test_poll_timeout_below_heartbeat() {
        assert!(DEFAULT_POLL_TIMEOUT_MS < DEFAULT_HEARTBEAT_INTERVAL_MS);
    }

    #[test]
    fn test_default_partition_count_in_range() {
        assert!(DEFAULT_PARTITION_COUNT >= 1);
        assert!(DEFAULT_PARTITION_COUNT <= MAX_PARTITION_COUNT);
    }
}
