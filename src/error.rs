//! Crate level errors.
//!
//! # Error Handling Patterns
//!
//! Errors fall into three groups based on what the caller should do next:
//!
//! ## Retriable (back off and try again)
//!
//! - [`Error::CoordinationUnavailable`]: the coordination backend could not be
//!   reached. Members suspend consumption of held partitions until it returns.
//! - [`Error::SessionExpired`]: the backend dropped the member's session. The
//!   member rejoins with a fresh session.
//! - [`Error::Transport`]: a broker call failed. Publishing surfaces it to the
//!   caller; consuming logs it and retries.
//!
//! ## Expected (not an application failure)
//!
//! - [`Error::LeaseDenied`]: another live member still holds the partition.
//!   Retried on the next membership event or rebalance tick.
//!
//! ## Fatal for the call (fix the input)
//!
//! - [`Error::UnknownDestination`], [`Error::PartitionCountMismatch`],
//!   [`Error::InvalidPartition`], [`Error::Config`], [`Error::Closed`].
//!
//! Message handlers report failure through [`HandlerError`], which is kept
//! separate so user code never has to construct coordination errors.

use std::result;
use thiserror::Error as ThisError;

use crate::types::{GroupId, MemberId, PartitionId};

pub type Result<T> = result::Result<T, Error>;

/// Errors raised by the coordination, routing and consumption layers.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The coordination backend is unreachable.
    #[error("Coordination backend unavailable: {0}")]
    CoordinationUnavailable(String),

    /// The member's session was expired by the backend.
    #[error("Session expired for member {member_id}")]
    SessionExpired { member_id: MemberId },

    /// Another live session holds the partition lease.
    #[error("Lease for partition {partition} of group {group} is held by another member")]
    LeaseDenied { group: GroupId, partition: PartitionId },

    /// Broker transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The destination has never been declared.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// The destination already exists with a different partition count.
    #[error(
        "Partition count mismatch for {destination}: declared {declared}, requested {requested}"
    )]
    PartitionCountMismatch {
        destination: String,
        declared: u32,
        requested: u32,
    },

    /// Partition index outside `[0, partition_count)`.
    #[error(
        "Invalid partition {partition} for destination {destination} with {partition_count} partitions"
    )]
    InvalidPartition {
        destination: String,
        partition: PartitionId,
        partition_count: u32,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The subscription or member was already closed.
    #[error("Subscription closed")]
    Closed,
}

impl Error {
    /// Check if this error is transient and the operation may be retried.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::CoordinationUnavailable(_) => true,
            Error::Transport(_) => true,
            // Recoverable by rejoining, not by repeating the same call
            Error::SessionExpired { .. } => false,
            Error::LeaseDenied { .. } => false,
            Error::Handler(_) => false,
            Error::UnknownDestination(_) => false,
            Error::PartitionCountMismatch { .. } => false,
            Error::InvalidPartition { .. } => false,
            Error::Config(_) => false,
            Error::Closed => false,
        }
    }

    /// Returns true if the member lost its session or cannot reach the backend,
    /// meaning held partitions must stop delivering.
    pub fn requires_suspension(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::SessionExpired { .. }
        )
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            Error::CoordinationUnavailable(_) => "coordination_unavailable",
            Error::SessionExpired { .. } => "session_expired",
            Error::LeaseDenied { .. } => "lease_denied",
            Error::Transport(_) => "transport",
            Error::Handler(_) => "handler",
            Error::UnknownDestination(_) => "unknown_destination",
            Error::PartitionCountMismatch { .. } => "partition_count_mismatch",
            Error::InvalidPartition { .. } => "invalid_partition",
            Error::Config(_) => "config",
            Error::Closed => "closed",
        }
    }
}

impl From<HandlerError> for Error {
    fn from(e: HandlerError) -> Self {
        Error::Handler(e.to_string())
    }
}

/// Failure reported by a message handler.
///
/// A failed message is nacked with requeue and redelivered later.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum HandlerError {
    /// The handler rejected the message.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; the panic was caught by the worker.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError::Failed(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        HandlerError::Failed(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable_method() {
        assert!(Error::CoordinationUnavailable("down".to_string()).is_retriable());
        assert!(Error::Transport("reset".to_string()).is_retriable());
        assert!(!Error::Config("bad".to_string()).is_retriable());
        assert!(!Error::Closed.is_retriable());
        assert!(
            !Error::SessionExpired {
                member_id: "member-1".to_string()
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_requires_suspension() {
        assert!(Error::CoordinationUnavailable("down".to_string()).requires_suspension());
        assert!(
            Error::SessionExpired {
                member_id: "m".to_string()
            }
            .requires_suspension()
        );
        assert!(!Error::Transport("x".to_string()).requires_suspension());
        assert!(
            !Error::LeaseDenied {
                group: "g".to_string(),
                partition: 0
            }
            .requires_suspension()
        );
    }

    #[test]
    fn test_partition_count_mismatch_display() {
        let err = Error::PartitionCountMismatch {
            destination: "orders".to_string(),
            declared: 4,
            requested: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("declared 4"));
        assert!(msg.contains("requested 8"));
    }

    #[test]
    fn test_handler_error_conversion() {
        let err: Error = HandlerError::failed("boom").into();
        assert_eq!(err, Error::Handler("boom".to_string()));

        let from_str: HandlerError = "nope".into();
        assert_eq!(from_str, HandlerError::Failed("nope".to_string()));
    }

    #[test]
    fn test_metric_labels_are_snake_case() {
        let errors = [
            Error::CoordinationUnavailable(String::new()),
            Error::Transport(String::new()),
            Error::UnknownDestination(String::new()),
            Error::Closed,
        ];
        for err in errors {
            let label = err.as_metric_label();
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
