//! Consumer-group coordination.
//!
//! Every member of a consumer group (`{subscriber_id}:{destination}`) runs the
//! same deterministic assignment over the same membership snapshot, then takes
//! exclusive leases on the partitions assigned to it.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────┐
//!                 │  Coordination backend  │ ← sessions, membership, leases
//!                 └───────────┬────────────┘
//!               watch_members │  try_acquire_lease / release_lease
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │ member a │   │ member b │   │ member c │  RebalanceCoordinator
//!        │  p0, p1  │   │  p2, p3  │   │   p4     │  + LeaseManager
//!        └────┬─────┘   └────┬─────┘   └────┬─────┘
//!             │ one PartitionWorker per owned lease
//!             ▼              ▼              ▼
//!        dest-0 dest-1  dest-2 dest-3    dest-4      broker channels
//! ```
//!
//! # Guarantees
//!
//! - **Exclusivity**: a partition is delivered by at most one live member; the
//!   delivery guard checks suspension, session and fencing token per message
//! - **Coverage**: with at least one live member every partition is eventually
//!   owned; denied acquisitions are retried on a periodic tick
//! - **No silent drops**: fenced or failed deliveries are nacked with requeue

pub mod assignment;
mod config;
pub mod lease_manager;
pub mod lease_state;
pub mod metrics;
pub mod ownership_guard;
pub mod rebalance_coordinator;
pub mod retry;
pub mod session_monitor;
pub mod suspension;
mod traits;
pub mod worker;

#[cfg(any(test, feature = "test-utilities"))]
pub mod in_memory_coordinator;

pub use assignment::{Assignment, assign_partitions};
pub use config::{ConfigProfile, ConsumerConfig};
#[cfg(any(test, feature = "test-utilities"))]
pub use in_memory_coordinator::{InMemoryCoordinator, LeaseAuditEntry, LeaseEvent};
pub use lease_manager::{AcquireOutcome, LeaseManager, LeaseStats};
pub use lease_state::LeaseState;
pub use ownership_guard::{DeliveryGuard, DeliveryPermit, FencingError};
pub use rebalance_coordinator::{
    MemberParams, MemberState, MemberStatus, MemberSummary, RebalanceCoordinator,
};
pub use session_monitor::{SessionHealth, SessionMonitor, SessionMonitorConfig};
pub use suspension::{SuspendReason, SuspensionState};
pub use traits::{CoordinationClient, MemberSession, MembershipSnapshot, MembershipWatch};
pub use worker::{PartitionWorker, WorkerContext, WorkerExit};
