//! Named retry policies for coordination and transport calls.
//!
//! Every policy is bounded and jittered, so no coordination call can hang a
//! member indefinitely and members that lost the backend together do not
//! reconnect in lockstep.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `coordination_policy` | 20ms | 500ms | 4 | declare, register, deregister, watch |
//! | `lease_policy` | 10ms | 200ms | 3 | acquire / release lease |
//! | `transport_policy` | 50ms | 2s | 5 | broker publish, ack, nack |
//!
//! Heartbeats are not retried here: they have their own failure budget
//! (`max_consecutive_heartbeat_failures`) and are repeated on every interval.
//!
//! # Example
//!
//! ```rust,no_run
//! use partition_groups::group::retry;
//! use partition_groups::Error;
//!
//! async fn example() -> Result<(), Error> {
//!     retry::with_coordination_policy("declare", || async {
//!         // your fallible coordination call
//!         Ok::<_, Error>(())
//!     })
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{Error, Result};

/// Policy for coordination backend calls (declare, register, deregister, watch).
pub fn coordination_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(4)
        .with_jitter()
}

/// Policy for lease acquisition and release.
///
/// Kept short: a denied or failed acquisition is retried anyway on the next
/// rebalance tick.
pub fn lease_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for broker transport calls.
pub fn transport_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

async fn with_policy<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation_name: &'static str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = operation
        .retry(policy)
        .when(Error::is_retriable)
        .notify(|err: &Error, delay: Duration| {
            record_retry_attempt(policy_name, operation_name);
            tracing::debug!(
                policy = policy_name,
                operation = operation_name,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient error"
            );
        })
        .await;

    if let Err(ref e) = result
        && e.is_retriable()
    {
        record_retry_exhausted(policy_name, operation_name);
    }
    result
}

/// Execute a coordination call, retrying transient failures.
pub async fn with_coordination_policy<F, Fut, T>(operation_name: &'static str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_policy("coordination", coordination_policy(), operation_name, operation).await
}

/// Execute a lease call, retrying transient failures.
pub async fn with_lease_policy<F, Fut, T>(operation_name: &'static str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_policy("lease", lease_policy(), operation_name, operation).await
}

/// Execute a broker call, retrying transient failures.
pub async fn with_transport_policy<F, Fut, T>(operation_name: &'static str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_policy("transport", transport_policy(), operation_name, operation).await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, operation: &str) {
    super::metrics::record_retry_attempt(policy_name, operation);
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str, operation: &str) {
    super::metrics::record_retry_exhausted(policy_name, operation);
    tracing::warn!(policy = policy_name, operation, "Retry policy exhausted");
}
