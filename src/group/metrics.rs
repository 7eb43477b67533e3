//! Prometheus metrics for consumer-group coordination.
//!
//! Metrics cover:
//! - Membership (registrations, rebalances, rebalance latency)
//! - Partition leases (acquire / release / denial, owned partition gauge)
//! - Message delivery (handled, duplicate, handler error, fenced)
//! - Suspension episodes (members that lost their session or backend)
//! - Coordination and transport retries
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "partition_groups"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are logged and the unregistered
//! metric is returned instead of panicking.
//!
//! Several members can live in one process, so gauges that describe
//! per-member state are adjusted with `inc`/`dec` rather than `set`.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for coordination metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("partition_groups".to_string()), None)
        .unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_gauge_vec!(MY_GAUGE, "my_metric", "Description", ["label1"]);
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Membership metrics
// =============================================================================

define_gauge!(
    ACTIVE_MEMBERS,
    "active_members",
    "Number of group members running in this process"
);
define_counter_vec!(
    MEMBERSHIP_EVENTS,
    "membership_events_total",
    "Membership lifecycle events",
    ["event"]
);
define_counter_vec!(
    REBALANCES,
    "rebalances_total",
    "Rebalances performed per group",
    ["group", "status"]
);
define_histogram_vec!(
    REBALANCE_DURATION,
    "rebalance_duration_seconds",
    "Time from membership snapshot to stable assignment",
    ["group"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
);
define_counter!(
    STALE_SNAPSHOTS,
    "stale_snapshots_total",
    "Membership snapshots discarded because a newer epoch was already processed"
);

// =============================================================================
// Lease metrics
// =============================================================================

define_counter_vec!(
    LEASE_OPERATIONS,
    "lease_operations_total",
    "Total number of lease operations",
    ["operation", "status"]
);
define_gauge_vec!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Partitions currently owned by members in this process",
    ["group"]
);

// =============================================================================
// Delivery metrics
// =============================================================================

define_counter_vec!(
    DELIVERIES,
    "deliveries_total",
    "Messages pulled by partition workers, by outcome",
    ["group", "outcome"]
);
define_counter_vec!(
    MESSAGES_PUBLISHED,
    "messages_published_total",
    "Messages published by producers",
    ["destination", "status"]
);
define_counter_vec!(
    FENCING_REJECTIONS,
    "fencing_rejections_total",
    "Deliveries refused by the ownership guard",
    ["reason"]
);
define_gauge!(
    ACTIVE_WORKERS,
    "active_workers",
    "Partition workers currently running"
);

// =============================================================================
// Suspension metrics
// =============================================================================

define_gauge!(
    SUSPENDED_MEMBERS,
    "suspended_members",
    "Members currently suspended after losing their session or backend"
);
define_histogram_vec!(
    SUSPENSION_DURATION,
    "suspension_duration_seconds",
    "Duration of suspension episodes in seconds",
    ["exit_reason"],
    [0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
);
define_counter_vec!(
    SUSPENSION_TRANSITIONS,
    "suspension_transitions_total",
    "Total suspension transitions",
    ["direction"]
);

// =============================================================================
// Retry metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retries performed by the retry layer",
    ["policy", "operation"]
);
define_counter_vec!(
    RETRY_EXHAUSTED,
    "retry_exhausted_total",
    "Operations that failed after exhausting their retry policy",
    ["policy", "operation"]
);

// =============================================================================
// Safe Registration Helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*ACTIVE_MEMBERS;
    let _ = &*MEMBERSHIP_EVENTS;
    let _ = &*REBALANCES;
    let _ = &*REBALANCE_DURATION;
    let _ = &*STALE_SNAPSHOTS;
    let _ = &*LEASE_OPERATIONS;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*DELIVERIES;
    let _ = &*MESSAGES_PUBLISHED;
    let _ = &*FENCING_REJECTIONS;
    let _ = &*ACTIVE_WORKERS;
    let _ = &*SUSPENDED_MEMBERS;
    let _ = &*SUSPENSION_DURATION;
    let _ = &*SUSPENSION_TRANSITIONS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*RETRY_EXHAUSTED;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

// =============================================================================
// Recording Helpers
// =============================================================================

/// Record a member lifecycle event ("joined", "left", "rejoined", "session_lost").
pub fn record_membership_event(event: &str) {
    MEMBERSHIP_EVENTS.with_label_values(&[event]).inc();
}

pub fn inc_active_members() {
    ACTIVE_MEMBERS.inc();
}

pub fn dec_active_members() {
    ACTIVE_MEMBERS.dec();
}

/// Record a completed rebalance and how long it took.
pub fn record_rebalance(group: &str, status: &str, duration_secs: f64) {
    REBALANCES.with_label_values(&[group, status]).inc();
    REBALANCE_DURATION
        .with_label_values(&[group])
        .observe(duration_secs);
}

pub fn record_stale_snapshot() {
    STALE_SNAPSHOTS.inc();
}

/// Record a partition lease operation.
///
/// # Arguments
/// * `operation` - "acquire", "release" or "forget"
/// * `status` - "granted", "denied", "success" or "error"
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

pub fn inc_owned_partitions(group: &str) {
    OWNED_PARTITIONS.with_label_values(&[group]).inc();
}

pub fn dec_owned_partitions(group: &str) {
    OWNED_PARTITIONS.with_label_values(&[group]).dec();
}

/// Record a delivery outcome ("handled", "duplicate", "handler_error", "fenced").
pub fn record_delivery(group: &str, outcome: &str) {
    DELIVERIES.with_label_values(&[group, outcome]).inc();
}

pub fn record_publish(destination: &str, status: &str) {
    MESSAGES_PUBLISHED
        .with_label_values(&[destination, status])
        .inc();
}

/// Record a delivery refused by the ownership guard
/// ("suspended", "session_lost", "not_owned", "token_superseded").
pub fn record_fencing_rejection(reason: &str) {
    FENCING_REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn inc_active_workers() {
    ACTIVE_WORKERS.inc();
}

pub fn dec_active_workers() {
    ACTIVE_WORKERS.dec();
}

// --- Suspension helper functions ---

/// Record a member entering suspension.
pub fn enter_suspension() {
    SUSPENDED_MEMBERS.inc();
    SUSPENSION_TRANSITIONS.with_label_values(&["enter"]).inc();
}

/// Record a member leaving suspension.
///
/// # Arguments
/// * `duration_secs` - How long the member was suspended
/// * `exit_reason` - "recovered", "rejoined" or "shutdown"
pub fn exit_suspension(duration_secs: f64, exit_reason: &str) {
    SUSPENDED_MEMBERS.dec();
    SUSPENSION_TRANSITIONS.with_label_values(&["exit"]).inc();
    SUSPENSION_DURATION
        .with_label_values(&[exit_reason])
        .observe(duration_secs);
}

pub fn record_retry_attempt(policy: &str, operation: &str) {
    RETRY_ATTEMPTS.with_label_values(&[policy, operation]).inc();
}

pub fn record_retry_exhausted(policy: &str, operation: &str) {
    RETRY_EXHAUSTED
        .with_label_values(&[policy, operation])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Metric Recording Helper Tests
    // ========================================================================

    #[test]
    fn test_record_lease_operation() {
        record_lease_operation("acquire", "granted");
        record_lease_operation("acquire", "denied");
        record_lease_operation("release", "error");
    }

    #[test]
    fn test_record_delivery_increments() {
        let before = DELIVERIES
            .with_label_values(&["metrics-test:dest", "handled"])
            .get();
        record_delivery("metrics-test:dest", "handled");
        record_delivery("metrics-test:dest", "handled");
        let after = DELIVERIES
            .with_label_values(&["metrics-test:dest", "handled"])
            .get();
        assert_eq!(after - before, 2);
    }

    #[test]
    fn test_owned_partitions_gauge_inc_dec() {
        let group = "metrics-test:owned";
        inc_owned_partitions(group);
        inc_owned_partitions(group);
        dec_owned_partitions(group);
        assert_eq!(OWNED_PARTITIONS.with_label_values(&[group]).get(), 1);
    }

    #[test]
    fn test_suspension_transitions() {
        let enters = SUSPENSION_TRANSITIONS.with_label_values(&["enter"]).get();
        let exits = SUSPENSION_TRANSITIONS.with_label_values(&["exit"]).get();

        enter_suspension();
        exit_suspension(0.5, "recovered");

        // Other tests may suspend members concurrently
        assert!(SUSPENSION_TRANSITIONS.with_label_values(&["enter"]).get() > enters);
        assert!(SUSPENSION_TRANSITIONS.with_label_values(&["exit"]).get() > exits);
    }

    // ========================================================================
    // Registry Tests
    // ========================================================================

    #[test]
    fn test_encode_metrics_uses_prefix() {
        init_metrics();
        record_rebalance("metrics-test:encode", "success", 0.01);
        let text = encode_metrics().unwrap();
        assert!(text.contains("partition_groups_rebalances_total"));
    }

    #[test]
    fn test_gather_metrics_not_empty() {
        init_metrics();
        record_retry_attempt("coordination", "heartbeat");
        assert!(!gather_metrics().is_empty());
    }
}
