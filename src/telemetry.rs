//! Log subscriber for consumer processes.
//!
//! Coordination events carry the fields `member_id`, `group`, `partition`
//! and `token`, so one member's rebalance history or one partition's lease
//! hand-offs can be followed by filtering on a single field. Lease and
//! suspension transitions log at `info`/`warn`; per-message worker events
//! log at `debug`.
//!
//! ```rust,no_run
//! use partition_groups::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: filter directives, e.g.
//!   `partition_groups::group::rebalance_coordinator=debug` to trace
//!   rebalances only (default: [`DEFAULT_LOG_FILTER`])
//!
//! Metrics are exported separately through [`crate::group::metrics::encode_metrics`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for a terminal.
    #[default]
    Pretty,
    /// One JSON object per event; the `member_id`/`group`/`partition` fields
    /// become top-level keys for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Anything other than `json` (case-insensitive) selects `Pretty`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        })
    }
}

impl LogFormat {
    /// Format named by `LOG_FORMAT`, `Pretty` when unset.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the process-wide subscriber for a consumer or producer process.
///
/// Call once at startup, before joining any group. A second call fails
/// because the global subscriber is already set.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(env_filter());
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?,
    }
    Ok(())
}
