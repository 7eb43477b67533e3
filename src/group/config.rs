//! Consumer configuration.
//!
//! # Profiles
//!
//! Pick a starting point with [`ConsumerConfig::from_profile`] and override
//! individual fields as needed:
//!
//! | Profile | Heartbeat | Rebalance tick | Failures before suspend | Poll timeout |
//! |---------|-----------|----------------|-------------------------|--------------|
//! | `Development` | 250ms | 100ms | 3 | 50ms |
//! | `Production` | 500ms | 250ms | 3 | 100ms |
//! | `LowLatency` | 100ms | 50ms | 2 | 20ms |
//!
//! # Environment
//!
//! [`ConsumerConfig::from_env`] reads `CONSUMER_PROFILE` for the base profile
//! and then applies `PARTITION_COUNT`, `HEARTBEAT_INTERVAL_MS`,
//! `REBALANCE_TICK_MS`, `MAX_CONSECUTIVE_HEARTBEAT_FAILURES`,
//! `POLL_TIMEOUT_MS` and `WORKER_DRAIN_TIMEOUT_MS` on top.

use std::time::Duration;

use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MAX_CONSECUTIVE_HEARTBEAT_FAILURES,
    DEFAULT_PARTITION_COUNT, DEFAULT_POLL_TIMEOUT_MS, DEFAULT_REBALANCE_TICK_MS,
    DEFAULT_WORKER_DRAIN_TIMEOUT_MS, MAX_PARTITION_COUNT,
};

/// Preset timing profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigProfile {
    /// Fast failure detection and short drains for local runs and tests.
    Development,

    /// Balanced defaults.
    #[default]
    Production,

    /// Aggressive heartbeats and polling.
    ///
    /// **Warning:** a busy scheduler can cause spurious suspensions.
    LowLatency,
}

impl ConfigProfile {
    pub fn description(&self) -> &'static str {
        match self {
            ConfigProfile::Development => "Local development and testing",
            ConfigProfile::Production => "Balanced production workloads",
            ConfigProfile::LowLatency => "Minimum rebalance latency",
        }
    }

    pub fn all() -> &'static [ConfigProfile] {
        &[
            ConfigProfile::Development,
            ConfigProfile::Production,
            ConfigProfile::LowLatency,
        ]
    }
}

impl std::fmt::Display for ConfigProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigProfile::Development => write!(f, "development"),
            ConfigProfile::Production => write!(f, "production"),
            ConfigProfile::LowLatency => write!(f, "low-latency"),
        }
    }
}

impl std::str::FromStr for ConfigProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ConfigProfile::Development),
            "production" | "prod" => Ok(ConfigProfile::Production),
            "low-latency" | "latency" | "ll" => Ok(ConfigProfile::LowLatency),
            _ => Err(format!(
                "Unknown profile '{}'. Valid options: development, production, low-latency",
                s
            )),
        }
    }
}

/// Settings shared by every member a [`MessageConsumer`](crate::MessageConsumer)
/// creates.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Partition count declared for destinations this consumer subscribes to.
    /// Must match the stored count if the destination already exists.
    pub partition_count: u32,

    /// Interval between session heartbeats (jittered).
    pub heartbeat_interval: Duration,

    /// Interval of the periodic tick that retries denied acquisitions and
    /// restarts fenced workers (jittered).
    pub rebalance_tick_interval: Duration,

    /// Consecutive heartbeat failures before the member suspends itself.
    pub max_consecutive_heartbeat_failures: u32,

    /// How long a worker waits for a delivery before re-checking its stop
    /// signal.
    pub poll_timeout: Duration,

    /// How long a stopping worker may take to finish its in-flight delivery
    /// before it is aborted.
    pub worker_drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            rebalance_tick_interval: Duration::from_millis(DEFAULT_REBALANCE_TICK_MS),
            max_consecutive_heartbeat_failures: DEFAULT_MAX_CONSECUTIVE_HEARTBEAT_FAILURES,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            worker_drain_timeout: Duration::from_millis(DEFAULT_WORKER_DRAIN_TIMEOUT_MS),
        }
    }
}

impl ConsumerConfig {
    pub fn from_profile(profile: ConfigProfile) -> Self {
        match profile {
            ConfigProfile::Development => Self {
                heartbeat_interval: Duration::from_millis(250),
                rebalance_tick_interval: Duration::from_millis(100),
                poll_timeout: Duration::from_millis(50),
                worker_drain_timeout: Duration::from_secs(5),
                ..Self::default()
            },
            ConfigProfile::Production => Self::default(),
            ConfigProfile::LowLatency => Self {
                heartbeat_interval: Duration::from_millis(100),
                rebalance_tick_interval: Duration::from_millis(50),
                max_consecutive_heartbeat_failures: 2,
                poll_timeout: Duration::from_millis(20),
                worker_drain_timeout: Duration::from_secs(5),
                ..Self::default()
            },
        }
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.partition_count == 0 || self.partition_count > MAX_PARTITION_COUNT {
            errors.push(format!(
                "partition_count ({}) must be between 1 and {}",
                self.partition_count, MAX_PARTITION_COUNT
            ));
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than zero".to_string());
        }
        if self.rebalance_tick_interval.is_zero() {
            errors.push("rebalance_tick_interval must be greater than zero".to_string());
        }
        if self.max_consecutive_heartbeat_failures == 0 {
            errors.push("max_consecutive_heartbeat_failures must be at least 1".to_string());
        }
        if self.poll_timeout.is_zero() {
            errors.push("poll_timeout must be greater than zero".to_string());
        }
        if self.worker_drain_timeout < self.poll_timeout {
            errors.push(format!(
                "worker_drain_timeout ({:?}) must not be shorter than poll_timeout ({:?})",
                self.worker_drain_timeout, self.poll_timeout
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep the profile's value; malformed ones are errors.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let profile = match std::env::var("CONSUMER_PROFILE") {
            Ok(s) => s.parse::<ConfigProfile>()?,
            Err(_) => ConfigProfile::default(),
        };
        let mut config = Self::from_profile(profile);

        if let Ok(s) = std::env::var("PARTITION_COUNT") {
            config.partition_count = s
                .parse()
                .map_err(|e| format!("Invalid PARTITION_COUNT: {}", e))?;
        }
        if let Ok(s) = std::env::var("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(
                s.parse()
                    .map_err(|e| format!("Invalid HEARTBEAT_INTERVAL_MS: {}", e))?,
            );
        }
        if let Ok(s) = std::env::var("REBALANCE_TICK_MS") {
            config.rebalance_tick_interval = Duration::from_millis(
                s.parse()
                    .map_err(|e| format!("Invalid REBALANCE_TICK_MS: {}", e))?,
            );
        }
        if let Ok(s) = std::env::var("MAX_CONSECUTIVE_HEARTBEAT_FAILURES") {
            config.max_consecutive_heartbeat_failures = s
                .parse()
                .map_err(|e| format!("Invalid MAX_CONSECUTIVE_HEARTBEAT_FAILURES: {}", e))?;
        }
        if let Ok(s) = std::env::var("POLL_TIMEOUT_MS") {
            config.poll_timeout = Duration::from_millis(
                s.parse()
                    .map_err(|e| format!("Invalid POLL_TIMEOUT_MS: {}", e))?,
            );
        }
        if let Ok(s) = std::env::var("WORKER_DRAIN_TIMEOUT_MS") {
            config.worker_drain_timeout = Duration::from_millis(
                s.parse()
                    .map_err(|e| format!("Invalid WORKER_DRAIN_TIMEOUT_MS: {}", e))?,
            );
        }

        config.validate().map_err(|errors| errors.join("; "))?;
        Ok(config)
    }
}
