//! Integration tests for ConsumerConfig::from_env()
//!
//! Environment variables are process-global, so every test runs serially and
//! restores the variables it touched.

use std::env;
use std::time::Duration;

use partition_groups::{ConfigProfile, ConsumerConfig};
use serial_test::serial;

/// All environment variables read by ConsumerConfig::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "CONSUMER_PROFILE",
    "PARTITION_COUNT",
    "HEARTBEAT_INTERVAL_MS",
    "REBALANCE_TICK_MS",
    "MAX_CONSECUTIVE_HEARTBEAT_FAILURES",
    "POLL_TIMEOUT_MS",
    "WORKER_DRAIN_TIMEOUT_MS",
];

/// Run `f` with exactly `vars` set among the config variables.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

#[test]
#[serial]
fn test_from_env_defaults_to_production() {
    with_env_vars(&[], || {
        let config = ConsumerConfig::from_env().expect("Should parse config");
        assert_eq!(config, ConsumerConfig::from_profile(ConfigProfile::Production));
    });
}

#[test]
#[serial]
fn test_from_env_profile_then_overrides() {
    with_env_vars(
        &[
            ("CONSUMER_PROFILE", "low-latency"),
            ("PARTITION_COUNT", "12"),
            ("POLL_TIMEOUT_MS", "35"),
        ],
        || {
            let config = ConsumerConfig::from_env().expect("Should parse config");
            let base = ConsumerConfig::from_profile(ConfigProfile::LowLatency);
            assert_eq!(config.partition_count, 12);
            assert_eq!(config.poll_timeout, Duration::from_millis(35));
            assert_eq!(config.heartbeat_interval, base.heartbeat_interval);
            assert_eq!(
                config.max_consecutive_heartbeat_failures,
                base.max_consecutive_heartbeat_failures
            );
        },
    );
}

#[test]
#[serial]
fn test_from_env_all_timings() {
    with_env_vars(
        &[
            ("HEARTBEAT_INTERVAL_MS", "1000"),
            ("REBALANCE_TICK_MS", "400"),
            ("MAX_CONSECUTIVE_HEARTBEAT_FAILURES", "5"),
            ("WORKER_DRAIN_TIMEOUT_MS", "15000"),
        ],
        || {
            let config = ConsumerConfig::from_env().expect("Should parse config");
            assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
            assert_eq!(config.rebalance_tick_interval, Duration::from_millis(400));
            assert_eq!(config.max_consecutive_heartbeat_failures, 5);
            assert_eq!(config.worker_drain_timeout, Duration::from_secs(15));
        },
    );
}

#[test]
#[serial]
fn test_from_env_rejects_malformed_number() {
    with_env_vars(&[("PARTITION_COUNT", "many")], || {
        let err = ConsumerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PARTITION_COUNT"));
    });
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_profile() {
    with_env_vars(&[("CONSUMER_PROFILE", "turbo")], || {
        let err = ConsumerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("turbo"));
    });
}

#[test]
#[serial]
fn test_from_env_validates_result() {
    with_env_vars(&[("PARTITION_COUNT", "0")], || {
        let err = ConsumerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("partition_count"));
    });
}
