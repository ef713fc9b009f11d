//! Coordinator configuration loaded from environment variables.

use std::time::Duration;

use outbox::RelayConfig;
use participant::BreakerConfig;
use saga_core::RetryPolicy;

/// Coordinator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `COORDINATOR_LEASE_TTL_SECS` — saga lease duration (default: `30`)
/// - `COORDINATOR_HEARTBEAT_SECS` — lease renewal cadence during long calls (default: `10`)
/// - `COORDINATOR_RECOVERY_SCAN_SECS` — recovery scan interval (default: `30`)
/// - `ADAPTER_RETRY_BASE_MS` — first backoff delay (default: `50`)
/// - `ADAPTER_RETRY_FACTOR` — backoff multiplier (default: `2`)
/// - `ADAPTER_RETRY_CAP_MS` — backoff ceiling (default: `2000`)
/// - `ADAPTER_RETRY_MAX_ATTEMPTS` — attempts per step (default: `4`)
/// - `ADAPTER_BREAKER_FAILURE_RATE` — failure rate opening the circuit (default: `0.5`)
/// - `ADAPTER_BREAKER_MIN_SAMPLES` — samples before the rate applies (default: `10`)
/// - `ADAPTER_BREAKER_OPEN_SECS` — open duration before a probe (default: `30`)
/// - `ADAPTER_BULKHEAD_MAX_CONCURRENT` — in-flight calls per participant (default: `16`)
/// - `OUTBOX_POLL_INTERVAL_MS` — relay poll cadence (default: `1000`)
/// - `OUTBOX_BATCH_SIZE` — rows per relay tick (default: `100`)
/// - `OUTBOX_DEAD_ATTEMPTS` — publish attempts before DEAD (default: `50`)
#[derive(Debug, Clone)]
pub struct Config {
    pub lease_ttl: Duration,
    pub heartbeat: Duration,
    pub recovery_scan_interval: Duration,
    /// Default retry schedule for step definitions that do not override it.
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub bulkhead_max_concurrent: usize,
    pub relay: RelayConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            lease_ttl: Duration::from_secs(env_parse("COORDINATOR_LEASE_TTL_SECS", 30)),
            heartbeat: Duration::from_secs(env_parse("COORDINATOR_HEARTBEAT_SECS", 10)),
            recovery_scan_interval: Duration::from_secs(env_parse(
                "COORDINATOR_RECOVERY_SCAN_SECS",
                30,
            )),
            retry: RetryPolicy {
                base_ms: env_parse("ADAPTER_RETRY_BASE_MS", 50),
                factor: env_parse("ADAPTER_RETRY_FACTOR", 2),
                cap_ms: env_parse("ADAPTER_RETRY_CAP_MS", 2_000),
                max_attempts: env_parse("ADAPTER_RETRY_MAX_ATTEMPTS", 4),
            },
            breaker: BreakerConfig {
                failure_rate: env_parse("ADAPTER_BREAKER_FAILURE_RATE", 0.5),
                min_samples: env_parse("ADAPTER_BREAKER_MIN_SAMPLES", 10),
                open_duration: Duration::from_secs(env_parse("ADAPTER_BREAKER_OPEN_SECS", 30)),
                window: 32,
            },
            bulkhead_max_concurrent: env_parse("ADAPTER_BULKHEAD_MAX_CONCURRENT", 16),
            relay: RelayConfig {
                poll_interval: Duration::from_millis(env_parse("OUTBOX_POLL_INTERVAL_MS", 1_000)),
                batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
                dead_attempts: env_parse("OUTBOX_DEAD_ATTEMPTS", 50),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            heartbeat: Duration::from_secs(10),
            recovery_scan_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            bulkhead_max_concurrent: 16,
            relay: RelayConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
