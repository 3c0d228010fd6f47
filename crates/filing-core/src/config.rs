use std::time::Duration;

use clap::Args;
use serde::Deserialize;

const DEFAULT_MAX_ATTEMPTS: u32 = 6;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_JITTER_MS: u64 = 50;
const DEFAULT_UPDATE_ATTEMPTS: u32 = 10;
const DEFAULT_LOCK_PREFIX: &str = "locks/";
const DEFAULT_WAIT_PERIOD_MS: u64 = 250;
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Backoff settings for backend calls.
///
/// Can be flattened into an application's clap parser or deserialized from a config file.
#[derive(Args, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per backend call, first try included
    #[arg(long = "retry-max-attempts", default_value_t = DEFAULT_MAX_ATTEMPTS, env = "FILING_RETRY_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled on each further retry
    #[arg(long = "retry-base-delay-ms", default_value_t = DEFAULT_BASE_DELAY_MS, env = "FILING_RETRY_BASE_DELAY_MS")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay
    #[arg(long = "retry-max-delay-ms", default_value_t = DEFAULT_MAX_DELAY_MS, env = "FILING_RETRY_MAX_DELAY_MS")]
    pub max_delay_ms: u64,

    /// Maximum random jitter added to each delay
    #[arg(long = "retry-jitter-ms", default_value_t = DEFAULT_JITTER_MS, env = "FILING_RETRY_JITTER_MS")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

/// Record store settings.
#[derive(Args, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[command(flatten)]
    pub retry: RetryConfig,

    /// Read-modify-write attempts before `update` gives up with ConcurrentModification
    #[arg(long = "update-attempts", default_value_t = DEFAULT_UPDATE_ATTEMPTS, env = "FILING_UPDATE_ATTEMPTS")]
    pub update_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
    }
}

/// Lock coordinator settings.
#[derive(Args, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Key prefix under which lock records are stored
    #[arg(long = "lock-prefix", default_value = DEFAULT_LOCK_PREFIX, env = "FILING_LOCK_PREFIX")]
    pub lock_prefix: String,

    /// Polling interval of `acquire_wait`
    #[arg(long = "lock-wait-period-ms", default_value_t = DEFAULT_WAIT_PERIOD_MS, env = "FILING_LOCK_WAIT_PERIOD_MS")]
    pub wait_period_ms: u64,

    /// Give-up time of `acquire_wait`
    #[arg(long = "lock-wait-timeout-ms", default_value_t = DEFAULT_WAIT_TIMEOUT_MS, env = "FILING_LOCK_WAIT_TIMEOUT_MS")]
    pub wait_timeout_ms: u64,
}

impl LockConfig {
    pub fn wait_period(&self) -> Duration {
        Duration::from_millis(self.wait_period_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            wait_period_ms: DEFAULT_WAIT_PERIOD_MS,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}
