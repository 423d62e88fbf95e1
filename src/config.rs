//! Engine configuration.
//!
//! Loaded from environment variables with defaults suited to a single instance.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Whether the cache accelerator sits in front of the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuanceMode {
    /// Duplicate guard and stock accelerator filter requests before publishing.
    #[default]
    Cached,
    /// Every request reaches the repository; the conditional update and the
    /// unique constraint alone enforce the invariants.
    DatabaseOnly,
}

impl FromStr for IssuanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(IssuanceMode::Cached),
            "database-only" => Ok(IssuanceMode::DatabaseOnly),
            other => Err(format!("unknown issuance mode '{other}'")),
        }
    }
}

/// Concurrency control used by the authoritative write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyControl {
    /// `issued_quantity < total_quantity` in the update is the only check.
    #[default]
    RowCount,
    /// The update also compares the coupon version read just before it.
    Versioned,
}

impl FromStr for ConcurrencyControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "row-count" => Ok(ConcurrencyControl::RowCount),
            "versioned" => Ok(ConcurrencyControl::Versioned),
            other => Err(format!("unknown concurrency control '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: IssuanceMode,
    /// Consumer tasks pulling from the issuance queue.
    pub worker_count: usize,
    /// Events pulled per consumer batch.
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// Outcomes buffered per broadcast subscriber before it lags.
    pub outcome_capacity: usize,
    pub duplicate_ttl: Duration,
    /// Used by `issue_and_wait`.
    pub wait_timeout: Duration,
    pub reconcile_interval: Duration,
    pub concurrency: ConcurrencyControl,
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: IssuanceMode::Cached,
            worker_count: 5,
            batch_size: 32,
            queue_capacity: 1024,
            outcome_capacity: 4096,
            duplicate_ttl: Duration::from_secs(86_400),
            wait_timeout: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(5),
            concurrency: ConcurrencyControl::RowCount,
            max_conflict_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `COUPON_*` environment variables.
    ///
    /// Missing variables take the default; invalid ones are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mode: var("COUPON_ISSUANCE_MODE").unwrap_or(defaults.mode),
            worker_count: var("COUPON_WORKER_COUNT")
                .unwrap_or(defaults.worker_count)
                .max(1),
            batch_size: var("COUPON_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .max(1),
            queue_capacity: var("COUPON_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity)
                .max(1),
            outcome_capacity: var("COUPON_OUTCOME_CAPACITY")
                .unwrap_or(defaults.outcome_capacity)
                .max(1),
            duplicate_ttl: var("COUPON_DUPLICATE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.duplicate_ttl),
            wait_timeout: var("COUPON_WAIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_timeout),
            reconcile_interval: var("COUPON_RECONCILE_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
            concurrency: var("COUPON_CONCURRENCY").unwrap_or(defaults.concurrency),
            max_conflict_retries: var("COUPON_MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
        }
    }
}

fn var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(name, value = %raw, reason = %e, "ignoring invalid configuration value");
            None
        }
    }
}
