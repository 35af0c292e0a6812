//! Environment-driven configuration.
//!
//! All knobs have working defaults; a bare `capstand serve` runs a
//! single-node control plane.

use std::str::FromStr;
use std::time::Duration;

use capstan_engine::WorkerConfig;
use tracing::warn;

/// Runtime tuning read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker registry staleness threshold (`HEARTBEAT_TIMEOUT_SECONDS`).
    pub heartbeat_timeout: Duration,
    /// Work items claimed per cycle (`QUEUE_BATCH_SIZE`).
    pub batch_size: usize,
    /// Lease duration per claim (`QUEUE_LEASE_SECONDS`).
    pub lease: Duration,
    /// Idle delay between claim cycles (`QUEUE_POLL_INTERVAL`, seconds).
    pub poll_interval: Duration,
    /// Concurrent items per node (`QUEUE_MAX_CONCURRENCY`).
    pub max_concurrency: usize,
    /// Retry backoff cap (`QUEUE_MAX_RETRY_BACKOFF`, seconds).
    pub max_retry_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(parse_or(
                "HEARTBEAT_TIMEOUT_SECONDS",
                lookup("HEARTBEAT_TIMEOUT_SECONDS"),
                30,
            )),
            batch_size: parse_or("QUEUE_BATCH_SIZE", lookup("QUEUE_BATCH_SIZE"), 10),
            lease: Duration::from_secs(parse_or(
                "QUEUE_LEASE_SECONDS",
                lookup("QUEUE_LEASE_SECONDS"),
                60,
            )),
            poll_interval: Duration::from_secs(parse_or(
                "QUEUE_POLL_INTERVAL",
                lookup("QUEUE_POLL_INTERVAL"),
                1,
            )),
            max_concurrency: parse_or("QUEUE_MAX_CONCURRENCY", lookup("QUEUE_MAX_CONCURRENCY"), 4),
            max_retry_backoff: Duration::from_secs(parse_or(
                "QUEUE_MAX_RETRY_BACKOFF",
                lookup("QUEUE_MAX_RETRY_BACKOFF"),
                300,
            )),
        }
    }

    pub fn worker_config(&self, worker_id: String) -> WorkerConfig {
        WorkerConfig {
            worker_id,
            kinds: Vec::new(),
            batch_size: self.batch_size,
            lease: self.lease,
            poll_interval: self.poll_interval,
            max_concurrency: self.max_concurrency,
            max_retry_backoff: self.max_retry_backoff,
        }
    }
}

fn parse_or<T: FromStr + Copy>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "unparsable value; using default");
                default
            }
        },
        None => default,
    }
}
