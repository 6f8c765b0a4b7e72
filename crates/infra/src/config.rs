//! Configuration loading and representation.
//!
//! Everything has a default; environment variables override individual values.
//! A value that is present but unparsable is an error rather than a silent
//! fallback.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::PollBackoff;

pub const ENV_MAINTENANCE_INTERVAL_MS: &str = "BATCHFLOW_MAINTENANCE_INTERVAL_MS";
pub const ENV_DISPATCH_BATCH_SIZE: &str = "BATCHFLOW_DISPATCH_BATCH_SIZE";
pub const ENV_POLL_MAX_ATTEMPTS: &str = "BATCHFLOW_POLL_MAX_ATTEMPTS";
pub const ENV_POLL_BASE_DELAY_MS: &str = "BATCHFLOW_POLL_BASE_DELAY_MS";
pub const ENV_POLL_MAX_DELAY_MS: &str = "BATCHFLOW_POLL_MAX_DELAY_MS";
pub const ENV_WORKER_THREADS: &str = "BATCHFLOW_WORKER_THREADS";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Maintenance runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    /// Time between maintenance passes
    pub interval: Duration,
    /// Maximum READY chunks dispatched per instance per pass
    pub dispatch_batch_size: usize,
    /// Name for logging (also the thread name)
    pub name: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            dispatch_batch_size: 100,
            name: "batch-maintenance".to_string(),
        }
    }
}

impl MaintenanceConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_dispatch_batch_size(mut self, size: usize) -> Self {
        self.dispatch_batch_size = size.max(1);
        self
    }
}

/// Chunk worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name for logging; threads are named `{name}-{index}`
    pub name: String,
    /// Number of worker threads, each with its own subscription
    pub threads: usize,
    /// How long a worker waits for a notification before re-checking shutdown
    pub recv_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "chunk-worker".to_string(),
            threads: 2,
            recv_timeout: Duration::from_millis(250),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchConfig {
    pub maintenance: MaintenanceConfig,
    pub worker: WorkerConfig,
    pub poll_backoff: PollBackoff,
    /// Postgres connection string; in-memory storage when absent
    pub database_url: Option<String>,
    /// Redis connection string for the pub/sub notifier
    pub redis_url: Option<String>,
}

impl BatchConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, ENV_MAINTENANCE_INTERVAL_MS)? {
            config.maintenance.interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse::<usize, _>(&lookup, ENV_DISPATCH_BATCH_SIZE)? {
            config.maintenance.dispatch_batch_size = positive(ENV_DISPATCH_BATCH_SIZE, size)?;
        }
        if let Some(threads) = parse::<usize, _>(&lookup, ENV_WORKER_THREADS)? {
            config.worker.threads = positive(ENV_WORKER_THREADS, threads)?;
        }
        if let Some(attempts) = parse::<u32, _>(&lookup, ENV_POLL_MAX_ATTEMPTS)? {
            config.poll_backoff.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_POLL_BASE_DELAY_MS)? {
            config.poll_backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_POLL_MAX_DELAY_MS)? {
            config.poll_backoff.max_delay = Duration::from_millis(ms);
        }
        if config.poll_backoff.max_delay < config.poll_backoff.base_delay {
            return Err(ConfigError::Invalid {
                key: ENV_POLL_MAX_DELAY_MS,
                value: config.poll_backoff.max_delay.as_millis().to_string(),
                reason: "must not be smaller than the base delay".to_string(),
            });
        }

        config.database_url = lookup(ENV_DATABASE_URL).filter(|s| !s.trim().is_empty());
        config.redis_url = lookup(ENV_REDIS_URL).filter(|s| !s.trim().is_empty());

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = BatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BatchConfig::default());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BatchConfig::from_lookup(lookup(&[
            (ENV_MAINTENANCE_INTERVAL_MS, "250"),
            (ENV_DISPATCH_BATCH_SIZE, "10"),
            (ENV_POLL_MAX_ATTEMPTS, "3"),
            (ENV_POLL_BASE_DELAY_MS, "100"),
            (ENV_POLL_MAX_DELAY_MS, "1000"),
            (ENV_WORKER_THREADS, "8"),
            (ENV_DATABASE_URL, "postgres://localhost/batch"),
        ]))
        .unwrap();

        assert_eq!(config.maintenance.interval, Duration::from_millis(250));
        assert_eq!(config.maintenance.dispatch_batch_size, 10);
        assert_eq!(config.poll_backoff.max_attempts, 3);
        assert_eq!(config.poll_backoff.base_delay, Duration::from_millis(100));
        assert_eq!(config.worker.threads, 8);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/batch"));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = BatchConfig::from_lookup(lookup(&[(ENV_DISPATCH_BATCH_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_DISPATCH_BATCH_SIZE, .. }));

        let err = BatchConfig::from_lookup(lookup(&[(ENV_WORKER_THREADS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_WORKER_THREADS, .. }));

        let err = BatchConfig::from_lookup(lookup(&[
            (ENV_POLL_BASE_DELAY_MS, "5000"),
            (ENV_POLL_MAX_DELAY_MS, "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_POLL_MAX_DELAY_MS, .. }));
    }
}
