//! Configuration loading and representation.
//!
//! Every setting has a default; environment variables override them.

use std::str::FromStr;
use std::time::Duration;

use crate::batch::ProcessorConfig;
use crate::pool::PoolConfig;

/// Number of worker threads in the shared pool.
pub const WORKERS_ENV: &str = "BATCHFLOW_WORKERS";
/// Per-unit artificial latency, in milliseconds.
pub const SIMULATED_LATENCY_ENV: &str = "BATCHFLOW_SIMULATED_LATENCY_MS";
/// Number of demo records the service seeds its in-memory store with.
pub const SEED_RECORDS_ENV: &str = "BATCHFLOW_SEED_RECORDS";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct BatchflowConfig {
    pub pool: PoolConfig,
    pub processor: ProcessorConfig,
    pub seed_records: usize,
}

impl Default for BatchflowConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            processor: ProcessorConfig::default(),
            seed_records: 25,
        }
    }
}

impl BatchflowConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (unset keys keep their defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse::<usize>(&lookup, WORKERS_ENV)? {
            if workers == 0 {
                return Err(ConfigError::Invalid {
                    key: WORKERS_ENV,
                    value: workers.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.pool.size = workers;
        }

        if let Some(ms) = parse::<u64>(&lookup, SIMULATED_LATENCY_ENV)? {
            config.processor.simulated_latency = Duration::from_millis(ms);
        }

        if let Some(seed) = parse::<usize>(&lookup, SEED_RECORDS_ENV)? {
            config.seed_records = seed;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
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
