//! Engine configuration.
//!
//! Every section has defaults and can be overridden from `FORGEBATCH_*`
//! environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

pub const ENV_WORKERS: &str = "FORGEBATCH_WORKERS";
pub const ENV_JOB_TIMEOUT_SECS: &str = "FORGEBATCH_JOB_TIMEOUT_SECS";
pub const ENV_PROGRESS_EVERY: &str = "FORGEBATCH_PROGRESS_EVERY";
pub const ENV_SCHEDULER_TICK_SECS: &str = "FORGEBATCH_SCHEDULER_TICK_SECS";
pub const ENV_RETRY_PRESET: &str = "FORGEBATCH_RETRY_PRESET";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown retry preset: {0}")]
    UnknownRetryPreset(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent executors; the intake queue holds twice as many jobs.
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

impl PoolConfig {
    pub fn queue_capacity(&self) -> usize {
        self.workers.saturating_mul(2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for one job run.
    pub job_timeout: Duration,
    /// Persist the job after this many items (and always after the last).
    pub progress_persist_interval: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30 * 60),
            progress_persist_interval: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator.job_timeout = timeout;
        self
    }

    pub fn with_progress_persist_interval(mut self, every: usize) -> Self {
        self.orchestrator.progress_persist_interval = every;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.scheduler.tick_interval = tick;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_WORKERS) {
            config.pool.workers = parse_number(ENV_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_JOB_TIMEOUT_SECS) {
            config.orchestrator.job_timeout = Duration::from_secs(parse_number(ENV_JOB_TIMEOUT_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_PROGRESS_EVERY) {
            config.orchestrator.progress_persist_interval = parse_number(ENV_PROGRESS_EVERY, &v)?;
        }
        if let Some(v) = lookup(ENV_SCHEDULER_TICK_SECS) {
            config.scheduler.tick_interval = Duration::from_secs(parse_number(ENV_SCHEDULER_TICK_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_RETRY_PRESET) {
            config.retry = RetryPolicy::preset(&v).ok_or(ConfigError::UnknownRetryPreset(v))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.orchestrator.job_timeout.is_zero() {
            return Err(ConfigError::Invalid("job_timeout must be positive".into()));
        }
        if self.orchestrator.progress_persist_interval == 0 {
            return Err(ConfigError::Invalid(
                "progress_persist_interval must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be positive".into()));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid("backoff_multiplier must be >= 1".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid("max_delay must be >= base_delay".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::Invalid("jitter_fraction must be within [0, 1]".into()));
        }
        Ok(())
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
