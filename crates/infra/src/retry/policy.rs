//! Retry policies and backoff computation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the jitter component of a delay is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Add exactly `delay * jitter_fraction`.
    #[default]
    Fixed,
    /// Add a value drawn uniformly from `[0, delay * jitter_fraction]`.
    Uniform,
}

/// Retry policy configuration.
///
/// `delay = min(base_delay * backoff_multiplier^retry_count, max_delay)`, plus
/// jitter when enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed before a task is terminally failed (0 = no retries).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    pub jitter_fraction: f64,
    pub jitter_strategy: JitterStrategy,
    /// Case-insensitive substrings; an error is retryable if it contains any.
    pub retryable_errors: Vec<String>,
}

fn default_retryable_errors() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "connection",
        "temporarily unavailable",
        "unavailable",
        "rate limit",
        "too many requests",
        "deadline exceeded",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_fraction: 0.1,
            jitter_strategy: JitterStrategy::Fixed,
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Few attempts, long pauses.
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Many quick attempts with gentle growth.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            ..Default::default()
        }
    }

    /// Tuned for flaky upstream services (gateways, rate limiters).
    pub fn external_dependency() -> Self {
        let mut retryable_errors = default_retryable_errors();
        retryable_errors.extend(
            ["502", "503", "504", "429", "bad gateway", "service unavailable"]
                .iter()
                .map(|s| s.to_string()),
        );

        Self {
            max_retries: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 3.0,
            retryable_errors,
            ..Default::default()
        }
    }

    /// Look up a named preset (`default`, `conservative`, `aggressive`,
    /// `external_dependency`, `none`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Some(Self::default()),
            "conservative" => Some(Self::conservative()),
            "aggressive" => Some(Self::aggressive()),
            "external_dependency" | "external" => Some(Self::external_dependency()),
            "none" | "no_retry" => Some(Self::no_retry()),
            _ => None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, fraction: f64, strategy: JitterStrategy) -> Self {
        self.jitter_enabled = fraction > 0.0;
        self.jitter_fraction = fraction;
        self.jitter_strategy = strategy;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    pub fn with_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Whether `error` contains one of the configured substrings.
    pub fn is_retryable_error(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|needle| !needle.is_empty() && error.contains(&needle.to_lowercase()))
    }

    /// Exponential delay for `retry_count`, capped at `max_delay`, before jitter.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;
        let exp = self
            .backoff_multiplier
            .powi(retry_count.min(i32::MAX as u32) as i32);

        let raw = base * exp;
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_nanos(capped.max(0.0).round() as u64)
    }

    /// Full delay for `retry_count`, jitter included.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.delay_with_rng(retry_count, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_for(retry_count);
        if !self.jitter_enabled || self.jitter_fraction <= 0.0 {
            return delay;
        }

        let span = delay.as_nanos() as f64 * self.jitter_fraction;
        let jitter = match self.jitter_strategy {
            JitterStrategy::Fixed => span,
            JitterStrategy::Uniform => rng.gen_range(0.0..=span),
        };
        delay + Duration::from_nanos(jitter.round() as u64)
    }
}
