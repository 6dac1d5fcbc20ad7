//! Tracing subscriber configuration.
//!
//! `RUST_LOG` wins over the configured level when set.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "FORGEBATCH_LOG_FORMAT";
pub const ENV_LOG_LEVEL: &str = "FORGEBATCH_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogConfigError {
    #[error("unknown log format `{0}` (expected `json` or `text`)")]
    UnknownFormat(String),
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable lines.
    Text,
}

impl FromStr for LogFormat {
    type Err = LogConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "plain" => Ok(Self::Text),
            other => Err(LogConfigError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `info` or `forgebatch_infra=debug,warn`.
    pub level: String,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            with_target: false,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Result<Self, LogConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, LogConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            config.format = format.parse()?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            config.level = level.trim().to_string();
        }
        config.filter()?;
        Ok(config)
    }

    /// The filter this config installs when `RUST_LOG` is unset.
    pub fn filter(&self) -> Result<EnvFilter, LogConfigError> {
        EnvFilter::try_new(&self.level).map_err(|e| LogConfigError::InvalidFilter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install a global subscriber built from `config`.
///
/// Returns `Ok` if a subscriber was already installed.
pub fn init_with(config: &LogConfig) -> Result<(), LogConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.filter()?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    Ok(())
}

/// Subscriber for tests: output captured per test, `RUST_LOG` or `warn`.
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_to_json_info() {
        let config = LogConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn reads_format_and_level() {
        let config = LogConfig::from_lookup(lookup(&[
            (ENV_LOG_FORMAT, "Text"),
            (ENV_LOG_LEVEL, "forgebatch_infra=debug,warn"),
        ]))
        .unwrap();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "forgebatch_infra=debug,warn");
    }

    #[test]
    fn rejects_unknown_format() {
        let err = LogConfig::from_lookup(lookup(&[(ENV_LOG_FORMAT, "xml")])).unwrap_err();
        assert_eq!(err, LogConfigError::UnknownFormat("xml".into()));
    }

    #[test]
    fn rejects_bad_filter() {
        let err = LogConfig::from_lookup(lookup(&[(ENV_LOG_LEVEL, "forgebatch=loud")])).unwrap_err();
        assert!(matches!(err, LogConfigError::InvalidFilter { .. }));
    }

    #[test]
    fn init_is_idempotent() {
        init_with(&LogConfig::default()).unwrap();
        init_with(&LogConfig::default()).unwrap();
        crate::init();
    }
}
