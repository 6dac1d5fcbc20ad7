//! Tracing and logging (shared setup).

pub mod logging;

pub use logging::{LogConfig, LogConfigError, LogFormat, init_test, init_with};

/// Initialize process-wide logging from the environment.
///
/// Falls back to JSON at `info` when the environment is unset or invalid.
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let config = LogConfig::from_env().unwrap_or_default();
    if init_with(&config).is_err() {
        let _ = init_with(&LogConfig::default());
    }
}
