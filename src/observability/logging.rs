//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; the embedding binary calls
//! [`init_tracing`] once. `RUST_LOG` always wins over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `info` or `fleet_backup=debug`
    pub level: String,
    /// Compact single-line output without timestamps
    pub compact: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            compact: false,
        }
    }
}

/// Install the global subscriber. Returns false if one was already installed.
pub fn init_tracing(settings: &LoggingSettings) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.compact {
        fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .without_time()
            .compact()
            .try_init()
            .is_ok()
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_names(true)
            .try_init()
            .is_ok()
    }
}
