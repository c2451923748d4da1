//! Orchestrator configuration loaded from TOML

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorSettings;
use crate::observability::LoggingSettings;
use crate::restore::RestoreEngine;
use crate::retry::RetryPolicy;
use crate::{OrchestratorError, Result};

/// Schedules are evaluated per minute; a longer tick would step over due minutes
pub const MAX_TICK_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency ceiling; the settings store may override it at runtime
    pub max_parallel_backups: usize,
    /// Scheduler wake-up interval, 1 to 60 seconds so no cron minute is skipped
    pub tick_interval_secs: u64,
    /// Per-run deadline, 0 disables it
    pub run_deadline_secs: u64,
    pub artifact_root: PathBuf,
    pub connection_retry: RetrySettings,
    pub backup_retry: RetrySettings,
    pub restore: RestoreSettings,
    pub logging: LoggingSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_backups: num_cpus::get(),
            tick_interval_secs: 30,
            run_deadline_secs: 6 * 60 * 60,
            artifact_root: PathBuf::from("./backups"),
            connection_retry: RetrySettings::default(),
            backup_retry: RetrySettings::default(),
            restore: RestoreSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Numeric overrides applied on top of a retry preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

impl RetrySettings {
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(retries) = self.max_retries {
            policy = policy.with_max_retries(retries);
        }
        if let Some(ms) = self.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy = policy.with_backoff_multiplier(multiplier);
        }
        if let Some(jitter) = self.jitter {
            policy = policy.with_jitter(jitter);
        }
        policy
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// External `tar` binary
    #[default]
    System,
    /// In-process tar/gzip
    Bundled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub extractor: ExtractorKind,
    pub tar_program: String,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            extractor: ExtractorKind::System,
            tar_program: "tar".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OrchestratorConfig = toml::from_str(content)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_backups == 0 {
            return Err(OrchestratorError::Configuration(
                "max_parallel_backups must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_TICK_INTERVAL_SECS).contains(&self.tick_interval_secs) {
            return Err(OrchestratorError::Configuration(format!(
                "tick_interval_secs must be between 1 and {}",
                MAX_TICK_INTERVAL_SECS
            )));
        }
        if self.restore.tar_program.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "restore.tar_program must not be empty".to_string(),
            ));
        }
        for (name, settings) in [("connection_retry", &self.connection_retry), ("backup_retry", &self.backup_retry)] {
            if let Some(multiplier) = settings.backoff_multiplier {
                if multiplier.is_nan() || multiplier < 1.0 {
                    return Err(OrchestratorError::Configuration(format!(
                        "{}.backoff_multiplier must be >= 1.0",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        (self.run_deadline_secs > 0).then(|| Duration::from_secs(self.run_deadline_secs))
    }

    pub fn connection_policy(&self) -> RetryPolicy {
        self.connection_retry.apply(RetryPolicy::connection())
    }

    pub fn backup_policy(&self) -> RetryPolicy {
        self.backup_retry.apply(RetryPolicy::whole_backup())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            run_deadline: self.run_deadline(),
            artifact_root: self.artifact_root.clone(),
            backup_policy: self.backup_policy(),
        }
    }

    pub fn restore_engine(&self) -> RestoreEngine {
        match self.restore.extractor {
            ExtractorKind::System => RestoreEngine::system_tar(self.restore.tar_program.clone()),
            ExtractorKind::Bundled => RestoreEngine::bundled(),
        }
    }
}
