//! Core records shared by every component: runs, schedules and clients.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::OrchestratorError;

/// Unique identifier of a backup run
pub type RunId = String;

/// Kind of backup a run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Every selected folder is captured
    Full,
    /// Only changes since the previous capture
    Incremental,
    /// Block-level image of the machine
    Image,
}

impl BackupType {
    /// Lowercase label used in logs, metrics and remote file names
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Image => "image",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "image" => Ok(BackupType::Image),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown backup type '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Admitted, not yet talking to the client
    Pending,
    /// Transfer in progress
    Running,
    /// Artifact captured
    Completed,
    /// Run ended with a fatal error
    Failed,
}

impl RunStatus {
    /// Completed and failed runs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `next` is a legal forward transition from `self`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system family of a client machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Windows,
    Linux,
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsType::Windows => f.write_str("windows"),
            OsType::Linux => f.write_str("linux"),
        }
    }
}

impl FromStr for OsType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "windows" | "win" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown os type '{}'",
                other
            ))),
        }
    }
}

/// On-disk shape of a captured artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Gzip-compressed tar archive
    TarGz,
    /// Plain directory tree mirrored from the client
    Directory,
    /// Block-level machine image
    DiskImage,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactFormat::TarGz => f.write_str("tar_gz"),
            ArtifactFormat::Directory => f.write_str("directory"),
            ArtifactFormat::DiskImage => f.write_str("disk_image"),
        }
    }
}

/// Who or what asked for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "principal", rename_all = "lowercase")]
pub enum Trigger {
    /// Fired by the named schedule
    Schedule(String),
    /// Requested by a user
    Manual(String),
}

impl Trigger {
    /// Metric label for the trigger kind
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Schedule(_) => "schedule",
            Trigger::Manual(_) => "manual",
        }
    }

    pub fn principal(&self) -> &str {
        match self {
            Trigger::Schedule(name) | Trigger::Manual(name) => name,
        }
    }
}

/// One execution of a backup job against one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: RunId,
    pub client_name: String,
    pub backup_type: BackupType,
    pub status: RunStatus,
    pub os_type: Option<OsType>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_format: Option<ArtifactFormat>,
    /// Recorded artifact size in MiB
    pub size_mb: f64,
    /// Number of files making up the artifact (1 for a single archive)
    pub file_count: u64,
    /// Number of items captured from the client
    pub source_file_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub trigger: Trigger,
    pub schedule_name: Option<String>,
    pub error: Option<String>,
    /// Whatever the remote side reported before a failure
    pub partial_results: Option<serde_json::Value>,
}

impl BackupRun {
    /// Create a pending run with a fresh identifier
    pub fn new(client_name: impl Into<String>, backup_type: BackupType, trigger: Trigger) -> Self {
        let schedule_name = match &trigger {
            Trigger::Schedule(name) => Some(name.clone()),
            Trigger::Manual(_) => None,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            backup_type,
            status: RunStatus::Pending,
            os_type: None,
            artifact_path: None,
            artifact_format: None,
            size_mb: 0.0,
            file_count: 0,
            source_file_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            trigger,
            schedule_name,
            error: None,
            partial_results: None,
        }
    }

    /// Verification and restore are only allowed on completed runs that left an artifact
    pub fn has_usable_artifact(&self) -> bool {
        self.status == RunStatus::Completed && self.artifact_path.is_some()
    }
}

/// A named, cron-triggered recurring job template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub cron_expression: String,
    pub backup_type: BackupType,
    /// Empty means every active client
    #[serde(default)]
    pub client_names: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Login material for a client; the secret never shows up in debug output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A machine in the protected fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub os_type: OsType,
    pub credentials: Credentials,
    /// Folders to capture; empty means the OS defaults
    #[serde(default)]
    pub folders: Vec<String>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn test_backup_type_parsing() {
        assert_eq!("Full".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!("image".parse::<BackupType>().unwrap(), BackupType::Image);
        assert!("differential".parse::<BackupType>().is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("svc-backup", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("svc-backup"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_new_run_ids_are_unique() {
        let a = BackupRun::new("alpha", BackupType::Full, Trigger::Manual("admin".into()));
        let b = BackupRun::new("alpha", BackupType::Full, Trigger::Manual("admin".into()));
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, RunStatus::Pending);
        assert!(!a.has_usable_artifact());
    }
}
