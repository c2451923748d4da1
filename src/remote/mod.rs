//! Remote target capability
//!
//! A [`RemoteTarget`] drives one backup against one client machine. There are
//! exactly two implementations, [`LinuxTarget`] and [`WindowsTarget`], picked
//! once per client by [`target_for`]. Both talk to the machine through an
//! opaque [`Transport`]; every network-facing call goes through the
//! connection retry preset.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ArtifactFormat, BackupType, Credentials, OsType, RunId};
use crate::retry::{Classify, ErrorCode, RetryPolicy};

pub mod linux;
mod session;
pub mod windows;

pub use linux::LinuxTarget;
pub use session::SessionHandle;
pub use windows::WindowsTarget;

/// Failure talking to a remote machine. Displays as the bare message so the
/// text recorded on a failed run is exactly what the remote side reported.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RemoteError {
    pub code: Option<ErrorCode>,
    pub message: String,
    /// Anything the remote side produced before failing
    pub partial: Option<serde_json::Value>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            partial: None,
        }
    }

    /// Error without a machine-readable code; classified by message only
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            partial: None,
        }
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "remote session is not connected")
    }

    pub fn with_partial(mut self, partial: serde_json::Value) -> Self {
        self.partial = Some(partial);
        self
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        Self {
            code: err.error_code(),
            message: err.to_string(),
            partial: None,
        }
    }
}

impl Classify for RemoteError {
    fn error_code(&self) -> Option<ErrorCode> {
        self.code
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open session on a remote machine
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command and collect its output
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Copy a remote file or directory tree to `local_path`, returning bytes written
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, RemoteError>;

    /// Close the session
    async fn close(&self) -> Result<(), RemoteError>;
}

/// Opaque remote-execution capability (SSH, WinRM, an agent, ...)
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        os_type: OsType,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}

/// Facts reported by a connected machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_type: OsType,
    pub os_version: String,
    pub architecture: String,
}

/// What a single backup should capture and where the artifact lands locally
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub run_id: RunId,
    pub client_name: String,
    pub backup_type: BackupType,
    pub folders: Vec<String>,
    /// Local directory that receives the artifact
    pub destination: PathBuf,
}

/// Outcome of a successful transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub artifact_path: PathBuf,
    pub format: ArtifactFormat,
    /// Bytes that landed locally
    pub bytes_transferred: u64,
    /// Files making up the artifact
    pub artifact_files: u64,
    /// Items captured from the client
    pub source_files: u64,
    pub duration: Duration,
    /// Non-fatal remarks from the remote tooling
    pub warnings: Vec<String>,
}

/// Connect/execute/disconnect contract for one client machine
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    fn os_type(&self) -> OsType;

    /// Folders captured when the client does not list any
    fn default_folders(&self) -> Vec<String>;

    async fn connect(&mut self, host: &str, port: u16, credentials: &Credentials) -> Result<(), RemoteError>;

    async fn get_system_info(&self) -> Result<SystemInfo, RemoteError>;

    async fn run_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError>;

    /// Whether a failed `run_backup` of this type may be started again.
    ///
    /// Captures that advance change-tracking state on the client cannot.
    fn capture_is_repeatable(&self, _backup_type: BackupType) -> bool {
        true
    }

    /// Best-effort removal of anything an interrupted `run_backup` left on the client
    async fn discard_staging(&self, request: &BackupRequest);

    async fn disconnect(&mut self) -> Result<(), RemoteError>;
}

/// Build the target implementation for an OS family
pub fn target_for(os_type: OsType, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Box<dyn RemoteTarget> {
    let session = SessionHandle::new(transport, os_type, policy);
    match os_type {
        OsType::Linux => Box::new(LinuxTarget::new(session)),
        OsType::Windows => Box::new(WindowsTarget::new(session)),
    }
}

/// Quote a value for a POSIX shell
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a value for cmd/PowerShell double-quoted arguments
pub(crate) fn win_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_verbatim() {
        let err = RemoteError::new(ErrorCode::ConnectionRefused, "connect ECONNREFUSED 10.0.0.5:22");
        assert_eq!(err.to_string(), "connect ECONNREFUSED 10.0.0.5:22");
    }

    #[test]
    fn test_io_error_conversion_keeps_code() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out");
        let err = RemoteError::from(io_err);
        assert_eq!(err.code, Some(ErrorCode::TimedOut));
        assert!(RetryPolicy::connection().is_retryable(&err));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(sh_quote("/home/o'neil"), r"'/home/o'\''neil'");
        assert_eq!(win_quote(r#"C:\Data "x""#), r#""C:\Data ""x""""#);
    }
}
