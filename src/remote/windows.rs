//! Windows clients: robocopy into a staging tree, then pull the tree back

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{win_quote, BackupRequest, RemoteError, RemoteTarget, SessionHandle, SystemInfo, TransferOutcome};
use crate::model::{ArtifactFormat, BackupType, Credentials, OsType};
use crate::retry::ErrorCode;

pub const REMOTE_STAGING_ROOT: &str = r"C:\ProgramData\FleetBackup\staging";

/// robocopy exit codes at or above this value mean at least one copy failed
const ROBOCOPY_FAILURE_THRESHOLD: i32 = 8;

lazy_static! {
    static ref FILES_SUMMARY: Regex = Regex::new(r"(?m)^\s*Files\s*:\s*(\d+)\s+(\d+)").unwrap();
    static ref BYTES_SUMMARY: Regex = Regex::new(r"(?m)^\s*Bytes\s*:\s*(\d+)\s+(\d+)").unwrap();
}

/// Totals from a robocopy job summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RobocopySummary {
    pub files_total: u64,
    pub files_copied: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
}

pub struct WindowsTarget {
    session: SessionHandle,
}

impl WindowsTarget {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    async fn copy_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        let started = Instant::now();
        let staging = staging_dir(&request.run_id);

        let result = self.copy_and_fetch(request, &staging).await;
        self.cleanup(&staging).await;
        let (local_path, copied, warnings) = result?;

        // robocopy only reports what it copied this pass, so count what actually arrived
        let (files, bytes) = local_tree_totals(&local_path).await?;
        info!(
            run_id = %request.run_id,
            files,
            bytes,
            robocopy_files = copied.files_copied,
            "Windows copy transferred"
        );

        Ok(TransferOutcome {
            artifact_path: local_path,
            format: ArtifactFormat::Directory,
            bytes_transferred: bytes,
            artifact_files: files,
            source_files: files,
            duration: started.elapsed(),
            warnings,
        })
    }

    async fn copy_and_fetch(
        &self,
        request: &BackupRequest,
        staging: &str,
    ) -> Result<(PathBuf, RobocopySummary, Vec<String>), RemoteError> {
        let incremental = request.backup_type == BackupType::Incremental;
        let mut totals = RobocopySummary::default();
        let mut warnings = Vec::new();

        for (index, folder) in request.folders.iter().enumerate() {
            let target = format!(r"{}\{:02}-{}", staging, index, folder_leaf(folder));
            let command = robocopy_command(folder, &target, incremental);
            debug!(run_id = %request.run_id, command = %command, "Copying folder");

            let output = self.session.exec(&command).await?;
            let summary = parse_robocopy_summary(&output.stdout).unwrap_or_default();

            if output.exit_code >= ROBOCOPY_FAILURE_THRESHOLD {
                return Err(RemoteError::new(
                    ErrorCode::CommandFailed,
                    format!(
                        "robocopy failed for {} with status {}: {}",
                        folder,
                        output.exit_code,
                        output.stderr.trim()
                    ),
                )
                .with_partial(json!({
                    "folders_completed": index,
                    "files_copied": totals.files_copied + summary.files_copied,
                    "bytes_copied": totals.bytes_copied + summary.bytes_copied,
                    "exit_code": output.exit_code,
                })));
            }
            if output.exit_code & 0b0100 != 0 {
                warnings.push(format!("robocopy found mismatched entries under {}", folder));
            }

            totals.files_total += summary.files_total;
            totals.files_copied += summary.files_copied;
            totals.bytes_total += summary.bytes_total;
            totals.bytes_copied += summary.bytes_copied;
        }

        let local_path = self.fetch(staging, request).await?;
        Ok((local_path, totals, warnings))
    }

    async fn image_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        let started = Instant::now();
        let staging = staging_dir(&request.run_id);

        let result = self.image_and_fetch(request, &staging).await;
        self.cleanup(&staging).await;
        let (local_path, file_count) = result?;
        let (_, bytes) = local_tree_totals(&local_path).await?;

        Ok(TransferOutcome {
            artifact_path: local_path,
            format: ArtifactFormat::DiskImage,
            bytes_transferred: bytes,
            artifact_files: file_count,
            source_files: file_count,
            duration: started.elapsed(),
            warnings: Vec::new(),
        })
    }

    async fn image_and_fetch(&self, request: &BackupRequest, staging: &str) -> Result<(PathBuf, u64), RemoteError> {
        let include = request.folders.join(",");
        let command = format!(
            "wbadmin start backup -backupTarget:{} -include:{} -quiet",
            win_quote(staging),
            win_quote(&include)
        );
        self.session.exec_checked(&command, |code| code == 0).await?;

        let measure = powershell(&format!(
            "$m = Get-ChildItem -Recurse -File -LiteralPath {} | Measure-Object -Sum Length; Write-Output ('{{0}}|{{1}}' -f $m.Count, $m.Sum)",
            ps_quote(staging)
        ));
        let output = self.session.exec_checked(&measure, |code| code == 0).await?;
        let (file_count, _) = parse_count_and_sum(&output.stdout)?;

        let local_path = self.fetch(staging, request).await?;
        Ok((local_path, file_count))
    }

    /// Pull the staging tree into a fresh local directory
    async fn fetch(&self, staging: &str, request: &BackupRequest) -> Result<PathBuf, RemoteError> {
        let local_path = request.destination.join(&request.run_id);
        // an earlier attempt may have left a partial tree behind
        if tokio::fs::try_exists(&local_path).await? {
            tokio::fs::remove_dir_all(&local_path).await?;
        }
        tokio::fs::create_dir_all(&local_path).await?;
        self.session.download(staging, &local_path).await?;
        Ok(local_path)
    }

    async fn cleanup(&self, staging: &str) {
        let command = format!("cmd /c rmdir /s /q {}", win_quote(staging));
        if let Err(e) = self.session.exec(&command).await {
            warn!(staging, error = %e, "Failed to remove remote staging directory");
        }
    }
}

#[async_trait]
impl RemoteTarget for WindowsTarget {
    fn os_type(&self) -> OsType {
        OsType::Windows
    }

    fn default_folders(&self) -> Vec<String> {
        vec![r"C:\Users".to_string()]
    }

    async fn connect(&mut self, host: &str, port: u16, credentials: &Credentials) -> Result<(), RemoteError> {
        self.session.open(host, port, credentials).await
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RemoteError> {
        let command = powershell(
            "$o = Get-CimInstance Win32_OperatingSystem; Write-Output ('{0}|{1}|{2}|{3}' -f $env:COMPUTERNAME, $o.Caption, $o.Version, $o.OSArchitecture)",
        );
        let output = self.session.exec_checked(&command, |code| code == 0).await?;
        parse_system_info(&output.stdout)
    }

    async fn run_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        if request.folders.is_empty() {
            return Err(RemoteError::new(ErrorCode::CommandFailed, "no folders selected for backup"));
        }
        match request.backup_type {
            BackupType::Image => self.image_backup(request).await,
            BackupType::Full | BackupType::Incremental => self.copy_backup(request).await,
        }
    }

    // /M clears archive bits as it copies, so a second pass would miss those files
    fn capture_is_repeatable(&self, backup_type: BackupType) -> bool {
        backup_type != BackupType::Incremental
    }

    async fn discard_staging(&self, request: &BackupRequest) {
        self.cleanup(&staging_dir(&request.run_id)).await;
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.session.close().await
    }
}

fn staging_dir(run_id: &str) -> String {
    format!(r"{}\{}", REMOTE_STAGING_ROOT, run_id)
}

/// Regular files and their total size under `root`
async fn local_tree_totals(root: &Path) -> Result<(u64, u64), RemoteError> {
    let root = root.to_path_buf();
    let totals = tokio::task::spawn_blocking(move || {
        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok::<_, io::Error>((files, bytes))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(totals)
}

fn robocopy_command(source: &str, target: &str, incremental: bool) -> String {
    let mut command = format!(
        "robocopy {} {} /E /R:1 /W:1 /NP /NFL /NDL /BYTES",
        win_quote(source),
        win_quote(target)
    );
    // /M copies only files with the archive bit set and clears it afterwards
    if incremental {
        command.push_str(" /M");
    }
    command
}

fn powershell(script: &str) -> String {
    format!("powershell -NoProfile -NonInteractive -Command {}", win_quote(script))
}

/// Single-quoted PowerShell literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Last path component, reduced to characters safe in a directory name
fn folder_leaf(folder: &str) -> String {
    let leaf = folder
        .trim_end_matches(['\\', '/'])
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or_default();
    let cleaned: String = leaf
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}

pub fn parse_robocopy_summary(stdout: &str) -> Option<RobocopySummary> {
    let files = FILES_SUMMARY.captures(stdout)?;
    let mut summary = RobocopySummary {
        files_total: files[1].parse().ok()?,
        files_copied: files[2].parse().ok()?,
        ..Default::default()
    };
    if let Some(bytes) = BYTES_SUMMARY.captures(stdout) {
        summary.bytes_total = bytes[1].parse().ok()?;
        summary.bytes_copied = bytes[2].parse().ok()?;
    }
    Some(summary)
}

fn parse_system_info(stdout: &str) -> Result<SystemInfo, RemoteError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() != 4 || fields[0].is_empty() {
        return Err(RemoteError::new(
            ErrorCode::CommandFailed,
            format!("unexpected system info output: {:?}", line),
        ));
    }
    Ok(SystemInfo {
        hostname: fields[0].to_string(),
        os_type: OsType::Windows,
        os_version: format!("{} {}", fields[1], fields[2]),
        architecture: fields[3].to_string(),
    })
}

fn parse_count_and_sum(stdout: &str) -> Result<(u64, u64), RemoteError> {
    let line = stdout.trim();
    let parsed = line.split_once('|').and_then(|(count, sum)| {
        let count = count.trim().parse().ok()?;
        // Measure-Object leaves Sum empty for an empty tree
        let sum = if sum.trim().is_empty() { 0 } else { sum.trim().parse().ok()? };
        Some((count, sum))
    });
    parsed.ok_or_else(|| {
        RemoteError::new(
            ErrorCode::CommandFailed,
            format!("unexpected measure output: {:?}", line),
        )
    })
}
