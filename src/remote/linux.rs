//! Linux clients: tar archives streamed back over the remote shell

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{sh_quote, BackupRequest, RemoteError, RemoteTarget, SessionHandle, SystemInfo, TransferOutcome};
use crate::model::{ArtifactFormat, BackupType, Credentials, OsType};
use crate::retry::ErrorCode;

/// Remote scratch directory for archives awaiting download
pub const REMOTE_STAGING_DIR: &str = "/var/tmp/fleet-backup";

/// Where incremental snapshot files are kept on the client
pub const SNAPSHOT_DIR: &str = "/var/lib/fleet-backup";

const DEFAULT_IMAGE_DEVICE: &str = "/dev/sda";

pub struct LinuxTarget {
    session: SessionHandle,
}

impl LinuxTarget {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }

    async fn archive_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        let started = Instant::now();
        let staged = StagedPaths::archive(request);

        let result = self.archive_and_fetch(request, &staged).await;
        // after a successful promotion the working snapshot is already gone
        self.cleanup(&staged.all()).await;
        let (bytes, source_files, warnings) = result?;

        info!(
            run_id = %request.run_id,
            files = source_files,
            bytes,
            "Linux archive transferred"
        );

        Ok(TransferOutcome {
            artifact_path: staged.local,
            format: ArtifactFormat::TarGz,
            bytes_transferred: bytes,
            artifact_files: 1,
            source_files,
            duration: started.elapsed(),
            warnings,
        })
    }

    async fn archive_and_fetch(
        &self,
        request: &BackupRequest,
        staged: &StagedPaths,
    ) -> Result<(u64, u64, Vec<String>), RemoteError> {
        let command = build_tar_command(request, staged);
        debug!(run_id = %request.run_id, command = %command, "Starting remote archive");

        let output = self.session.exec(&command).await?;
        let source_files = count_archived_files(&output.stdout);
        let mut warnings = Vec::new();

        match output.exit_code {
            0 => {}
            // GNU tar: some files changed while being read; the archive is still usable
            1 => warnings.push(format!(
                "tar reported files changed during read: {}",
                output.stderr.trim()
            )),
            code => {
                return Err(RemoteError::new(
                    ErrorCode::CommandFailed,
                    format!("tar exited with status {}: {}", code, output.stderr.trim()),
                )
                .with_partial(json!({
                    "files_archived": source_files,
                    "remote_path": staged.remote,
                    "exit_code": code,
                })));
            }
        }

        let bytes = self
            .fetch(&staged.remote, &staged.local, &request.destination)
            .await
            .map_err(|mut e| {
                let mut partial = e.partial.take().unwrap_or_else(|| json!({}));
                partial["files_archived"] = json!(source_files);
                e.with_partial(partial)
            })?;

        if let Some(snapshot) = &staged.snapshot {
            if let Err(e) = self.promote_snapshot(snapshot).await {
                warn!(run_id = %request.run_id, error = %e, "Incremental snapshot was not advanced");
                warnings.push(format!("incremental snapshot was not advanced: {}", e));
            }
        }
        Ok((bytes, source_files, warnings))
    }

    async fn image_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        let started = Instant::now();
        let staged = StagedPaths::image(request);
        let command = build_image_command(request, &staged.remote);

        let result = match self.session.exec_checked(&command, |code| code == 0).await {
            Ok(_) => self.fetch(&staged.remote, &staged.local, &request.destination).await,
            Err(e) => Err(e),
        };
        self.cleanup(&staged.all()).await;
        let bytes = result?;

        Ok(TransferOutcome {
            artifact_path: staged.local,
            format: ArtifactFormat::DiskImage,
            bytes_transferred: bytes,
            artifact_files: 1,
            source_files: 1,
            duration: started.elapsed(),
            warnings: Vec::new(),
        })
    }

    /// Download a staged file and check it arrived whole
    async fn fetch(&self, remote_path: &str, local_path: &Path, destination: &Path) -> Result<u64, RemoteError> {
        let expected_size = self.remote_file_size(remote_path).await?;
        tokio::fs::create_dir_all(destination).await?;

        let bytes = self.session.download(remote_path, local_path).await?;
        if bytes != expected_size {
            return Err(RemoteError::new(
                ErrorCode::CommandFailed,
                format!(
                    "incomplete download of {}: expected {} bytes, received {}",
                    remote_path, expected_size, bytes
                ),
            )
            .with_partial(json!({ "bytes_received": bytes })));
        }
        Ok(bytes)
    }

    async fn remote_file_size(&self, remote_path: &str) -> Result<u64, RemoteError> {
        let output = self
            .session
            .exec_checked(&format!("stat -c %s {}", sh_quote(remote_path)), |code| code == 0)
            .await?;
        output.stdout.trim().parse::<u64>().map_err(|_| {
            RemoteError::new(
                ErrorCode::CommandFailed,
                format!("unexpected stat output: {:?}", output.stdout.trim()),
            )
        })
    }

    async fn promote_snapshot(&self, snapshot: &Snapshot) -> Result<(), RemoteError> {
        let command = format!("mv -f {} {}", sh_quote(&snapshot.working), sh_quote(&snapshot.committed));
        self.session.exec_checked(&command, |code| code == 0).await?;
        debug!(snapshot = %snapshot.committed, "Incremental snapshot advanced");
        Ok(())
    }

    async fn cleanup(&self, remote_paths: &[&str]) {
        let quoted: Vec<String> = remote_paths.iter().map(|p| sh_quote(p)).collect();
        if let Err(e) = self.session.exec(&format!("rm -f {}", quoted.join(" "))).await {
            warn!(paths = ?remote_paths, error = %e, "Failed to remove remote staging files");
        }
    }
}

/// `--listed-incremental` state: tar works on a per-run copy so a failed
/// attempt never advances the client's committed snapshot
#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    committed: String,
    working: String,
}

impl Snapshot {
    fn for_request(request: &BackupRequest) -> Self {
        let committed = format!("{}/{}.snar", SNAPSHOT_DIR, sanitize(&request.client_name));
        let working = format!("{}.{}", committed, sanitize(&request.run_id));
        Self { committed, working }
    }
}

/// Every path one attempt may create on either side
#[derive(Debug, Clone)]
struct StagedPaths {
    remote: String,
    local: PathBuf,
    snapshot: Option<Snapshot>,
}

impl StagedPaths {
    fn archive(request: &BackupRequest) -> Self {
        Self {
            remote: format!("{}/{}.tar.gz", REMOTE_STAGING_DIR, request.run_id),
            local: request.destination.join(format!("{}.tar.gz", request.run_id)),
            snapshot: (request.backup_type == BackupType::Incremental).then(|| Snapshot::for_request(request)),
        }
    }

    fn image(request: &BackupRequest) -> Self {
        Self {
            remote: format!("{}/{}.img.gz", REMOTE_STAGING_DIR, request.run_id),
            local: request.destination.join(format!("{}.img.gz", request.run_id)),
            snapshot: None,
        }
    }

    /// Remote paths to remove once the attempt is over
    fn all(&self) -> Vec<&str> {
        let mut paths = vec![self.remote.as_str()];
        if let Some(snapshot) = &self.snapshot {
            paths.push(snapshot.working.as_str());
        }
        paths
    }
}

#[async_trait]
impl RemoteTarget for LinuxTarget {
    fn os_type(&self) -> OsType {
        OsType::Linux
    }

    fn default_folders(&self) -> Vec<String> {
        vec!["/etc".to_string(), "/home".to_string(), "/root".to_string()]
    }

    async fn connect(&mut self, host: &str, port: u16, credentials: &Credentials) -> Result<(), RemoteError> {
        self.session.open(host, port, credentials).await
    }

    async fn get_system_info(&self) -> Result<SystemInfo, RemoteError> {
        let output = self.session.exec_checked("uname -nrm", |code| code == 0).await?;
        parse_uname(&output.stdout)
    }

    async fn run_backup(&self, request: &BackupRequest) -> Result<TransferOutcome, RemoteError> {
        if request.folders.is_empty() {
            return Err(RemoteError::new(ErrorCode::CommandFailed, "no folders selected for backup"));
        }
        match request.backup_type {
            BackupType::Image => self.image_backup(request).await,
            BackupType::Full | BackupType::Incremental => self.archive_backup(request).await,
        }
    }

    async fn discard_staging(&self, request: &BackupRequest) {
        let archive = StagedPaths::archive(request);
        let image = StagedPaths::image(request);
        let mut paths = archive.all();
        paths.push(image.remote.as_str());
        self.cleanup(&paths).await;
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.session.close().await
    }
}

fn build_tar_command(request: &BackupRequest, staged: &StagedPaths) -> String {
    let mut command = format!(
        "mkdir -p {} {} && ",
        sh_quote(REMOTE_STAGING_DIR),
        sh_quote(SNAPSHOT_DIR)
    );

    // Start every attempt from the committed snapshot, or from scratch when there is none
    if let Some(snapshot) = &staged.snapshot {
        command.push_str(&format!(
            "{{ cp -f {committed} {working} 2>/dev/null || rm -f {working}; }} && ",
            committed = sh_quote(&snapshot.committed),
            working = sh_quote(&snapshot.working)
        ));
    }

    command.push_str(&format!(
        "tar --create --gzip --verbose --file={} --directory=/",
        sh_quote(&staged.remote)
    ));
    if let Some(snapshot) = &staged.snapshot {
        command.push_str(&format!(" --listed-incremental={}", sh_quote(&snapshot.working)));
    }

    for folder in &request.folders {
        let relative = folder.trim_start_matches('/');
        let relative = if relative.is_empty() { "." } else { relative };
        command.push(' ');
        command.push_str(&sh_quote(relative));
    }
    command
}

fn build_image_command(request: &BackupRequest, remote_path: &str) -> String {
    let device = request
        .folders
        .iter()
        .find(|f| f.starts_with("/dev/"))
        .map(String::as_str)
        .unwrap_or(DEFAULT_IMAGE_DEVICE);
    format!(
        "mkdir -p {} && dd if={} bs=4M status=none | gzip -c > {}",
        sh_quote(REMOTE_STAGING_DIR),
        sh_quote(device),
        sh_quote(remote_path)
    )
}

/// Count regular-file entries in `tar --verbose` create output
fn count_archived_files(listing: &str) -> u64 {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with('/'))
        .count() as u64
}

fn parse_uname(stdout: &str) -> Result<SystemInfo, RemoteError> {
    let mut parts = stdout.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(hostname), Some(release), Some(machine)) => Ok(SystemInfo {
            hostname: hostname.to_string(),
            os_type: OsType::Linux,
            os_version: format!("Linux {}", release),
            architecture: machine.to_string(),
        }),
        _ => Err(RemoteError::new(
            ErrorCode::CommandFailed,
            format!("unexpected uname output: {:?}", stdout.trim()),
        )),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
