//! Shared fixtures for integration tests: a scriptable in-process transport

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use fleet_backup::config::{ExtractorKind, RetrySettings};
use fleet_backup::model::{BackupRun, Client, Credentials, OsType};
use fleet_backup::remote::{CommandOutput, RemoteError, RemoteSession, Transport};
use fleet_backup::retry::ErrorCode;
use fleet_backup::store::{MemoryStore, RunStore};
use fleet_backup::{BackupOrchestrator, OrchestratorConfig};

/// Files packed into the archive the fake Linux client produces
pub const ARCHIVE_FILES: &[(&str, &[u8])] = &[
    ("etc/hosts", b"127.0.0.1 localhost\n"),
    ("etc/hostname", b"web-01\n"),
    ("home/alice/notes.txt", b"remember the milk\n"),
];

/// Build a gzip-compressed tar archive in memory
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

struct FakeState {
    opens: AtomicU32,
    closes: AtomicU32,
    /// Remaining opens that fail with `open_error`
    failing_opens: AtomicU32,
    open_error: Mutex<RemoteError>,
    /// Backup commands wait for a permit when set
    gate: Option<Arc<Semaphore>>,
    backup_exit_code: Mutex<i32>,
    artifact: Vec<u8>,
    windows_files: usize,
    commands: Mutex<Vec<String>>,
    backups_started: AtomicUsize,
    /// Remaining downloads that fail with `download_error` after a partial write
    failing_downloads: AtomicU32,
    download_error: Mutex<RemoteError>,
    /// robocopy targets still present in remote staging
    staged: Mutex<Vec<String>>,
}

/// In-process transport answering the commands the Linux and Windows targets issue
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Backups block until `release` is called
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self::build(Some(gate.clone())), gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            state: Arc::new(FakeState {
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                failing_opens: AtomicU32::new(0),
                open_error: Mutex::new(RemoteError::new(
                    ErrorCode::ConnectionRefused,
                    "connect ECONNREFUSED 10.0.0.5:22",
                )),
                gate,
                backup_exit_code: Mutex::new(0),
                artifact: tar_gz(ARCHIVE_FILES),
                windows_files: 4,
                commands: Mutex::new(Vec::new()),
                backups_started: AtomicUsize::new(0),
                failing_downloads: AtomicU32::new(0),
                download_error: Mutex::new(RemoteError::new(
                    ErrorCode::ConnectionReset,
                    "read ECONNRESET",
                )),
                staged: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next `count` opens fail with `error`
    pub fn fail_opens(&self, count: u32, error: RemoteError) {
        *self.state.open_error.lock() = error;
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` downloads write a partial artifact and fail with `error`
    pub fn fail_downloads(&self, count: u32, error: RemoteError) {
        *self.state.download_error.lock() = error;
        self.state.failing_downloads.store(count, Ordering::SeqCst);
    }

    pub fn set_backup_exit_code(&self, code: i32) {
        *self.state.backup_exit_code.lock() = code;
    }

    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn backups_started(&self) -> usize {
        self.state.backups_started.load(Ordering::SeqCst)
    }

    pub fn artifact_len(&self) -> u64 {
        self.state.artifact.len() as u64
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.contains(needle)).collect()
    }

    /// robocopy targets left in remote staging
    pub fn staged(&self) -> Vec<String> {
        self.state.staged.lock().clone()
    }
}

/// The `index`-th double-quoted argument of a command line
fn quoted_arg(command: &str, index: usize) -> Option<&str> {
    command.split('"').nth(index * 2 + 1)
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        _host: &str,
        _port: u16,
        _credentials: &Credentials,
        os_type: OsType,
    ) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(self.state.open_error.lock().clone());
        }
        Ok(Arc::new(FakeSession {
            state: self.state.clone(),
            os_type,
        }))
    }
}

struct FakeSession {
    state: Arc<FakeState>,
    os_type: OsType,
}

impl FakeSession {
    async fn wait_for_gate(&self) {
        self.state.backups_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.state.gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn backup_exit(&self) -> i32 {
        *self.state.backup_exit_code.lock()
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.state.commands.lock().push(command.to_string());

        if command.starts_with("uname") {
            return Ok(ok("web-01 6.1.0-18-amd64 x86_64\n"));
        }
        if command.contains("tar --create") {
            self.wait_for_gate().await;
            let listing: String = ARCHIVE_FILES
                .iter()
                .map(|(path, _)| format!("{}\n", path))
                .collect();
            return Ok(CommandOutput {
                exit_code: self.backup_exit(),
                stdout: format!("etc/\nhome/\nhome/alice/\n{}", listing),
                stderr: if self.backup_exit() > 1 {
                    "tar: /home/alice/locked: Cannot open: Permission denied".to_string()
                } else {
                    String::new()
                },
            });
        }
        if command.starts_with("stat -c %s") {
            return Ok(ok(format!("{}\n", self.state.artifact.len())));
        }
        if command.starts_with("cmd /c rmdir") {
            if let Some(path) = quoted_arg(command, 0) {
                self.state.staged.lock().retain(|target| !target.starts_with(path));
            }
            return Ok(ok(""));
        }
        if command.starts_with("rm -f") || command.starts_with("mv -f") {
            return Ok(ok(""));
        }
        if command.contains("Win32_OperatingSystem") {
            return Ok(ok("WS-042|Microsoft Windows 11 Pro|10.0.22631|64-bit\r\n"));
        }
        if command.starts_with("robocopy") {
            self.wait_for_gate().await;
            let files = self.state.windows_files;
            // files already sitting in staging are skipped as identical
            let target = quoted_arg(command, 1).unwrap_or_default().to_string();
            let copied = {
                let mut staged = self.state.staged.lock();
                if staged.contains(&target) {
                    0
                } else {
                    staged.push(target);
                    files
                }
            };
            return Ok(CommandOutput {
                exit_code: if self.backup_exit() != 0 {
                    self.backup_exit()
                } else if copied > 0 {
                    1
                } else {
                    0
                },
                stdout: format!(
                    "   Files :  {files}  {copied}  {skipped}  0  0  0\n   Bytes :  {bytes}  {copied_bytes}  {skipped_bytes}  0  0  0\n",
                    files = files,
                    copied = copied,
                    skipped = files - copied,
                    bytes = files * 1024,
                    copied_bytes = copied * 1024,
                    skipped_bytes = (files - copied) * 1024
                ),
                stderr: String::new(),
            });
        }

        Ok(CommandOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: format!("unknown command: {}", command),
        })
    }

    async fn download(&self, _remote_path: &str, local_path: &Path) -> Result<u64, RemoteError> {
        let remaining = self.state.failing_downloads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.failing_downloads.store(remaining - 1, Ordering::SeqCst);
            match self.os_type {
                OsType::Linux => {
                    let half = self.state.artifact.len() / 2;
                    tokio::fs::write(local_path, &self.state.artifact[..half]).await?;
                }
                OsType::Windows => {
                    tokio::fs::write(local_path.join("partial.tmp"), b"half a file").await?;
                }
            }
            return Err(self.state.download_error.lock().clone());
        }

        match self.os_type {
            OsType::Linux => {
                tokio::fs::write(local_path, &self.state.artifact).await?;
                Ok(self.state.artifact.len() as u64)
            }
            OsType::Windows => {
                let folder = local_path.join("00-Users");
                tokio::fs::create_dir_all(&folder).await?;
                for i in 0..self.state.windows_files {
                    tokio::fs::write(folder.join(format!("file-{}.dat", i)), vec![7u8; 1024]).await?;
                }
                Ok(self.state.windows_files as u64 * 1024)
            }
        }
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn client(id: &str, name: &str, os_type: OsType) -> Client {
    Client {
        id: id.to_string(),
        name: name.to_string(),
        host: format!("{}.fleet.internal", name.to_lowercase()),
        port: if os_type == OsType::Linux { 22 } else { 5985 },
        os_type,
        credentials: Credentials::new("svc-backup", "correct horse"),
        folders: Vec::new(),
        active: true,
    }
}

/// Configuration with millisecond retry delays and the in-process extractor
pub fn test_config(artifact_root: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        max_parallel_backups: 4,
        artifact_root: artifact_root.to_path_buf(),
        connection_retry: RetrySettings {
            max_retries: Some(2),
            initial_delay_ms: Some(5),
            max_delay_ms: Some(20),
            ..Default::default()
        },
        backup_retry: RetrySettings {
            max_retries: Some(0),
            initial_delay_ms: Some(5),
            max_delay_ms: Some(20),
            ..Default::default()
        },
        ..Default::default()
    };
    config.restore.extractor = ExtractorKind::Bundled;
    config
}

pub async fn orchestrator(
    transport: &FakeTransport,
    store: &MemoryStore,
    config: OrchestratorConfig,
) -> BackupOrchestrator {
    BackupOrchestrator::builder(config)
        .transport(Arc::new(transport.clone()))
        .memory_store(store.clone())
        .build()
        .await
        .unwrap()
}

/// Poll the run store until the run reaches a terminal status
pub async fn wait_for_terminal(store: &dyn RunStore, run_id: &str) -> BackupRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(run) = store.get_run(run_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} did not finish in time",
            run_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `count` backup commands have reached the fake client
pub async fn wait_for_backups_started(transport: &FakeTransport, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while transport.backups_started() < count {
        assert!(tokio::time::Instant::now() < deadline, "backups never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
