//! Job executor
//!
//! Turns an admitted run into an independent task that drives one remote
//! target from connect to disconnect and records the outcome.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{BackupRun, BackupType, Client, OsType, RunId, Trigger};
use crate::notify::{self, NotificationEvent, Notifier};
use crate::registry::{AdmissionRequest, Rejection, RegistryError, RunCompletion, RunRegistry};
use crate::remote::{self, BackupRequest, RemoteError, RemoteTarget, Transport};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::store::RunStore;

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Bound on removing remote leftovers after the run deadline fires
const STAGING_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the target implementation for a client's OS
pub trait TargetFactory: Send + Sync {
    fn create(&self, os_type: OsType) -> Box<dyn RemoteTarget>;
}

/// Factory wrapping one transport for both OS families
pub struct TransportTargetFactory {
    transport: Arc<dyn Transport>,
    connection_policy: RetryPolicy,
}

impl TransportTargetFactory {
    pub fn new(transport: Arc<dyn Transport>, connection_policy: RetryPolicy) -> Self {
        Self {
            transport,
            connection_policy,
        }
    }
}

impl TargetFactory for TransportTargetFactory {
    fn create(&self, os_type: OsType) -> Box<dyn RemoteTarget> {
        remote::target_for(os_type, Arc::clone(&self.transport), self.connection_policy.clone())
    }
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Upper bound on one run's wall-clock time; `None` disables it
    pub run_deadline: Option<Duration>,
    /// Artifacts land under `<artifact_root>/<client>/`
    pub artifact_root: PathBuf,
    /// Policy wrapped around the whole `run_backup` call
    pub backup_policy: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            run_deadline: Some(Duration::from_secs(6 * 60 * 60)),
            artifact_root: PathBuf::from("./backups"),
            backup_policy: RetryPolicy::whole_backup(),
        }
    }
}

/// An admitted run and the task executing it
#[derive(Debug)]
pub struct DispatchedRun {
    /// Record as admitted (status pending)
    pub run: BackupRun,
    pub handle: JoinHandle<Result<BackupRun, RegistryError>>,
}

pub struct JobExecutor {
    registry: Arc<RunRegistry>,
    targets: Arc<dyn TargetFactory>,
    runs: Arc<dyn RunStore>,
    notifier: Arc<dyn Notifier>,
    settings: ExecutorSettings,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<RunRegistry>,
        targets: Arc<dyn TargetFactory>,
        runs: Arc<dyn RunStore>,
        notifier: Arc<dyn Notifier>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            targets,
            runs,
            notifier,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Admit a run for `client` and start it in the background.
    ///
    /// A rejection leaves no record anywhere.
    pub fn dispatch(
        self: &Arc<Self>,
        client: Client,
        backup_type: BackupType,
        trigger: Trigger,
    ) -> Result<DispatchedRun, Rejection> {
        let request =
            AdmissionRequest::new(client.name.clone(), backup_type, trigger).with_os_type(client.os_type);
        let run = self.registry.try_admit(request)?;

        let executor = Arc::clone(self);
        let run_id = run.id.clone();
        let handle = tokio::spawn(async move { executor.execute(run_id, client).await });

        Ok(DispatchedRun { run, handle })
    }

    #[instrument(skip(self, client), fields(client = %client.name))]
    async fn execute(self: Arc<Self>, run_id: RunId, client: Client) -> Result<BackupRun, RegistryError> {
        let started = match self.registry.record_start(&run_id) {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Run could not be started");
                return self
                    .finish(
                        &run_id,
                        RunCompletion::Failed {
                            error: e.to_string(),
                            partial_results: None,
                        },
                    )
                    .await;
            }
        };
        self.persist(&started).await;
        notify::deliver(self.notifier.as_ref(), NotificationEvent::started(&started)).await;
        info!(backup_type = %started.backup_type, "Backup run started");

        let completion = AssertUnwindSafe(self.drive(&started, &client))
            .catch_unwind()
            .await
            .unwrap_or_else(panicked);

        self.finish(&run_id, completion).await
    }

    async fn drive(&self, run: &BackupRun, client: &Client) -> RunCompletion {
        let deadline = self.settings.run_deadline.map(|limit| (Instant::now() + limit, limit));
        let mut target = self.targets.create(client.os_type);

        let connect = target.connect(&client.host, client.port, &client.credentials);
        let connected = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, connect).await {
                Ok(connected) => connected,
                Err(_) => return deadline_exceeded(limit),
            },
            None => connect.await,
        };
        if let Err(e) = connected {
            warn!(host = %client.host, error = %e, "Could not connect to client");
            return failed(e);
        }

        let folders = if client.folders.is_empty() {
            target.default_folders()
        } else {
            client.folders.clone()
        };
        let request = BackupRequest {
            run_id: run.id.clone(),
            client_name: client.name.clone(),
            backup_type: run.backup_type,
            folders,
            destination: self.settings.artifact_root.join(path_safe(&client.name)),
        };

        let capture = AssertUnwindSafe(self.capture(target.as_ref(), &request)).catch_unwind();
        let completion = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, capture).await {
                Ok(outcome) => outcome.unwrap_or_else(panicked),
                Err(_) => {
                    warn!(deadline_secs = limit.as_secs(), "Run deadline exceeded, abandoning transfer");
                    if tokio::time::timeout(STAGING_CLEANUP_TIMEOUT, target.discard_staging(&request))
                        .await
                        .is_err()
                    {
                        warn!(host = %client.host, "Remote staging cleanup timed out");
                    }
                    deadline_exceeded(limit)
                }
            },
            None => capture.await.unwrap_or_else(panicked),
        };

        if let Err(e) = target.disconnect().await {
            warn!(host = %client.host, error = %e, "Disconnect failed");
        }
        completion
    }

    async fn capture(&self, target: &dyn RemoteTarget, request: &BackupRequest) -> RunCompletion {
        match target.get_system_info().await {
            Ok(info) => debug!(
                hostname = %info.hostname,
                os_version = %info.os_version,
                arch = %info.architecture,
                "Connected to client"
            ),
            Err(e) => return failed(e),
        }

        let policy = if target.capture_is_repeatable(request.backup_type) {
            self.settings.backup_policy.clone()
        } else {
            debug!(backup_type = %request.backup_type, "Capture is not repeatable, single attempt");
            RetryPolicy::none()
        };
        let coordinator = RetryCoordinator::new("backup", policy);
        match coordinator.execute(|| target.run_backup(request)).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(warning = %warning, "Remote tooling reported a warning");
                }
                RunCompletion::Completed {
                    artifact_path: outcome.artifact_path,
                    artifact_format: outcome.format,
                    size_mb: outcome.bytes_transferred as f64 / BYTES_PER_MIB,
                    file_count: outcome.artifact_files,
                    source_file_count: outcome.source_files,
                }
            }
            Err(e) => failed(e),
        }
    }

    async fn finish(&self, run_id: &str, completion: RunCompletion) -> Result<BackupRun, RegistryError> {
        let finished = self.registry.record_terminal(run_id, completion)?;
        self.persist(&finished).await;
        notify::deliver(self.notifier.as_ref(), NotificationEvent::finished(&finished)).await;
        info!(
            run_id = %finished.id,
            status = %finished.status,
            duration_ms = finished.duration_ms.unwrap_or(0),
            "Backup run finished"
        );
        Ok(finished)
    }

    async fn persist(&self, run: &BackupRun) {
        if let Err(e) = self.runs.save_run(run).await {
            error!(run_id = %run.id, error = %e, "Failed to persist run record");
        }
    }
}

fn failed(error: RemoteError) -> RunCompletion {
    RunCompletion::Failed {
        error: error.to_string(),
        partial_results: error.partial,
    }
}

fn deadline_exceeded(limit: Duration) -> RunCompletion {
    RunCompletion::Failed {
        error: format!("backup exceeded run deadline of {}s", limit.as_secs()),
        partial_results: None,
    }
}

fn panicked(payload: Box<dyn std::any::Any + Send>) -> RunCompletion {
    let message = panic_message(payload.as_ref());
    error!(panic = %message, "Backup task panicked");
    RunCompletion::Failed {
        error: format!("backup task panicked: {}", message),
        partial_results: None,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn path_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}
