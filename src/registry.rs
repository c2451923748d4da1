//! Run registry
//!
//! The single authority on which runs currently hold a concurrency slot.
//! Admission checks per-client exclusivity and the ceiling and reserves the
//! slot in one critical section, so two concurrent callers can never both be
//! admitted for the same client or push the active count past the ceiling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ArtifactFormat, BackupRun, BackupType, OsType, RunId, RunStatus, Trigger};
use crate::observability::metrics;

/// Why a run was not admitted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("client '{client}' already has an active backup ({run_id})")]
    ClientBusy { client: String, run_id: RunId },

    #[error("concurrency ceiling reached ({running}/{ceiling} runs active)")]
    CeilingReached { running: usize, ceiling: usize },
}

impl Rejection {
    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::ClientBusy { .. } => "client_busy",
            Rejection::CeilingReached { .. } => "ceiling_reached",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("run {0} is not active")]
    UnknownRun(RunId),

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition { run_id: RunId, from: RunStatus, to: RunStatus },
}

/// Request to reserve a slot for one client
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub client_name: String,
    pub backup_type: BackupType,
    pub os_type: Option<OsType>,
    pub trigger: Trigger,
}

impl AdmissionRequest {
    pub fn new(client_name: impl Into<String>, backup_type: BackupType, trigger: Trigger) -> Self {
        Self {
            client_name: client_name.into(),
            backup_type,
            os_type: None,
            trigger,
        }
    }

    pub fn with_os_type(mut self, os_type: OsType) -> Self {
        self.os_type = Some(os_type);
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunCompletion {
    Completed {
        artifact_path: PathBuf,
        artifact_format: ArtifactFormat,
        size_mb: f64,
        file_count: u64,
        source_file_count: u64,
    },
    Failed {
        error: String,
        partial_results: Option<serde_json::Value>,
    },
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, BackupRun>,
    active_by_client: HashMap<String, RunId>,
}

/// Mutex-guarded table of admitted, unfinished runs
pub struct RunRegistry {
    inner: Mutex<Inner>,
    ceiling: AtomicUsize,
}

impl RunRegistry {
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ceiling: AtomicUsize::new(ceiling),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::SeqCst)
    }

    /// Change the ceiling; runs already admitted keep their slots
    pub fn set_ceiling(&self, ceiling: usize) {
        let previous = self.ceiling.swap(ceiling, Ordering::SeqCst);
        if previous != ceiling {
            info!(previous, ceiling, "Concurrency ceiling updated");
        }
    }

    /// Admit a run, reserving its slot, or say why not
    pub fn try_admit(&self, request: AdmissionRequest) -> Result<BackupRun, Rejection> {
        let mut inner = self.inner.lock();

        if let Some(run_id) = inner.active_by_client.get(&request.client_name) {
            let rejection = Rejection::ClientBusy {
                client: request.client_name.clone(),
                run_id: run_id.clone(),
            };
            metrics::record_admission_rejected(rejection.reason());
            debug!(client = %request.client_name, "Admission denied: client busy");
            return Err(rejection);
        }

        let ceiling = self.ceiling();
        let running = inner.runs.len();
        if running >= ceiling {
            let rejection = Rejection::CeilingReached { running, ceiling };
            metrics::record_admission_rejected(rejection.reason());
            debug!(client = %request.client_name, running, ceiling, "Admission denied: ceiling reached");
            return Err(rejection);
        }

        let mut run = BackupRun::new(request.client_name, request.backup_type, request.trigger);
        run.os_type = request.os_type;
        inner
            .active_by_client
            .insert(run.client_name.clone(), run.id.clone());
        inner.runs.insert(run.id.clone(), run.clone());
        metrics::record_run_admitted();

        debug!(run_id = %run.id, client = %run.client_name, active = running + 1, "Run admitted");
        Ok(run)
    }

    /// Mark an admitted run as running
    pub fn record_start(&self, run_id: &str) -> Result<BackupRun, RegistryError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))?;
        transition(run, RunStatus::Running)?;
        run.started_at = Some(Utc::now());
        Ok(run.clone())
    }

    /// Finish a run and release its slot, returning the final record
    pub fn record_terminal(&self, run_id: &str, completion: RunCompletion) -> Result<BackupRun, RegistryError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))?;

        let next = match completion {
            RunCompletion::Completed { .. } => RunStatus::Completed,
            RunCompletion::Failed { .. } => RunStatus::Failed,
        };
        transition(run, next)?;

        match completion {
            RunCompletion::Completed {
                artifact_path,
                artifact_format,
                size_mb,
                file_count,
                source_file_count,
            } => {
                run.artifact_path = Some(artifact_path);
                run.artifact_format = Some(artifact_format);
                run.size_mb = size_mb;
                run.file_count = file_count;
                run.source_file_count = source_file_count;
            }
            RunCompletion::Failed { error, partial_results } => {
                run.error = Some(error);
                run.partial_results = partial_results;
            }
        }

        let now = Utc::now();
        run.completed_at = Some(now);
        let duration_ms = run
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        run.duration_ms = Some(duration_ms);

        let finished = run.clone();
        inner.runs.remove(run_id);
        inner.active_by_client.remove(&finished.client_name);

        metrics::record_run_finished(
            finished.status.as_str(),
            finished.trigger.kind(),
            finished.backup_type.as_str(),
            duration_ms as f64 / 1000.0,
        );
        Ok(finished)
    }

    /// Snapshot of every run holding a slot, oldest first
    pub fn list_running(&self) -> Vec<BackupRun> {
        let inner = self.inner.lock();
        let mut runs: Vec<BackupRun> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub fn get(&self, run_id: &str) -> Option<BackupRun> {
        self.inner.lock().runs.get(run_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn is_client_busy(&self, client_name: &str) -> bool {
        self.inner.lock().active_by_client.contains_key(client_name)
    }
}

fn transition(run: &mut BackupRun, next: RunStatus) -> Result<(), RegistryError> {
    if !run.status.can_transition_to(next) {
        return Err(RegistryError::InvalidTransition {
            run_id: run.id.clone(),
            from: run.status,
            to: next,
        });
    }
    run.status = next;
    Ok(())
}
