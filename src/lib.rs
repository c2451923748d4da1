//! # Fleet Backup
//!
//! Orchestration core for recurring and on-demand backups across a fleet of
//! Windows and Linux machines.
//!
//! ## Overview
//!
//! The crate decides *when* and *whether* a backup runs, drives it against
//! the remote machine, and checks or re-materializes what it produced:
//!
//! - cron-driven and manual triggers share one admission path
//! - a global concurrency ceiling and per-client exclusivity are enforced
//!   atomically by the run registry
//! - transient connectivity failures are retried with exponential backoff
//! - completed artifacts can be verified against their recorded metadata and
//!   restored with a post-restore check
//!
//! Remote access, persistence and notification delivery are collaborators
//! supplied through traits ([`remote::Transport`], [`store::RunStore`],
//! [`notify::Notifier`], ...).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleet_backup::{BackupOrchestrator, BackupType, OrchestratorConfig};
//! use fleet_backup::store::MemoryStore;
//! # use fleet_backup::remote::Transport;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> fleet_backup::Result<()> {
//! let store = MemoryStore::new();
//! let orchestrator = BackupOrchestrator::builder(OrchestratorConfig::default())
//!     .transport(transport)
//!     .memory_store(store)
//!     .build()
//!     .await?;
//!
//! let scheduler = orchestrator.spawn_scheduler();
//! let response = orchestrator
//!     .start_manual_backup(&["web-01".to_string()], BackupType::Full, "admin")
//!     .await?;
//! println!("request {}", response.request_id);
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`retry`]: error classification and backoff
//! - [`remote`]: per-OS remote targets over an opaque transport
//! - [`registry`]: admission control and active-run bookkeeping
//! - [`executor`]: drives one run end to end
//! - [`scheduler`]: cron evaluation and manual triggers
//! - [`verify`]: artifact integrity reports
//! - [`restore`]: extraction and post-restore verification
//! - [`orchestrator`]: the facade exposed to API layers

use thiserror::Error;

pub mod config;
pub mod executor;
pub mod model;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod restore;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod verify;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for orchestration operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Remote machine could not be reached or the session broke
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] remote::RemoteError),

    /// Malformed schedule, unknown client, missing field
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Admission denied; not a failure of the run itself
    #[error("Backup not started: {0}")]
    ConcurrencyRejected(#[from] registry::Rejection),

    /// No extractor for the artifact's format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Extraction error: {0}")]
    Extraction(#[from] restore::ExtractionError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Run is not in a state that allows the operation
    #[error("Invalid run state: {0}")]
    InvalidRunState(String),

    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<scheduler::CronError> for OrchestratorError {
    fn from(err: scheduler::CronError) -> Self {
        OrchestratorError::Configuration(err.to_string())
    }
}

pub use config::OrchestratorConfig;
pub use model::{ArtifactFormat, BackupRun, BackupType, Client, Credentials, OsType, RunStatus, ScheduleDefinition, Trigger};
pub use orchestrator::{BackupOrchestrator, OrchestratorBuilder, SchedulerHandle};
pub use registry::{Rejection, RunRegistry};
pub use restore::{RestoreEngine, RestoreResult};
pub use retry::{retry, Classify, ErrorCode, RetryCoordinator, RetryPolicy};
pub use verify::{IntegrityVerifier, VerificationReport};
