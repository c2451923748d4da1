//! Facade wiring every component together
//!
//! [`BackupOrchestrator`] is what an API or CLI layer talks to. It owns the
//! run registry, executor, scheduler, verifier and restore engine, and routes
//! each exposed operation to the component responsible for it.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::executor::{JobExecutor, TargetFactory, TransportTargetFactory};
use crate::model::{BackupRun, BackupType, RunId, ScheduleDefinition};
use crate::notify::{LoggingNotifier, Notifier};
use crate::observability::metrics;
use crate::registry::RunRegistry;
use crate::remote::Transport;
use crate::restore::{RestoreEngine, RestoreResult};
use crate::scheduler::{ManualBackupOptions, ManualBackupResponse, NewSchedule, ScheduleStatus, Scheduler};
use crate::store::{
    ClientDirectory, MemoryStore, RunStore, ScheduleStore, SettingsStore, MAX_PARALLEL_BACKUPS_KEY,
};
use crate::verify::{IntegrityVerifier, VerificationReport};
use crate::{OrchestratorError, Result};

pub struct BackupOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<RunRegistry>,
    scheduler: Arc<Scheduler>,
    runs: Arc<dyn RunStore>,
    settings: Arc<dyn SettingsStore>,
    verifier: IntegrityVerifier,
    restore: RestoreEngine,
}

/// Assembles a [`BackupOrchestrator`]; unset collaborators default to one
/// shared [`MemoryStore`] and a [`LoggingNotifier`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    targets: Option<Arc<dyn TargetFactory>>,
    transport: Option<Arc<dyn Transport>>,
    runs: Option<Arc<dyn RunStore>>,
    schedules: Option<Arc<dyn ScheduleStore>>,
    clients: Option<Arc<dyn ClientDirectory>>,
    settings: Option<Arc<dyn SettingsStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    restore: Option<RestoreEngine>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            targets: None,
            transport: None,
            runs: None,
            schedules: None,
            clients: None,
            settings: None,
            notifier: None,
            restore: None,
        }
    }

    /// Reach clients through `transport`
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace target construction entirely
    pub fn target_factory(mut self, targets: Arc<dyn TargetFactory>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Use one store for runs, schedules, clients and settings
    pub fn memory_store(mut self, store: MemoryStore) -> Self {
        let store = Arc::new(store);
        self.runs = Some(store.clone());
        self.schedules = Some(store.clone());
        self.clients = Some(store.clone());
        self.settings = Some(store);
        self
    }

    pub fn run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn schedule_store(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = Some(schedules);
        self
    }

    pub fn client_directory(mut self, clients: Arc<dyn ClientDirectory>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn settings_store(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn restore_engine(mut self, restore: RestoreEngine) -> Self {
        self.restore = Some(restore);
        self
    }

    /// Validate the configuration, load stored schedules and the stored ceiling
    pub async fn build(self) -> Result<BackupOrchestrator> {
        self.config.validate()?;

        let targets = match (self.targets, self.transport) {
            (Some(targets), _) => targets,
            (None, Some(transport)) => Arc::new(TransportTargetFactory::new(
                transport,
                self.config.connection_policy(),
            )) as Arc<dyn TargetFactory>,
            (None, None) => {
                return Err(OrchestratorError::Configuration(
                    "a transport or target factory is required".to_string(),
                ))
            }
        };

        let fallback = Arc::new(MemoryStore::new());
        let runs = self.runs.unwrap_or_else(|| fallback.clone() as Arc<dyn RunStore>);
        let schedules = self
            .schedules
            .unwrap_or_else(|| fallback.clone() as Arc<dyn ScheduleStore>);
        let clients = self
            .clients
            .unwrap_or_else(|| fallback.clone() as Arc<dyn ClientDirectory>);
        let settings = self.settings.unwrap_or(fallback as Arc<dyn SettingsStore>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LoggingNotifier) as Arc<dyn Notifier>);
        let restore = self.restore.unwrap_or_else(|| self.config.restore_engine());

        let registry = Arc::new(RunRegistry::new(self.config.max_parallel_backups));
        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&registry),
            targets,
            Arc::clone(&runs),
            notifier,
            self.config.executor_settings(),
        ));
        let scheduler = Arc::new(Scheduler::new(executor, schedules, clients));

        let orchestrator = BackupOrchestrator {
            config: self.config,
            registry,
            scheduler,
            runs,
            settings,
            verifier: IntegrityVerifier::new(),
            restore,
        };
        orchestrator.scheduler.load().await?;
        orchestrator.reload_concurrency_ceiling().await?;
        Ok(orchestrator)
    }
}

/// Background scheduler loop started by [`BackupOrchestrator::spawn_scheduler`]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for the loop to exit; runs already dispatched keep going
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        Ok(())
    }
}

impl BackupOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn start_manual_backup(
        &self,
        client_names: &[String],
        backup_type: BackupType,
        requested_by: &str,
    ) -> Result<ManualBackupResponse> {
        self.scheduler
            .start_manual_backup(client_names, backup_type, requested_by)
            .await
    }

    pub async fn start_manual_backup_for_client(
        &self,
        client_id: &str,
        options: ManualBackupOptions,
    ) -> Result<RunId> {
        let dispatched = self
            .scheduler
            .start_manual_backup_for_client(client_id, options)
            .await?;
        Ok(dispatched.run.id)
    }

    pub fn get_running_backups(&self) -> Vec<BackupRun> {
        self.scheduler.get_running_backups()
    }

    pub fn get_schedule_status(&self) -> ScheduleStatus {
        self.scheduler.get_schedule_status()
    }

    pub async fn add_custom_schedule(&self, schedule: NewSchedule) -> Result<ScheduleDefinition> {
        self.scheduler.add_custom_schedule(schedule).await
    }

    pub async fn remove_schedule(&self, name: &str) -> Result<bool> {
        self.scheduler.remove_schedule(name).await
    }

    /// Active runs come from the registry, finished ones from the run store
    pub async fn get_run(&self, run_id: &str) -> Result<BackupRun> {
        if let Some(run) = self.registry.get(run_id) {
            return Ok(run);
        }
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
    }

    /// Check a completed run's artifact on the blocking pool
    pub async fn verify_backup_integrity(&self, run_id: &str) -> Result<VerificationReport> {
        let run = self.get_run(run_id).await?;
        let verifier = self.verifier;
        tokio::task::spawn_blocking(move || verifier.verify(&run)).await?
    }

    pub async fn perform_restore(
        &self,
        run_id: &str,
        destination: impl AsRef<Path>,
        verify: bool,
    ) -> Result<RestoreResult> {
        let run = self.get_run(run_id).await?;
        self.restore.restore(&run, destination.as_ref(), verify).await
    }

    /// Apply the ceiling from the settings store, falling back to the configured one
    pub async fn reload_concurrency_ceiling(&self) -> Result<usize> {
        let ceiling = match self.settings.get_setting(MAX_PARALLEL_BACKUPS_KEY).await? {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => value,
                _ => {
                    return Err(OrchestratorError::Configuration(format!(
                        "setting {} has invalid value '{}'",
                        MAX_PARALLEL_BACKUPS_KEY, raw
                    )))
                }
            },
            None => self.config.max_parallel_backups,
        };
        self.registry.set_ceiling(ceiling);
        Ok(ceiling)
    }

    /// Start the timer-driven scheduler loop
    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let scheduler = Arc::clone(&self.scheduler);
        let interval = self.config.tick_interval();
        info!(interval_secs = interval.as_secs(), "Spawning scheduler loop");
        let task = tokio::spawn(scheduler.run(interval, receiver));
        SchedulerHandle { shutdown, task }
    }

    /// Prometheus text exposition of every registered metric
    pub fn metrics_text(&self) -> anyhow::Result<String> {
        metrics::gather_text().map_err(|e| {
            warn!(error = %e, "Failed to encode metrics");
            anyhow::anyhow!(e)
        })
    }
}
