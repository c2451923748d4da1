//! Scheduler
//!
//! Schedules carry no state of their own: every tick re-evaluates each
//! definition against the current minute and dispatches through the same
//! admission path as manual requests. The definition set is an immutable
//! snapshot swapped wholesale on add/remove.

pub mod cron;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::executor::{DispatchedRun, JobExecutor};
use crate::model::{BackupRun, BackupType, Client, RunId, ScheduleDefinition, Trigger};
use crate::registry::Rejection;
use crate::store::{ClientDirectory, ScheduleStore, StoreError};
use crate::{OrchestratorError, Result};

pub use self::cron::{truncate_to_minute, CronError, CronSchedule};

/// A definition paired with its parsed expression
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub definition: ScheduleDefinition,
    pub cron: CronSchedule,
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickReport {
    /// Schedules that matched the tick minute
    pub fired: Vec<String>,
    pub dispatched: Vec<DispatchedRun>,
    /// Clients denied admission; picked up again on the next matching tick
    pub rejected: Vec<(String, Rejection)>,
    /// Named clients that are unknown or inactive
    pub unresolved: Vec<String>,
}

/// Fields supplied when registering a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub client_names: Vec<String>,
    pub owner_id: Option<String>,
}

/// Per-client result of a manual request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ManualOutcome {
    Started { client_name: String, run_id: RunId },
    Rejected { client_name: String, reason: String },
    NotFound { client_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualBackupResponse {
    /// Identifies this request across its per-client runs
    pub request_id: String,
    pub outcomes: Vec<ManualOutcome>,
}

impl ManualBackupResponse {
    pub fn started_run_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                ManualOutcome::Started { run_id, .. } => Some(run_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualBackupOptions {
    pub backup_type: Option<BackupType>,
    pub requested_by: String,
    /// Overrides the client's configured folders for this run only
    pub folders: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(flatten)]
    pub definition: ScheduleDefinition,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub schedules: Vec<ScheduleEntry>,
    pub running: Vec<BackupRun>,
}

pub struct Scheduler {
    executor: Arc<JobExecutor>,
    schedule_store: Arc<dyn ScheduleStore>,
    clients: Arc<dyn ClientDirectory>,
    jobs: ArcSwap<Vec<Arc<ScheduledJob>>>,
    /// Minute each schedule last fired, so repeated ticks in one minute are no-ops
    last_fired: DashMap<String, DateTime<Utc>>,
    /// Serializes add/remove so snapshots are never built from stale state
    write_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        executor: Arc<JobExecutor>,
        schedule_store: Arc<dyn ScheduleStore>,
        clients: Arc<dyn ClientDirectory>,
    ) -> Self {
        Self {
            executor,
            schedule_store,
            clients,
            jobs: ArcSwap::from_pointee(Vec::new()),
            last_fired: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Rebuild the snapshot from the schedule store.
    ///
    /// Stored definitions whose expressions no longer parse are skipped.
    pub async fn load(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let definitions = self.schedule_store.list_schedules().await?;
        let mut jobs = Vec::with_capacity(definitions.len());
        for definition in definitions {
            match CronSchedule::parse(&definition.cron_expression) {
                Ok(cron) => jobs.push(Arc::new(ScheduledJob { definition, cron })),
                Err(e) => error!(schedule = %definition.name, error = %e, "Skipping unparseable schedule"),
            }
        }
        let count = jobs.len();
        self.jobs.store(Arc::new(jobs));
        info!(schedules = count, "Schedules loaded");
        Ok(count)
    }

    pub fn schedules(&self) -> Vec<ScheduleDefinition> {
        self.jobs.load().iter().map(|job| job.definition.clone()).collect()
    }

    /// Evaluate every schedule against the minute containing `now`
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let minute = truncate_to_minute(now);
        let snapshot = self.jobs.load_full();
        let mut report = TickReport::default();

        for job in snapshot.iter() {
            let name = &job.definition.name;
            if !job.cron.is_due(minute) {
                continue;
            }
            if self.last_fired.get(name).map(|fired| *fired == minute).unwrap_or(false) {
                debug!(schedule = %name, "Already fired this minute");
                continue;
            }
            self.last_fired.insert(name.clone(), minute);
            report.fired.push(name.clone());

            let clients = match self.resolve_clients(&job.definition.client_names).await {
                Ok((clients, unresolved)) => {
                    for client_name in &unresolved {
                        warn!(schedule = %name, client = %client_name, "Scheduled client is unknown or inactive");
                    }
                    report.unresolved.extend(unresolved);
                    clients
                }
                Err(e) => {
                    error!(schedule = %name, error = %e, "Could not resolve clients for schedule");
                    continue;
                }
            };

            for client in clients {
                let client_name = client.name.clone();
                match self.executor.dispatch(
                    client,
                    job.definition.backup_type,
                    Trigger::Schedule(name.clone()),
                ) {
                    Ok(dispatched) => {
                        info!(schedule = %name, client = %client_name, run_id = %dispatched.run.id, "Scheduled backup dispatched");
                        report.dispatched.push(dispatched);
                    }
                    Err(rejection) => {
                        debug!(schedule = %name, client = %client_name, reason = %rejection, "Scheduled backup skipped");
                        report.rejected.push((client_name, rejection));
                    }
                }
            }
        }

        report
    }

    /// Tick every `interval` until `shutdown` flips to true or its sender drops
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Scheduler loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.fired.is_empty() {
                        info!(
                            fired = report.fired.len(),
                            dispatched = report.dispatched.len(),
                            rejected = report.rejected.len(),
                            "Scheduler tick"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler loop stopped");
    }

    /// Start runs for the named clients; each client is admitted independently
    #[instrument(skip(self))]
    pub async fn start_manual_backup(
        &self,
        client_names: &[String],
        backup_type: BackupType,
        requested_by: &str,
    ) -> Result<ManualBackupResponse> {
        if client_names.is_empty() {
            return Err(OrchestratorError::Configuration(
                "manual backup requires at least one client".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut outcomes = Vec::with_capacity(client_names.len());
        for client_name in client_names {
            if !seen.insert(client_name.as_str()) {
                continue;
            }
            let client = match self.clients.find_client_by_name(client_name).await? {
                Some(client) if client.active => client,
                _ => {
                    outcomes.push(ManualOutcome::NotFound {
                        client_name: client_name.clone(),
                    });
                    continue;
                }
            };
            outcomes.push(
                match self
                    .executor
                    .dispatch(client, backup_type, Trigger::Manual(requested_by.to_string()))
                {
                    Ok(dispatched) => ManualOutcome::Started {
                        client_name: client_name.clone(),
                        run_id: dispatched.run.id,
                    },
                    Err(rejection) => ManualOutcome::Rejected {
                        client_name: client_name.clone(),
                        reason: rejection.to_string(),
                    },
                },
            );
        }

        Ok(ManualBackupResponse {
            request_id: uuid::Uuid::new_v4().to_string(),
            outcomes,
        })
    }

    /// Start one run for a client looked up by id
    pub async fn start_manual_backup_for_client(
        &self,
        client_id: &str,
        options: ManualBackupOptions,
    ) -> Result<DispatchedRun> {
        let mut client = self
            .clients
            .get_client(client_id)
            .await?
            .ok_or_else(|| OrchestratorError::Configuration(format!("unknown client id '{}'", client_id)))?;
        if !client.active {
            return Err(OrchestratorError::Configuration(format!(
                "client '{}' is not active",
                client.name
            )));
        }
        if let Some(folders) = options.folders {
            client.folders = folders;
        }

        let backup_type = options.backup_type.unwrap_or(BackupType::Full);
        let dispatched = self
            .executor
            .dispatch(client, backup_type, Trigger::Manual(options.requested_by))?;
        Ok(dispatched)
    }

    /// Validate, persist and activate a new schedule
    pub async fn add_custom_schedule(&self, new: NewSchedule) -> Result<ScheduleDefinition> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(OrchestratorError::Configuration("schedule name is required".to_string()));
        }
        let cron = CronSchedule::parse(&new.cron_expression)?;

        let _guard = self.write_lock.lock().await;
        if self.jobs.load().iter().any(|job| job.definition.name == name) {
            return Err(OrchestratorError::Configuration(format!(
                "schedule '{}' already exists",
                name
            )));
        }

        let definition = ScheduleDefinition {
            name: name.to_string(),
            cron_expression: cron.expression().to_string(),
            backup_type: new.backup_type,
            client_names: new.client_names,
            description: new.description,
            owner_id: new.owner_id,
            created_at: Utc::now(),
        };
        self.schedule_store
            .insert_schedule(&definition)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(name) => {
                    OrchestratorError::Configuration(format!("schedule '{}' already exists", name))
                }
                other => OrchestratorError::Store(other),
            })?;

        let mut jobs: Vec<Arc<ScheduledJob>> = self.jobs.load().iter().cloned().collect();
        jobs.push(Arc::new(ScheduledJob {
            definition: definition.clone(),
            cron,
        }));
        self.jobs.store(Arc::new(jobs));

        info!(schedule = %definition.name, cron = %definition.cron_expression, "Schedule added");
        Ok(definition)
    }

    /// Returns false when no schedule had that name
    pub async fn remove_schedule(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let stored = self.schedule_store.delete_schedule(name).await?;

        let current = self.jobs.load_full();
        let remaining: Vec<Arc<ScheduledJob>> = current
            .iter()
            .filter(|job| job.definition.name != name)
            .cloned()
            .collect();
        let active = remaining.len() != current.len();
        if active {
            self.jobs.store(Arc::new(remaining));
        }
        self.last_fired.remove(name);

        if stored || active {
            info!(schedule = %name, "Schedule removed");
        }
        Ok(stored || active)
    }

    pub fn get_schedule_status(&self) -> ScheduleStatus {
        let now = Utc::now();
        let schedules = self
            .jobs
            .load()
            .iter()
            .map(|job| ScheduleEntry {
                definition: job.definition.clone(),
                next_run: job.cron.next_after(now),
            })
            .collect();
        ScheduleStatus {
            schedules,
            running: self.get_running_backups(),
        }
    }

    pub fn get_running_backups(&self) -> Vec<BackupRun> {
        self.executor.registry().list_running()
    }

    async fn resolve_clients(&self, names: &[String]) -> Result<(Vec<Client>, Vec<String>)> {
        if names.is_empty() {
            return Ok((self.clients.list_active_clients().await?, Vec::new()));
        }

        let mut seen = HashSet::new();
        let mut clients = Vec::new();
        let mut unresolved = Vec::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match self.clients.find_client_by_name(name).await? {
                Some(client) if client.active => clients.push(client),
                _ => unresolved.push(name.clone()),
            }
        }
        Ok((clients, unresolved))
    }
}
