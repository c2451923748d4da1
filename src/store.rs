//! Persistence collaborators
//!
//! Run records, schedule definitions, the client directory and runtime
//! settings live behind these traits. [`MemoryStore`] implements all of them
//! for tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::{BackupRun, Client, RunId, ScheduleDefinition};

/// Settings key holding the concurrency ceiling
pub const MAX_PARALLEL_BACKUPS_KEY: &str = "max_parallel_backups";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace a run record
    async fn save_run(&self, run: &BackupRun) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<BackupRun>, StoreError>;

    /// Runs for one client, newest first
    async fn list_runs(&self, client_name: &str) -> Result<Vec<BackupRun>, StoreError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new definition; names are unique
    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), StoreError>;

    /// Returns false when no schedule had that name
    async fn delete_schedule(&self, name: &str) -> Result<bool, StoreError>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, StoreError>;
}

#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, StoreError>;

    async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>, StoreError>;

    async fn list_active_clients(&self) -> Result<Vec<Client>, StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-memory store backed by concurrent maps
#[derive(Clone, Default)]
pub struct MemoryStore {
    runs: Arc<DashMap<RunId, BackupRun>>,
    schedules: Arc<DashMap<String, ScheduleDefinition>>,
    clients: Arc<DashMap<String, Client>>,
    settings: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client in the directory, replacing any with the same id
    pub fn add_client(&self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &BackupRun) -> Result<(), StoreError> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<BackupRun>, StoreError> {
        Ok(self.runs.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn list_runs(&self, client_name: &str) -> Result<Vec<BackupRun>, StoreError> {
        let mut runs: Vec<BackupRun> = self
            .runs
            .iter()
            .filter(|entry| entry.client_name == client_name)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), StoreError> {
        match self.schedules.entry(schedule.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Conflict(schedule.name.clone())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(schedule.clone());
                Ok(())
            }
        }
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.schedules.remove(name).is_some())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, StoreError> {
        let mut schedules: Vec<ScheduleDefinition> =
            self.schedules.iter().map(|entry| entry.value().clone()).collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }
}

#[async_trait]
impl ClientDirectory for MemoryStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.get(client_id).map(|entry| entry.value().clone()))
    }

    async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>, StoreError> {
        Ok(self
            .clients
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value().clone()))
    }

    async fn list_active_clients(&self) -> Result<Vec<Client>, StoreError> {
        let mut clients: Vec<Client> = self
            .clients
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.value().clone())
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.settings.get(key).map(|entry| entry.value().clone()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupType, Credentials, OsType, Trigger};
    use chrono::Utc;

    fn client(id: &str, name: &str, active: bool) -> Client {
        Client {
            id: id.to_string(),
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            os_type: OsType::Linux,
            credentials: Credentials::new("backup", "secret"),
            folders: vec![],
            active,
        }
    }

    #[tokio::test]
    async fn test_schedule_names_are_unique() {
        let store = MemoryStore::new();
        let schedule = ScheduleDefinition {
            name: "nightly".into(),
            cron_expression: "0 2 * * *".into(),
            backup_type: BackupType::Full,
            client_names: vec![],
            description: String::new(),
            owner_id: None,
            created_at: Utc::now(),
        };
        store.insert_schedule(&schedule).await.unwrap();
        assert_eq!(
            store.insert_schedule(&schedule).await,
            Err(StoreError::Conflict("nightly".into()))
        );
        assert!(store.delete_schedule("nightly").await.unwrap());
        assert!(!store.delete_schedule("nightly").await.unwrap());
    }

    #[tokio::test]
    async fn test_only_active_clients_are_listed() {
        let store = MemoryStore::new();
        store.add_client(client("1", "web", true));
        store.add_client(client("2", "old-db", false));

        let active = store.list_active_clients().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "web");
        assert!(store.find_client_by_name("old-db").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_run_replaces_record() {
        let store = MemoryStore::new();
        let mut run = BackupRun::new("web", BackupType::Full, Trigger::Manual("ops".into()));
        store.save_run(&run).await.unwrap();
        run.error = Some("boom".into());
        store.save_run(&run).await.unwrap();

        assert_eq!(store.run_count(), 1);
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.error.as_deref(), Some("boom"));
    }
}
