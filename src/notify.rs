//! Outbound notification hook

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::model::{BackupRun, RunId};

/// Something operators may want to hear about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    RunStarted {
        run_id: RunId,
        client_name: String,
        backup_type: String,
    },
    RunSucceeded {
        run_id: RunId,
        client_name: String,
        size_mb: f64,
        duration_ms: u64,
    },
    RunFailed {
        run_id: RunId,
        client_name: String,
        error: String,
    },
    SystemAlert {
        message: String,
    },
}

impl NotificationEvent {
    pub fn started(run: &BackupRun) -> Self {
        Self::RunStarted {
            run_id: run.id.clone(),
            client_name: run.client_name.clone(),
            backup_type: run.backup_type.to_string(),
        }
    }

    /// Event for a run that reached a terminal status
    pub fn finished(run: &BackupRun) -> Self {
        match &run.error {
            Some(error) => Self::RunFailed {
                run_id: run.id.clone(),
                client_name: run.client_name.clone(),
                error: error.clone(),
            },
            None => Self::RunSucceeded {
                run_id: run.id.clone(),
                client_name: run.client_name.clone(),
                size_mb: run.size_mb,
                duration_ms: run.duration_ms.unwrap_or(0),
            },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Writes every event to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        match event {
            NotificationEvent::RunStarted { run_id, client_name, backup_type } => {
                info!(%run_id, client = %client_name, %backup_type, "Backup started");
            }
            NotificationEvent::RunSucceeded { run_id, client_name, size_mb, duration_ms } => {
                info!(%run_id, client = %client_name, size_mb, duration_ms, "Backup completed");
            }
            NotificationEvent::RunFailed { run_id, client_name, error } => {
                error!(%run_id, client = %client_name, %error, "Backup failed");
            }
            NotificationEvent::SystemAlert { message } => {
                warn!(%message, "System alert");
            }
        }
        Ok(())
    }
}

/// Deliver an event; delivery problems are logged and swallowed
pub async fn deliver(notifier: &dyn Notifier, event: NotificationEvent) {
    if let Err(e) = notifier.notify(&event).await {
        warn!(error = %e, ?event, "Notification delivery failed");
    }
}
