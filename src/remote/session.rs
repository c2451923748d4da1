use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CommandOutput, RemoteError, RemoteSession, Transport};
use crate::model::{Credentials, OsType};
use crate::retry::{ErrorCode, RetryCoordinator, RetryPolicy};

/// Session wrapper that routes every network call through the retry coordinator
pub struct SessionHandle {
    transport: Arc<dyn Transport>,
    os_type: OsType,
    coordinator: RetryCoordinator,
    session: Option<Arc<dyn RemoteSession>>,
}

impl SessionHandle {
    pub fn new(transport: Arc<dyn Transport>, os_type: OsType, policy: RetryPolicy) -> Self {
        Self {
            transport,
            os_type,
            coordinator: RetryCoordinator::new("remote", policy),
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub async fn open(&mut self, host: &str, port: u16, credentials: &Credentials) -> Result<(), RemoteError> {
        let transport = &self.transport;
        let os_type = self.os_type;
        let session = self
            .coordinator
            .execute(|| transport.open(host, port, credentials, os_type))
            .await?;
        debug!(host, port, os = %os_type, "Remote session opened");
        self.session = Some(session);
        Ok(())
    }

    fn session(&self) -> Result<&Arc<dyn RemoteSession>, RemoteError> {
        self.session.as_ref().ok_or_else(RemoteError::not_connected)
    }

    /// Run a command, retrying transport-level failures
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let session = self.session()?;
        self.coordinator.execute(|| session.exec(command)).await
    }

    /// Run a command and turn exit codes outside `accepted` into an error
    pub async fn exec_checked(&self, command: &str, accepted: impl Fn(i32) -> bool) -> Result<CommandOutput, RemoteError> {
        let output = self.exec(command).await?;
        if accepted(output.exit_code) {
            return Ok(output);
        }
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        Err(RemoteError::new(
            ErrorCode::CommandFailed,
            format!("command exited with status {}: {}", output.exit_code, detail),
        ))
    }

    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, RemoteError> {
        let session = self.session()?;
        self.coordinator
            .execute(|| session.download(remote_path, local_path))
            .await
    }

    /// Close the session; closing an already closed handle is a no-op
    pub async fn close(&mut self) -> Result<(), RemoteError> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Remote session did not close cleanly");
                return Err(e);
            }
        }
        Ok(())
    }
}
