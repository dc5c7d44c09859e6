use crate::model::InstanceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudStatus {
    Building,
    Active,
    Stopped,
    Error,
    Deleted,
    Unknown,
}

impl CloudStatus {
    pub fn from_server_status(status: &str) -> Self {
        match status {
            "BUILD" | "BUILDING" | "REBUILD" => CloudStatus::Building,
            "ACTIVE" => CloudStatus::Active,
            "SHUTOFF" | "STOPPED" | "SUSPENDED" | "PAUSED" => CloudStatus::Stopped,
            "ERROR" => CloudStatus::Error,
            "DELETED" | "SOFT_DELETED" => CloudStatus::Deleted,
            _ => CloudStatus::Unknown,
        }
    }
}

/// The cloud's view of one runner VM.
#[derive(Clone, Debug)]
pub struct CloudRunnerInstance {
    pub instance_id: InstanceId,
    pub server_id: String,
    pub status: CloudStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub ssh_address: Option<String>,
}

impl CloudRunnerInstance {
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.created_at.map(|created| now - created)
    }
}

#[derive(Debug, Error)]
pub enum SshError {
    #[error("instance has no reachable address")]
    NoAddress,

    #[error("failed to open SSH connection to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake or authentication failed: {0}")]
    Auth(#[source] ssh2::Error),

    #[error("SSH command failed to execute: {0}")]
    Exec(#[source] ssh2::Error),

    #[error("SSH command exceeded {0:?}")]
    Timeout(Duration),

    #[error("SSH worker task failed: {0}")]
    Task(String),
}

#[derive(Debug)]
pub struct SshOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SshOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SshSession: Send {
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<SshOutput, SshError>;

    async fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>, SshError>;
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("missing server configuration (image/flavor/network) to create runners")]
    MissingServerConfig,

    #[error("failed to launch server for {instance_id}: {reason}")]
    Launch { instance_id: InstanceId, reason: String },

    #[error("failed to list servers: {0}")]
    List(String),

    #[error("failed to delete server {instance_id}: {reason}")]
    Delete { instance_id: InstanceId, reason: String },

    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// IaaS driver contract. Every operation is scoped to the manager prefix so
/// multiple managers can share one cloud project.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn prefix(&self) -> &str;

    async fn launch(
        &self,
        instance_id: &InstanceId,
        user_data: &str,
    ) -> Result<CloudRunnerInstance, CloudError>;

    async fn list(&self) -> Result<Vec<CloudRunnerInstance>, CloudError>;

    /// Idempotent: deleting a server the cloud no longer knows is a success.
    async fn delete(&self, instance_id: &InstanceId) -> Result<(), CloudError>;

    async fn open_ssh(
        &self,
        instance: &CloudRunnerInstance,
    ) -> Result<Box<dyn SshSession>, CloudError>;

    /// Reclaim orphan cloud resources carrying the manager prefix.
    async fn cleanup(&self) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_mapping() {
        assert_eq!(CloudStatus::from_server_status("ACTIVE"), CloudStatus::Active);
        assert_eq!(CloudStatus::from_server_status("BUILD"), CloudStatus::Building);
        assert_eq!(CloudStatus::from_server_status("BUILDING"), CloudStatus::Building);
        assert_eq!(CloudStatus::from_server_status("SHUTOFF"), CloudStatus::Stopped);
        assert_eq!(CloudStatus::from_server_status("ERROR"), CloudStatus::Error);
        assert_eq!(CloudStatus::from_server_status("DELETED"), CloudStatus::Deleted);
        assert_eq!(CloudStatus::from_server_status("MIGRATING"), CloudStatus::Unknown);
    }
}
