use crate::model::{InstanceId, RunnerIdentity, RunnerMetadata};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// One-time registration secret binding an InstanceId to the platform.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Keep the secret out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// The platform-side registration created alongside a credential. The
/// metadata inside carries the platform-assigned runner id.
#[derive(Clone, Debug)]
pub struct PlatformRunner {
    pub identity: RunnerIdentity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformRunnerHealth {
    pub identity: RunnerIdentity,
    pub online: bool,
    pub busy: bool,
    pub deletable: bool,
}

impl PlatformRunnerHealth {
    pub fn not_found(identity: RunnerIdentity) -> Self {
        Self {
            identity,
            online: false,
            busy: false,
            deletable: false,
        }
    }
}

/// Bulk health reply. `requested` holds the identities the platform resolved,
/// `failed_requested` the ones where the query failed transiently, and
/// `non_requested` registrations the platform reports that we did not ask
/// about (ghosts from half-finished creations).
#[derive(Clone, Debug, Default)]
pub struct RunnersHealthResponse {
    pub requested: Vec<PlatformRunnerHealth>,
    pub failed_requested: Vec<RunnerIdentity>,
    pub non_requested: Vec<RunnerIdentity>,
}

impl RunnersHealthResponse {
    pub fn all_failed(identities: impl IntoIterator<Item = RunnerIdentity>) -> Self {
        Self {
            failed_requested: identities.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn health_of(&self, instance_id: &InstanceId) -> Option<&PlatformRunnerHealth> {
        self.requested
            .iter()
            .find(|health| health.identity.instance_id == *instance_id)
    }

    pub fn query_failed(&self, instance_id: &InstanceId) -> bool {
        self.failed_requested
            .iter()
            .any(|identity| identity.instance_id == *instance_id)
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Worth retrying: the platform or the network hiccuped.
    #[error("transient platform failure: {0}")]
    Transient(String),

    /// Not worth retrying: the request itself cannot succeed.
    #[error("permanent platform failure: {0}")]
    Permanent(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_))
    }
}

#[async_trait]
pub trait PlatformProvider: Send + Sync {
    /// Mint a one-time registration credential bound to `identity`.
    async fn issue_credential(
        &self,
        identity: &RunnerIdentity,
        labels: &[String],
    ) -> Result<(Credential, PlatformRunner), PlatformError>;

    /// Health of a single runner. A registration the platform does not know
    /// comes back as an all-false health, not an error.
    async fn get_runner_health(
        &self,
        identity: &RunnerIdentity,
    ) -> Result<PlatformRunnerHealth, PlatformError>;

    async fn get_runners_health(
        &self,
        identities: &[RunnerIdentity],
    ) -> Result<RunnersHealthResponse, PlatformError>;

    /// Idempotent: deleting an unknown registration is a success.
    async fn delete_runner(&self, identity: &RunnerIdentity) -> Result<(), PlatformError>;

    async fn check_job_dispatched(
        &self,
        metadata: &RunnerMetadata,
        job_url: &str,
    ) -> Result<bool, PlatformError>;

    /// Token the in-VM agent uses to deregister itself on deletion.
    async fn get_removal_token(&self) -> Result<String, PlatformError>;
}
