use crate::model::{RunnerIdentity, RunnerMetadata};
use crate::platform::{
    Credential, PlatformError, PlatformProvider, PlatformRunner, PlatformRunnerHealth,
    RunnersHealthResponse,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

const PENDING_STATUS: &str = "PENDING";

/// Job-dispatcher backend. One registration per job id; the dispatcher has no
/// listing API, so bulk health is a per-identity fan-in and ghosts can never
/// be reported.
pub struct JobManagerPlatform {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct TokenRequest {
    job_id: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct JobHealth {
    status: Option<String>,
    #[serde(default)]
    deletable: bool,
}

#[derive(Deserialize)]
struct Job {
    status: Option<String>,
}

impl JobManagerPlatform {
    pub fn new(base_url: &str, token: &str) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PlatformError::Permanent(format!("failed to build client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn job_id(metadata: &RunnerMetadata) -> Result<i64, PlatformError> {
        let id = metadata
            .runner_id
            .as_deref()
            .ok_or_else(|| PlatformError::Permanent("metadata carries no job id".into()))?;
        id.parse::<i64>()
            .map_err(|_| PlatformError::Permanent(format!("job id {id:?} is not numeric")))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, format!("{}{path}", self.base_url));
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    async fn job_health(&self, job_id: i64) -> Result<Option<JobHealth>, PlatformError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/jobs/{job_id}/health"))
            .send()
            .await
            .map_err(classify_request)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response)?;
        let health: JobHealth = response.json().await.map_err(classify_request)?;
        Ok(Some(health))
    }
}

fn classify_request(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() || err.is_connect() {
        PlatformError::Transient(err.to_string())
    } else {
        PlatformError::Permanent(err.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() || status.as_u16() == 429 {
        Err(PlatformError::Transient(format!("dispatcher replied {status}")))
    } else {
        Err(PlatformError::Permanent(format!("dispatcher replied {status}")))
    }
}

fn health_from_job(identity: &RunnerIdentity, job: &JobHealth) -> PlatformRunnerHealth {
    // A pending job means the runner never came up; a deletable one has been
    // released by the dispatcher.
    let online = matches!(job.status.as_deref(), Some(status) if status != PENDING_STATUS);
    PlatformRunnerHealth {
        identity: identity.clone(),
        online,
        busy: !job.deletable,
        deletable: job.deletable,
    }
}

#[async_trait]
impl PlatformProvider for JobManagerPlatform {
    #[instrument(skip(self, _labels), fields(name = %identity.instance_id))]
    async fn issue_credential(
        &self,
        identity: &RunnerIdentity,
        _labels: &[String],
    ) -> Result<(Credential, PlatformRunner), PlatformError> {
        let job_id = Self::job_id(&identity.metadata)?;
        let response = self
            .request(reqwest::Method::POST, &format!("/v1/jobs/{job_id}/token"))
            .json(&TokenRequest { job_id })
            .send()
            .await
            .map_err(classify_request)?;
        let response = check_status(response)?;
        let token: TokenResponse = response.json().await.map_err(classify_request)?;
        let Some(token) = token.token.filter(|token| !token.is_empty()) else {
            return Err(PlatformError::Permanent(
                "empty token from the dispatcher API".into(),
            ));
        };
        Ok((
            Credential::new(token),
            PlatformRunner {
                identity: identity.clone(),
            },
        ))
    }

    async fn get_runner_health(
        &self,
        identity: &RunnerIdentity,
    ) -> Result<PlatformRunnerHealth, PlatformError> {
        let job_id = Self::job_id(&identity.metadata)?;
        Ok(match self.job_health(job_id).await? {
            Some(job) => health_from_job(identity, &job),
            None => PlatformRunnerHealth::not_found(identity.clone()),
        })
    }

    async fn get_runners_health(
        &self,
        identities: &[RunnerIdentity],
    ) -> Result<RunnersHealthResponse, PlatformError> {
        let mut response = RunnersHealthResponse::default();
        for identity in identities {
            match self.get_runner_health(identity).await {
                Ok(health) => response.requested.push(health),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, name = %identity.instance_id, "health query failed");
                    response.failed_requested.push(identity.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }

    async fn delete_runner(&self, identity: &RunnerIdentity) -> Result<(), PlatformError> {
        // The dispatcher reaps its own registrations when a job finishes.
        tracing::warn!(name = %identity.instance_id, "dispatcher has no runner deletion API, skipping");
        Ok(())
    }

    #[instrument(skip(self, metadata))]
    async fn check_job_dispatched(
        &self,
        metadata: &RunnerMetadata,
        job_url: &str,
    ) -> Result<bool, PlatformError> {
        let _ = job_url;
        let job_id = Self::job_id(metadata)?;
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/jobs/{job_id}"))
            .send()
            .await
            .map_err(classify_request)?;
        let response = check_status(response)?;
        let job: Job = response.json().await.map_err(classify_request)?;
        Ok(matches!(job.status.as_deref(), Some(status) if status != PENDING_STATUS))
    }

    async fn get_removal_token(&self) -> Result<String, PlatformError> {
        Err(PlatformError::Permanent(
            "the dispatcher does not issue removal tokens".into(),
        ))
    }
}
