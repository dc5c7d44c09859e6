use crate::model::{InstanceId, RunnerIdentity, RunnerMetadata};
use crate::platform::{
    Credential, PlatformError, PlatformProvider, PlatformRunner, PlatformRunnerHealth,
    RunnersHealthResponse,
};
use async_trait::async_trait;
use octocrab::{
    Octocrab,
    models::{RunnerGroupId, RunnerId, actions::SelfHostedRunner},
};
use serde::Deserialize;
use tracing::instrument;

const ONLINE_STATUS: &str = "online";

/// Hosted-VCS backend: runners register against a GitHub organization with a
/// just-in-time config as the one-time credential.
pub struct GitHubPlatform {
    org: String,
    token: String,
    prefix: String,
    group_id: u64,
}

#[derive(Deserialize)]
struct RemovalToken {
    token: String,
}

impl GitHubPlatform {
    pub fn new(org: &str, token: &str, prefix: &str, group_id: u64) -> Self {
        Self {
            org: org.to_string(),
            token: token.to_string(),
            prefix: prefix.to_string(),
            group_id,
        }
    }

    fn client(&self) -> Result<Octocrab, PlatformError> {
        octocrab::OctocrabBuilder::default()
            .personal_token(self.token.clone())
            .build()
            .map_err(classify)
    }

    #[instrument(skip(self), fields(org = %self.org))]
    async fn list_runners(&self) -> Result<Vec<SelfHostedRunner>, PlatformError> {
        let octocrab = self.client()?;
        let scope = format!("{}-", self.prefix);
        let mut runners = vec![];

        let mut page = octocrab
            .actions()
            .list_org_self_hosted_runners(&self.org)
            .send()
            .await
            .map_err(classify)?;

        loop {
            for runner in &page.items {
                if runner.name.starts_with(&scope) {
                    runners.push(runner.clone());
                }
            }

            page = match octocrab.get_page(&page.next).await.map_err(classify)? {
                Some(next_page) => next_page,
                None => break,
            };
        }

        Ok(runners)
    }

    fn health_from_runner(
        identity: &RunnerIdentity,
        runner: &SelfHostedRunner,
    ) -> PlatformRunnerHealth {
        PlatformRunnerHealth {
            identity: RunnerIdentity {
                instance_id: identity.instance_id.clone(),
                metadata: identity.metadata.with_runner_id(runner.id.to_string()),
            },
            online: runner.status.as_str() == ONLINE_STATUS,
            busy: runner.busy,
            // GitHub reaps finished ephemeral runners itself; there is no
            // released-but-listed state to report.
            deletable: false,
        }
    }
}

fn classify(err: octocrab::Error) -> PlatformError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code;
            if status.is_server_error() || status.as_u16() == 429 {
                PlatformError::Transient(err.to_string())
            } else {
                PlatformError::Permanent(err.to_string())
            }
        }
        _ => PlatformError::Transient(err.to_string()),
    }
}

fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(err, octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404)
}

#[async_trait]
impl PlatformProvider for GitHubPlatform {
    #[instrument(skip(self, labels), fields(org = %self.org, name = %identity.instance_id))]
    async fn issue_credential(
        &self,
        identity: &RunnerIdentity,
        labels: &[String],
    ) -> Result<(Credential, PlatformRunner), PlatformError> {
        let octocrab = self.client()?;
        let jitconfig = octocrab
            .actions()
            .create_org_jit_runner_config(
                &self.org,
                identity.instance_id.to_string(),
                RunnerGroupId(self.group_id),
                labels.to_vec(),
            )
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to generate runner jitconfig");
                classify(e)
            })?;

        tracing::info!(runner_id = %jitconfig.runner.id, "successfully generated runner jitconfig");
        let registered = PlatformRunner {
            identity: RunnerIdentity {
                instance_id: identity.instance_id.clone(),
                metadata: identity.metadata.with_runner_id(jitconfig.runner.id.to_string()),
            },
        };
        Ok((Credential::new(jitconfig.encoded_jit_config), registered))
    }

    async fn get_runner_health(
        &self,
        identity: &RunnerIdentity,
    ) -> Result<PlatformRunnerHealth, PlatformError> {
        let name = identity.instance_id.to_string();
        let runners = self.list_runners().await?;
        Ok(runners
            .iter()
            .find(|runner| runner.name == name)
            .map(|runner| Self::health_from_runner(identity, runner))
            .unwrap_or_else(|| PlatformRunnerHealth::not_found(identity.clone())))
    }

    async fn get_runners_health(
        &self,
        identities: &[RunnerIdentity],
    ) -> Result<RunnersHealthResponse, PlatformError> {
        let runners = self.list_runners().await?;

        let mut response = RunnersHealthResponse::default();
        for identity in identities {
            let name = identity.instance_id.to_string();
            match runners.iter().find(|runner| runner.name == name) {
                Some(runner) => response
                    .requested
                    .push(Self::health_from_runner(identity, runner)),
                None => response
                    .requested
                    .push(PlatformRunnerHealth::not_found(identity.clone())),
            }
        }

        for runner in &runners {
            let requested = identities
                .iter()
                .any(|identity| identity.instance_id.to_string() == runner.name);
            if requested {
                continue;
            }
            match InstanceId::parse(&runner.name) {
                Ok(instance_id) => response.non_requested.push(RunnerIdentity {
                    instance_id,
                    metadata: RunnerMetadata {
                        platform: crate::model::PlatformKind::HostedVcs,
                        runner_id: Some(runner.id.to_string()),
                        url: String::new(),
                    },
                }),
                Err(e) => {
                    tracing::warn!(error = %e, runner = %runner.name, "ignoring runner with unparsable name")
                }
            }
        }

        Ok(response)
    }

    #[instrument(skip(self), fields(org = %self.org, name = %identity.instance_id))]
    async fn delete_runner(&self, identity: &RunnerIdentity) -> Result<(), PlatformError> {
        let octocrab = self.client()?;
        let runner_id = match &identity.metadata.runner_id {
            Some(id) => id.parse::<u64>().ok(),
            None => None,
        };
        let runner_id = match runner_id {
            Some(id) => Some(RunnerId(id)),
            None => {
                let name = identity.instance_id.to_string();
                self.list_runners()
                    .await?
                    .iter()
                    .find(|runner| runner.name == name)
                    .map(|runner| runner.id)
            }
        };
        let Some(runner_id) = runner_id else {
            tracing::debug!("runner already absent from the platform");
            return Ok(());
        };

        match octocrab
            .actions()
            .delete_org_runner(&self.org, runner_id)
            .await
        {
            Ok(()) => {
                tracing::info!("successfully deleted platform runner");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "failed to delete platform runner");
                Err(classify(e))
            }
        }
    }

    #[instrument(skip(self, metadata))]
    async fn check_job_dispatched(
        &self,
        metadata: &RunnerMetadata,
        job_url: &str,
    ) -> Result<bool, PlatformError> {
        let _ = metadata;
        let url = reqwest::Url::parse(job_url)
            .map_err(|e| PlatformError::Permanent(format!("bad job url {job_url}: {e}")))?;
        let octocrab = self.client()?;
        let job: serde_json::Value = octocrab
            .get(url.path(), None::<&()>)
            .await
            .map_err(classify)?;
        Ok(job["status"].as_str() != Some("queued"))
    }

    async fn get_removal_token(&self) -> Result<String, PlatformError> {
        let octocrab = self.client()?;
        let token: RemovalToken = octocrab
            .post(
                format!("/orgs/{}/actions/runners/remove-token", self.org),
                None::<&()>,
            )
            .await
            .map_err(classify)?;
        Ok(token.token)
    }
}
