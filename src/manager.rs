use crate::cloud::{CloudError, CloudProvider};
use crate::config::SupportConfig;
use crate::metrics::{Event, MetricSink, MetricStats, now_timestamp};
use crate::model::{InstanceId, Reactivity, RunnerIdentity, RunnerMetadata, owns};
use crate::platform::{PlatformProvider, RunnersHealthResponse};
use crate::reconcile::{GracePeriods, HealthVerdict, RunnerInstance, join};
use crate::retry::{RetryPolicy, with_backoff};
use crate::userdata;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

const RUNNER_WORKER_PROCESS: &str = "Runner.Worker";
const RUNNER_LISTENER_PROCESS: &str = "Runner.Listener";
const RUNNER_CONFIG_SCRIPT: &str = "/home/ubuntu/actions-runner/config.sh";

const SSH_RUN_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_REMOVE_TIMEOUT: Duration = Duration::from_secs(60);

const PLATFORM_RETRY: RetryPolicy = RetryPolicy {
    max_tries: 3,
    base_delay: Duration::from_secs(5),
    multiplier: 2,
    cap: Duration::from_secs(60),
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    Idle,
    Busy,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("missing server configuration to create runners")]
    MissingServerConfig,

    #[error("cloud inventory unavailable: {0}")]
    Cloud(String),

    #[error("refusing to act on runner {0} owned by another manager")]
    ForeignRunner(InstanceId),
}

#[derive(Debug, Default)]
pub struct CreateOutcome {
    pub ids: Vec<InstanceId>,
    pub stats: MetricStats,
}

pub struct RunnerManagerConfig {
    pub name: String,
    pub prefix: String,
    pub labels: Vec<String>,
    pub metadata: RunnerMetadata,
    pub support: SupportConfig,
    pub readiness_schedule: Vec<Duration>,
    pub create_concurrency: usize,
    pub grace: GracePeriods,
}

/// Drives one runner through its lifecycle: registration, launch, readiness,
/// deletion, and the garbage collection that keeps the two inventories from
/// drifting apart.
pub struct RunnerManager {
    config: RunnerManagerConfig,
    cloud: Arc<dyn CloudProvider>,
    platform: Arc<dyn PlatformProvider>,
    sink: Arc<dyn MetricSink>,
    http: reqwest::Client,
}

enum CreateOneOutcome {
    Ready(InstanceId, MetricStats),
    Failed,
    MissingConfig,
}

impl RunnerManager {
    pub fn new(
        config: RunnerManagerConfig,
        cloud: Arc<dyn CloudProvider>,
        platform: Arc<dyn PlatformProvider>,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            config,
            cloud,
            platform,
            sink,
            http: reqwest::Client::new(),
        }
    }

    pub fn metadata(&self) -> RunnerMetadata {
        self.config.metadata.clone()
    }

    fn identity_of(&self, instance_id: &InstanceId) -> RunnerIdentity {
        RunnerIdentity {
            instance_id: instance_id.clone(),
            metadata: self.config.metadata.clone(),
        }
    }

    fn emit(&self, event: Event, stats: &mut MetricStats) {
        let kind = event.kind();
        match self.sink.issue(event) {
            Ok(()) => stats.record(kind),
            Err(e) => tracing::error!(error = %e, "failed to issue metric event"),
        }
    }

    /// Cloud inventory joined with the platform's bulk health reply. A failed
    /// bulk query degrades every runner to UNKNOWN instead of failing the
    /// cycle.
    async fn inventory(
        &self,
    ) -> Result<(Vec<RunnerInstance>, RunnersHealthResponse), ManagerError> {
        let cloud_instances = self
            .cloud
            .list()
            .await
            .map_err(|e| ManagerError::Cloud(e.to_string()))?;
        let identities: Vec<RunnerIdentity> = cloud_instances
            .iter()
            .map(|instance| self.identity_of(&instance.instance_id))
            .collect();
        let health = match self.platform.get_runners_health(&identities).await {
            Ok(health) => health,
            Err(e) => {
                tracing::warn!(error = %e, "bulk health query failed, treating all runners as unknown");
                RunnersHealthResponse::all_failed(identities)
            }
        };
        let joined = join(
            cloud_instances,
            &health,
            &self.config.metadata,
            &self.config.grace,
            Utc::now(),
        );
        Ok((joined, health))
    }

    pub async fn list_runners(&self) -> Result<Vec<RunnerInstance>, ManagerError> {
        Ok(self.inventory().await?.0)
    }

    #[instrument(skip(self, metadata), fields(manager = %self.config.name))]
    pub async fn create_runners(
        &self,
        count: usize,
        metadata: RunnerMetadata,
        reactivity: Reactivity,
    ) -> Result<CreateOutcome, ManagerError> {
        let results = stream::iter(
            (0..count).map(|index| self.create_one(metadata.clone(), reactivity, index)),
        )
        .buffer_unordered(self.config.create_concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut outcome = CreateOutcome::default();
        let mut missing_config = false;
        for result in results {
            match result {
                CreateOneOutcome::Ready(instance_id, stats) => {
                    outcome.stats.merge(&stats);
                    outcome.ids.push(instance_id);
                }
                CreateOneOutcome::Failed => {}
                CreateOneOutcome::MissingConfig => missing_config = true,
            }
        }
        if missing_config {
            return Err(ManagerError::MissingServerConfig);
        }
        tracing::info!(
            requested = count,
            created = outcome.ids.len(),
            "completed runner creation"
        );
        Ok(outcome)
    }

    async fn create_one(
        &self,
        metadata: RunnerMetadata,
        reactivity: Reactivity,
        index: usize,
    ) -> CreateOneOutcome {
        let started = Instant::now();
        let instance_id = InstanceId::generate(&self.config.prefix, reactivity);
        let identity = RunnerIdentity {
            instance_id: instance_id.clone(),
            metadata,
        };
        tracing::info!(name = %instance_id, index, "creating runner");

        // Platform registration first: a failure here leaves nothing behind.
        let issued = with_backoff(PLATFORM_RETRY, "issue credential", || {
            self.platform.issue_credential(&identity, &self.config.labels)
        })
        .await;
        let (credential, registered) = match issued {
            Ok(issued) => issued,
            Err(e) => {
                tracing::error!(error = %e, name = %instance_id, "failed to issue registration credential");
                return CreateOneOutcome::Failed;
            }
        };
        let identity = registered.identity;

        let repo_policy_token = match self.repo_policy_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, name = %instance_id, "failed to get repo policy token");
                self.undo_registration(&identity).await;
                return CreateOneOutcome::Failed;
            }
        };

        let user_data =
            match userdata::Data::build(&credential, &self.config.support, repo_policy_token.as_deref())
                .to_user_data()
            {
                Ok(user_data) => user_data,
                Err(e) => {
                    tracing::error!(error = %e, name = %instance_id, "failed to render user data");
                    self.undo_registration(&identity).await;
                    return CreateOneOutcome::Failed;
                }
            };

        match self.cloud.launch(&instance_id, &user_data).await {
            Ok(_) => {}
            Err(CloudError::MissingServerConfig) => {
                self.undo_registration(&identity).await;
                return CreateOneOutcome::MissingConfig;
            }
            Err(e) => {
                tracing::error!(error = %e, name = %instance_id, "failed to launch server");
                self.undo_registration(&identity).await;
                return CreateOneOutcome::Failed;
            }
        }

        if !self.wait_runner_ready(&identity).await {
            tracing::warn!(name = %instance_id, "runner never became ready, reaping it");
            self.undo_registration(&identity).await;
            if let Err(e) = self.cloud.delete(&instance_id).await {
                tracing::warn!(error = %e, name = %instance_id, "failed to delete stillborn server");
            }
            return CreateOneOutcome::Failed;
        }

        let mut stats = MetricStats::default();
        self.emit(
            Event::RunnerInstalled {
                timestamp: now_timestamp(),
                flavor: self.config.name.clone(),
                instance_id: instance_id.to_string(),
                duration: started.elapsed().as_secs_f64(),
            },
            &mut stats,
        );
        self.emit(
            Event::RunnerStart {
                timestamp: now_timestamp(),
                flavor: self.config.name.clone(),
                instance_id: instance_id.to_string(),
            },
            &mut stats,
        );
        tracing::info!(name = %instance_id, "runner created successfully");
        CreateOneOutcome::Ready(instance_id, stats)
    }

    async fn undo_registration(&self, identity: &RunnerIdentity) {
        if let Err(e) = self.platform.delete_runner(identity).await {
            tracing::warn!(
                error = %e,
                name = %identity.instance_id,
                "failed to clean up platform registration after create failure"
            );
        }
    }

    /// Poll health against the bounded back-off schedule. Ready means the
    /// platform heard from the agent, or already released the runner because
    /// a short job finished before we looked.
    async fn wait_runner_ready(&self, identity: &RunnerIdentity) -> bool {
        for interval in &self.config.readiness_schedule {
            tokio::time::sleep(*interval).await;
            match self.platform.get_runner_health(identity).await {
                Ok(health) if health.online || health.deletable => return true,
                Ok(_) => {
                    tracing::debug!(name = %identity.instance_id, "runner not ready yet");
                }
                Err(e) => {
                    tracing::warn!(error = %e, name = %identity.instance_id, "readiness poll failed");
                }
            }
        }
        false
    }

    async fn repo_policy_token(&self) -> Result<Option<String>, String> {
        let Some(policy) = &self.config.support.repo_policy_compliance else {
            return Ok(None);
        };
        let response = self
            .http
            .post(format!("{}/one-time-token", policy.url.trim_end_matches('/')))
            .bearer_auth(&policy.token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("one-time-token endpoint replied {}", response.status()));
        }
        let token = response.text().await.map_err(|e| e.to_string())?;
        Ok(Some(token))
    }

    #[instrument(skip(self, targets), fields(manager = %self.config.name, count = targets.len()))]
    pub async fn delete_runners(
        &self,
        targets: &[RunnerInstance],
    ) -> Result<MetricStats, ManagerError> {
        for target in targets {
            if !owns(&self.config.prefix, target.instance_id()) {
                return Err(ManagerError::ForeignRunner(target.instance_id().clone()));
            }
        }

        let removal_token = match self.platform.get_removal_token().await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %e, "no removal token available, agents will not deregister themselves");
                None
            }
        };

        let futures: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = MetricStats> + Send + '_>>> =
            targets
                .iter()
                .map(|target| {
                    let removal_token = &removal_token;
                    Box::pin(async move { self.delete_one(target, removal_token.as_deref()).await })
                        as std::pin::Pin<Box<dyn std::future::Future<Output = MetricStats> + Send + '_>>
                })
                .collect();
        let results = stream::iter(futures)
            .buffer_unordered(self.config.create_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut stats = MetricStats::default();
        for result in results {
            stats.merge(&result);
        }
        Ok(stats)
    }

    async fn delete_one(&self, runner: &RunnerInstance, removal_token: Option<&str>) -> MetricStats {
        let instance_id = runner.instance_id().clone();
        tracing::info!(name = %instance_id, "deleting runner");

        match self.cloud.open_ssh(&runner.cloud).await {
            Ok(mut ssh) => {
                if let Some(token) = removal_token {
                    let command = format!("{RUNNER_CONFIG_SCRIPT} remove --token {token}");
                    match ssh.run(&command, SSH_REMOVE_TIMEOUT).await {
                        Ok(output) if output.ok() => {
                            tracing::debug!(name = %instance_id, "agent deregistered itself");
                        }
                        Ok(output) => {
                            tracing::warn!(
                                name = %instance_id,
                                exit_code = output.exit_code,
                                stderr = %output.stderr,
                                "agent removal script failed"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, name = %instance_id, "unable to run agent removal script");
                        }
                    }
                }
                let metrics_file = format!("{}/pre-job-start", userdata::METRICS_EXCHANGE_PATH);
                match ssh.read_file(&metrics_file, SSH_RUN_TIMEOUT).await {
                    Ok(contents) => {
                        tracing::debug!(name = %instance_id, bytes = contents.len(), "pulled metric files");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, name = %instance_id, "no metric files to pull");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, name = %instance_id, "SSH unavailable, forcing delete");
            }
        }

        if let Err(e) = self.cloud.delete(&instance_id).await {
            tracing::warn!(error = %e, name = %instance_id, "failed to delete server");
        }
        if let Err(e) = with_backoff(PLATFORM_RETRY, "delete runner", || {
            self.platform.delete_runner(&runner.identity)
        })
        .await
        {
            tracing::warn!(error = %e, name = %instance_id, "failed to delete platform registration");
        }

        let mut stats = MetricStats::default();
        self.emit(
            Event::RunnerStop {
                timestamp: now_timestamp(),
                flavor: self.config.name.clone(),
                instance_id: instance_id.to_string(),
            },
            &mut stats,
        );
        stats
    }

    #[instrument(skip(self), fields(manager = %self.config.name))]
    pub async fn flush_runners(&self, mode: FlushMode) -> Result<MetricStats, ManagerError> {
        let runners = self.list_runners().await?;
        for runner in &runners {
            if mode == FlushMode::Idle && runner.is_busy() {
                continue;
            }
            match self.cloud.open_ssh(&runner.cloud).await {
                Ok(mut ssh) => match ssh.run(&kill_command(mode), SSH_RUN_TIMEOUT).await {
                    Ok(output) => {
                        // The exit code of the kill chain reveals little; log
                        // the whole outcome instead of interpreting it.
                        tracing::info!(
                            name = %runner.instance_id(),
                            exit_code = output.exit_code,
                            stdout = %output.stdout,
                            stderr = %output.stderr,
                            "agent kill pass finished"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, name = %runner.instance_id(), "unable to kill agent processes");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, name = %runner.instance_id(), "SSH unavailable during flush");
                }
            }
        }
        self.cleanup().await
    }

    /// The garbage collector: platform ghosts first, then runners the joined
    /// verdict calls unhealthy, then cloud-side orphan resources. Everything
    /// is best-effort per runner; only a missing cloud inventory fails the
    /// call.
    #[instrument(skip(self), fields(manager = %self.config.name))]
    pub async fn cleanup(&self) -> Result<MetricStats, ManagerError> {
        let (runners, health) = self.inventory().await?;

        for ghost in &health.non_requested {
            if !owns(&self.config.prefix, &ghost.instance_id) {
                tracing::warn!(name = %ghost.instance_id, "ignoring ghost registration owned by another manager");
                continue;
            }
            tracing::info!(name = %ghost.instance_id, "deleting ghost platform registration");
            if let Err(e) = self.platform.delete_runner(ghost).await {
                tracing::warn!(error = %e, name = %ghost.instance_id, "failed to delete ghost registration");
            }
        }

        let unhealthy: Vec<RunnerInstance> = runners
            .iter()
            .filter(|runner| runner.verdict == HealthVerdict::Unhealthy)
            .cloned()
            .collect();
        let mut stats = MetricStats::default();
        if !unhealthy.is_empty() {
            tracing::info!(count = unhealthy.len(), "reaping unhealthy runners");
            stats.merge(&self.delete_runners(&unhealthy).await?);
        }

        if let Err(e) = self.cloud.cleanup().await {
            tracing::warn!(error = %e, "cloud resource cleanup failed");
        }
        Ok(stats)
    }
}

fn kill_command(mode: FlushMode) -> String {
    match mode {
        // Kill both the listener and any worker; this also takes down the
        // pre-job hook, a child of the worker.
        FlushMode::Busy => format!(
            "pgrep -x {RUNNER_LISTENER_PROCESS} && kill $(pgrep -x {RUNNER_LISTENER_PROCESS}); \
             pgrep -x {RUNNER_WORKER_PROCESS} && kill $(pgrep -x {RUNNER_WORKER_PROCESS});"
        ),
        // Only kill the listener when no worker is running.
        FlushMode::Idle => format!(
            "! pgrep -x {RUNNER_WORKER_PROCESS} && pgrep -x {RUNNER_LISTENER_PROCESS} && \
             kill $(pgrep -x {RUNNER_LISTENER_PROCESS})"
        ),
    }
}
