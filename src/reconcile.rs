use crate::cloud::{CloudRunnerInstance, CloudStatus};
use crate::manager::{ManagerError, RunnerManager};
use crate::metrics::MetricStats;
use crate::model::{InstanceId, Reactivity, RunnerIdentity, RunnerMetadata};
use crate::platform::{PlatformRunnerHealth, RunnersHealthResponse};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    /// The platform query failed transiently; never deleted in the current
    /// pass, retried next tick.
    Unknown,
}

#[derive(Clone, Copy, Debug)]
pub struct GracePeriods {
    pub startup: Duration,
    pub build: Duration,
}

/// The joined view the reconciler works on: what the cloud sees, what the
/// platform sees, and the verdict derived from both.
#[derive(Clone, Debug)]
pub struct RunnerInstance {
    pub identity: RunnerIdentity,
    pub cloud: CloudRunnerInstance,
    pub platform: Option<PlatformRunnerHealth>,
    pub verdict: HealthVerdict,
}

impl RunnerInstance {
    pub fn instance_id(&self) -> &InstanceId {
        &self.cloud.instance_id
    }

    pub fn is_online(&self) -> bool {
        self.platform.as_ref().is_some_and(|p| p.online)
    }

    pub fn is_busy(&self) -> bool {
        self.platform.as_ref().is_some_and(|p| p.busy)
    }

    pub fn is_idle_online(&self) -> bool {
        self.is_online() && !self.is_busy()
    }

    pub fn is_offline_healthy(&self) -> bool {
        !self.is_online() && self.verdict == HealthVerdict::Healthy
    }
}

pub fn verdict(
    cloud: &CloudRunnerInstance,
    platform: Option<&PlatformRunnerHealth>,
    query_failed: bool,
    grace: &GracePeriods,
    now: DateTime<Utc>,
) -> HealthVerdict {
    if query_failed {
        return HealthVerdict::Unknown;
    }
    // A missing creation timestamp counts as within grace: never reap a
    // runner for being young.
    let within = |limit: Duration| cloud.age(now).map(|age| age <= limit).unwrap_or(true);
    match cloud.status {
        CloudStatus::Error | CloudStatus::Stopped | CloudStatus::Deleted => {
            HealthVerdict::Unhealthy
        }
        CloudStatus::Unknown => HealthVerdict::Unknown,
        CloudStatus::Building => {
            if within(grace.build) {
                HealthVerdict::Healthy
            } else {
                HealthVerdict::Unhealthy
            }
        }
        CloudStatus::Active => match platform {
            Some(p) if p.deletable => HealthVerdict::Unhealthy,
            Some(p) if p.online => HealthVerdict::Healthy,
            // Offline (or unregistered): still booting until the startup
            // grace runs out.
            _ => {
                if within(grace.startup) {
                    HealthVerdict::Healthy
                } else {
                    HealthVerdict::Unhealthy
                }
            }
        },
    }
}

/// Compute the joined view from the two inventories. Identities come from the
/// platform where it knows the runner, otherwise from `metadata` with the
/// cloud-side name.
pub fn join(
    cloud_instances: Vec<CloudRunnerInstance>,
    health: &RunnersHealthResponse,
    metadata: &RunnerMetadata,
    grace: &GracePeriods,
    now: DateTime<Utc>,
) -> Vec<RunnerInstance> {
    cloud_instances
        .into_iter()
        .map(|cloud| {
            let platform = health.health_of(&cloud.instance_id).cloned();
            let query_failed = health.query_failed(&cloud.instance_id);
            let verdict = verdict(&cloud, platform.as_ref(), query_failed, grace, now);
            let identity = platform
                .as_ref()
                .map(|p| p.identity.clone())
                .unwrap_or_else(|| RunnerIdentity {
                    instance_id: cloud.instance_id.clone(),
                    metadata: metadata.clone(),
                });
            RunnerInstance {
                identity,
                cloud,
                platform,
                verdict,
            }
        })
        .collect()
}

/// Choose which runners a scale-down removes: offline-but-healthy first, then
/// idle online, then busy; newest first within each class so long-running
/// jobs are disturbed last. Runners with an UNKNOWN verdict are never picked.
pub fn pick_deletion_set(runners: &[RunnerInstance], count: usize) -> Vec<RunnerInstance> {
    let mut candidates: Vec<&RunnerInstance> = runners
        .iter()
        .filter(|runner| runner.verdict != HealthVerdict::Unknown)
        .collect();
    candidates.sort_by_key(|runner| {
        let rank = if runner.is_busy() {
            2
        } else if runner.is_online() {
            1
        } else {
            0
        };
        (
            rank,
            std::cmp::Reverse(runner.cloud.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC)),
        )
    });
    candidates.into_iter().take(count).cloned().collect()
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to reconcile runners: {0}")]
    Manager(#[from] ManagerError),

    #[error("failed to read the job queue: {0}")]
    Queue(String),
}

#[derive(Debug)]
pub struct ReconcileResult {
    pub diff: i64,
    pub stats: MetricStats,
}

/// Base-mode reconcile: cleanup, diff against the expected count, then create
/// or delete to converge.
pub async fn reconcile_base(
    manager: &RunnerManager,
    expected: u32,
) -> Result<ReconcileResult, ReconcileError> {
    let mut stats = manager.cleanup().await?;
    let runners = manager.list_runners().await?;
    tracing::info!(
        observed = runners.len(),
        expected,
        "reconciling runner count"
    );
    let diff = i64::from(expected) - runners.len() as i64;
    if diff > 0 {
        match manager
            .create_runners(diff as usize, manager.metadata(), Reactivity::NonReactive)
            .await
        {
            Ok(outcome) => stats.merge(&outcome.stats),
            Err(ManagerError::MissingServerConfig) => {
                tracing::error!(
                    "unable to spawn runners due to missing server configuration, such as image"
                );
            }
            Err(e) => return Err(e.into()),
        }
    } else if diff < 0 {
        let targets = pick_deletion_set(&runners, (-diff) as usize);
        let delete_stats = manager.delete_runners(&targets).await?;
        stats.merge(&delete_stats);
    } else {
        tracing::info!("no changes to the number of runners");
    }
    Ok(ReconcileResult { diff, stats })
}
