use crate::config::DispatchCheckConfig;
use crate::consumer::ConsumerContext;
use crate::lock::ReconcileLock;
use crate::manager::{FlushMode, ManagerError, RunnerManager};
use crate::metrics::{Event, EventKind, MetricSink, MetricStats, now_timestamp};
use crate::platform::PlatformProvider;
use crate::pool::ConsumerPool;
use crate::queue::JobQueue;
use crate::reconcile::{ReconcileError, RunnerInstance, reconcile_base};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub struct ScalerConfig {
    pub flavor: String,
    pub base_quantity: u32,
    pub max_quantity: u32,
    pub supported_labels: HashSet<String>,
    pub dispatch: DispatchCheckConfig,
}

/// Chooses between base-mode reconciliation and reactive consumer-pool
/// sizing, and issues the per-cycle Reconciliation metric either way.
pub struct RunnerScaler {
    config: ScalerConfig,
    manager: Arc<RunnerManager>,
    platform: Arc<dyn PlatformProvider>,
    queue: Option<Arc<dyn JobQueue>>,
    pool: ConsumerPool,
    lock: ReconcileLock,
    sink: Arc<dyn MetricSink>,
    cancel: CancellationToken,
}

impl RunnerScaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScalerConfig,
        manager: Arc<RunnerManager>,
        platform: Arc<dyn PlatformProvider>,
        queue: Option<Arc<dyn JobQueue>>,
        lock: ReconcileLock,
        sink: Arc<dyn MetricSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            platform,
            queue,
            pool: ConsumerPool::new(),
            lock,
            sink,
            cancel,
        }
    }

    /// One reconcile cycle. Returns the change applied: runners created or
    /// deleted in base mode, consumers spawned or stopped in reactive mode.
    #[instrument(skip(self), fields(flavor = %self.config.flavor))]
    pub async fn reconcile(&self) -> Result<i64, ReconcileError> {
        tracing::info!(
            base_quantity = self.config.base_quantity,
            max_quantity = self.config.max_quantity,
            "start reconcile"
        );
        let start = Instant::now();
        let result = self.reconcile_inner().await;
        // The metric goes out even when the cycle failed, so the log shows
        // the failed cycle's duration and observed population.
        let stats = match &result {
            Ok((_, stats)) => stats.clone(),
            Err(_) => MetricStats::default(),
        };
        self.issue_reconciliation_metric(&stats, start.elapsed())
            .await;
        tracing::info!("finished reconciliation");
        result.map(|(diff, _)| diff)
    }

    async fn reconcile_inner(&self) -> Result<(i64, MetricStats), ReconcileError> {
        if let Some(queue) = &self.queue {
            let depth = queue
                .depth()
                .await
                .map_err(|e| ReconcileError::Queue(e.to_string()))?;
            let runners = self.manager.list_runners().await?;
            let capacity = (self.config.max_quantity as usize).saturating_sub(runners.len());
            let target = (depth as usize).min(capacity);
            let ctx = self.consumer_context(queue);
            let diff = self.pool.resize(target, &ctx).await;
            tracing::info!(depth, capacity, target, diff, "resized reactive consumer pool");
            Ok((diff, MetricStats::default()))
        } else {
            let result = reconcile_base(&self.manager, self.config.base_quantity).await?;
            Ok((result.diff, result.stats))
        }
    }

    fn consumer_context(&self, queue: &Arc<dyn JobQueue>) -> ConsumerContext {
        ConsumerContext {
            queue: Arc::clone(queue),
            manager: Arc::clone(&self.manager),
            platform: Arc::clone(&self.platform),
            lock: self.lock.clone(),
            supported_labels: self.config.supported_labels.clone(),
            dispatch: self.config.dispatch.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Cleanup plus a kill pass over the targeted runners. Returns how many
    /// runners were stopped.
    pub async fn flush(&self, mode: FlushMode) -> Result<u64, ManagerError> {
        let mut stats = self.manager.cleanup().await?;
        let flush_stats = self.manager.flush_runners(mode).await?;
        stats.merge(&flush_stats);
        Ok(stats.get(EventKind::RunnerStop))
    }

    async fn issue_reconciliation_metric(&self, stats: &MetricStats, duration: Duration) {
        let runners = match self.manager.list_runners().await {
            Ok(runners) => runners,
            Err(e) => {
                tracing::warn!(error = %e, "skipping reconciliation metric, inventory unavailable");
                return;
            }
        };
        log_runners(&runners);
        let idle = runners
            .iter()
            .filter(|runner| runner.is_idle_online() || runner.is_offline_healthy())
            .count();
        let active = runners.iter().filter(|runner| runner.is_busy()).count();
        let event = Event::Reconciliation {
            timestamp: now_timestamp(),
            flavor: self.config.flavor.clone(),
            expected: i64::from(self.config.base_quantity),
            idle,
            active,
            crashed: stats.crashed_runners(),
            duration: duration.as_secs_f64(),
        };
        if let Err(e) = self.sink.issue(event) {
            tracing::error!(error = %e, "failed to issue reconciliation metric");
        }
    }
}

fn log_runners(runners: &[RunnerInstance]) {
    use crate::reconcile::HealthVerdict;

    let busy: Vec<_> = runners
        .iter()
        .filter(|r| r.is_busy())
        .map(|r| r.instance_id().to_string())
        .collect();
    let idle: Vec<_> = runners
        .iter()
        .filter(|r| r.is_idle_online())
        .map(|r| r.instance_id().to_string())
        .collect();
    let offline_healthy: Vec<_> = runners
        .iter()
        .filter(|r| r.is_offline_healthy())
        .map(|r| r.instance_id().to_string())
        .collect();
    let unhealthy: Vec<_> = runners
        .iter()
        .filter(|r| {
            matches!(
                r.verdict,
                HealthVerdict::Unhealthy | HealthVerdict::Unknown
            )
        })
        .map(|r| r.instance_id().to_string())
        .collect();
    tracing::info!(count = busy.len(), runners = ?busy, "busy runners");
    tracing::info!(count = idle.len(), runners = ?idle, "idle runners");
    tracing::info!(
        count = offline_healthy.len(),
        runners = ?offline_healthy,
        "offline runners that are healthy"
    );
    tracing::info!(count = unhealthy.len(), runners = ?unhealthy, "unhealthy runners");
}
