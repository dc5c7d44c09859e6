mod cloud;
mod config;
mod consumer;
mod github;
mod http;
mod jobmanager;
mod lock;
mod manager;
mod metrics;
mod model;
mod nats;
mod openstack;
mod platform;
mod pool;
mod queue;
mod reconcile;
mod retry;
mod scaler;
#[cfg(test)]
mod testing;
mod userdata;

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::github::GitHubPlatform;
use crate::jobmanager::JobManagerPlatform;
use crate::lock::ReconcileLock;
use crate::manager::{RunnerManager, RunnerManagerConfig};
use crate::metrics::{FileMetricSink, MetricSink};
use crate::model::{PlatformKind, RunnerMetadata};
use crate::nats::NatsQueue;
use crate::openstack::OpenStackCloud;
use crate::platform::PlatformProvider;
use crate::queue::JobQueue;
use crate::reconcile::GracePeriods;
use crate::scaler::{RunnerScaler, ScalerConfig};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// The manager cannot tell which architecture a job router meant, so every
// architecture label counts as satisfiable alongside the configured ones.
const IMPLICIT_LABELS: [&str; 3] = ["self-hosted", "x64", "arm64"];

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config".to_string());
    let cfg = Config::load(&config_path).context("failed to load configuration")?;

    let _log_guard = init_tracing(&cfg);

    let cancel = CancellationToken::new();
    let lock = ReconcileLock::new();

    let cloud = Arc::new(
        OpenStackCloud::connect(cfg.prefix(), cfg.cloud.clone())
            .await
            .context("failed to connect to the cloud")?,
    ) as Arc<dyn CloudProvider>;

    let platform: Arc<dyn PlatformProvider> = match cfg.platform.kind {
        PlatformKind::HostedVcs => {
            let org = cfg
                .platform
                .org
                .clone()
                .context("platform.org is required for the hosted-vcs platform")?;
            Arc::new(GitHubPlatform::new(
                &org,
                &cfg.platform.credential,
                cfg.prefix(),
                cfg.platform.group_id,
            ))
        }
        PlatformKind::JobDispatcher => Arc::new(JobManagerPlatform::new(
            &cfg.platform.url,
            &cfg.platform.credential,
        )?),
    };

    let sink = Arc::new(
        FileMetricSink::open(&cfg.metrics_log).context("failed to open the metric log")?,
    ) as Arc<dyn MetricSink>;

    let manager = Arc::new(RunnerManager::new(
        RunnerManagerConfig {
            name: cfg.name.clone(),
            prefix: cfg.prefix().to_string(),
            labels: cfg.labels.clone(),
            metadata: RunnerMetadata {
                platform: cfg.platform.kind,
                runner_id: None,
                url: cfg.platform.url.clone(),
            },
            support: cfg.support.clone(),
            readiness_schedule: cfg
                .readiness_schedule
                .iter()
                .map(|seconds| Duration::from_secs(*seconds))
                .collect(),
            create_concurrency: cfg.create_concurrency,
            grace: GracePeriods {
                startup: chrono::Duration::seconds(cfg.startup_grace as i64),
                build: chrono::Duration::seconds(cfg.build_grace as i64),
            },
        },
        Arc::clone(&cloud),
        Arc::clone(&platform),
        Arc::clone(&sink),
    ));

    let queue: Option<Arc<dyn JobQueue>> = match &cfg.reactive {
        Some(reactive) => Some(Arc::new(
            NatsQueue::connect(&reactive.queue_uri, &reactive.queue_name)
                .await
                .context("failed to connect to the job queue")?,
        )),
        None => None,
    };

    let supported_labels: HashSet<String> = cfg
        .labels
        .iter()
        .cloned()
        .chain(IMPLICIT_LABELS.iter().map(|label| label.to_string()))
        .collect();

    let scaler = Arc::new(RunnerScaler::new(
        ScalerConfig {
            flavor: cfg.name.clone(),
            base_quantity: cfg.base_quantity,
            max_quantity: cfg.reactive.as_ref().map(|r| r.max_quantity).unwrap_or(0),
            supported_labels,
            dispatch: cfg.dispatch_check.clone(),
        },
        Arc::clone(&manager),
        Arc::clone(&platform),
        queue,
        lock.clone(),
        Arc::clone(&sink),
        cancel.clone(),
    ));

    {
        let scaler = Arc::clone(&scaler);
        let lock = lock.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_secs(cfg.reconcile_interval);
        tokio::spawn(async move {
            loop {
                {
                    let _guard = lock.acquire().await;
                    // Handle errors outside the cycle: the next tick retries.
                    if let Err(e) = scaler.reconcile().await {
                        tracing::error!(error = %e, "reconcile cycle failed");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("control loop stopped");
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
            tracing::info!("termination signal received, shutting down");
            cancel.cancel();
        });
    }

    let app = http::router(http::AppState {
        scaler,
        lock,
    });
    let listener = tokio::net::TcpListener::bind((cfg.http.host.as_str(), cfg.http.port))
        .await
        .context("failed to bind the control API listener")?;
    tracing::info!(host = %cfg.http.host, port = cfg.http.port, "serving control API");
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .await?;

    Ok(())
}

fn init_tracing(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match &cfg.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("runner-fleet-manager.log");
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(fmt::layer().json().with_writer(writer))
                .with(EnvFilter::from_default_env())
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(EnvFilter::from_default_env())
                .init();
            None
        }
    }
}
