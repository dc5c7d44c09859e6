use crate::config::DispatchCheckConfig;
use crate::lock::ReconcileLock;
use crate::manager::RunnerManager;
use crate::model::{PlatformKind, Reactivity, RunnerMetadata};
use crate::platform::PlatformProvider;
use crate::queue::{
    Delivery, END_PROCESSING_PAYLOAD, JobQueue, QueueError, labels_supported, parse_job_details,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ConsumerContext {
    pub queue: Arc<dyn JobQueue>,
    pub manager: Arc<RunnerManager>,
    pub platform: Arc<dyn PlatformProvider>,
    pub lock: ReconcileLock,
    pub supported_labels: HashSet<String>,
    pub dispatch: DispatchCheckConfig,
    pub cancel: CancellationToken,
}

/// Consume messages until a runner is spawned for one of them, the end
/// sentinel arrives, or the consumer is cancelled. A cancelled consumer
/// leaves its current message unacknowledged so the broker redelivers it.
pub async fn consume(ctx: &ConsumerContext) -> Result<(), QueueError> {
    loop {
        let delivery = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            delivery = ctx.queue.receive() => delivery?,
        };

        if delivery.payload() == END_PROCESSING_PAYLOAD.as_bytes() {
            tracing::info!("received end sentinel, stopping consumer");
            delivery.ack().await?;
            return Ok(());
        }

        let details = match parse_job_details(delivery.payload()) {
            Ok(details) => details,
            Err(e) => {
                tracing::error!(error = %e, "found invalid job details, rejecting the message");
                delivery.reject(false).await?;
                continue;
            }
        };
        tracing::info!(labels = ?details.labels, url = %details.url, "received job");

        if !labels_supported(&details.labels, &ctx.supported_labels) {
            // No runner this manager can create will ever satisfy the job.
            tracing::error!(
                labels = ?details.labels,
                "unsupported job labels, rejecting without requeue"
            );
            delivery.reject(false).await?;
            continue;
        }

        let metadata = job_metadata(&ctx.manager.metadata(), &details.url);
        match ctx
            .platform
            .check_job_dispatched(&metadata, &details.url)
            .await
        {
            Ok(true) => {
                tracing::info!(url = %details.url, "job already picked up");
                delivery.ack().await?;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, url = %details.url, "dispatch check failed, requeueing");
                delivery.reject(true).await?;
                return Ok(());
            }
        }

        return spawn_runner(ctx, &metadata, &details.url, delivery).await;
    }
}

async fn spawn_runner(
    ctx: &ConsumerContext,
    metadata: &RunnerMetadata,
    job_url: &str,
    delivery: Box<dyn Delivery>,
) -> Result<(), QueueError> {
    let created = {
        let _guard = ctx.lock.acquire().await;
        ctx.manager
            .create_runners(1, metadata.clone(), Reactivity::Reactive)
            .await
    };
    let spawned = match created {
        Ok(outcome) => !outcome.ids.is_empty(),
        Err(e) => {
            tracing::error!(error = %e, "runner creation failed");
            false
        }
    };
    if !spawned {
        tracing::error!("failed to spawn a runner, requeueing the message");
        delivery.reject(true).await?;
        return Ok(());
    }

    for _ in 0..ctx.dispatch.attempts {
        match ctx
            .platform
            .check_job_dispatched(metadata, job_url)
            .await
        {
            Ok(true) => {
                delivery.ack().await?;
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, url = %job_url, "dispatch check failed");
            }
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(ctx.dispatch.interval)) => {}
        }
    }

    // The runner is real but the job may have been lost; another consumer
    // retries the message and cleanup reaps the idle runner.
    tracing::warn!(url = %job_url, "job never dispatched, requeueing the message");
    delivery.reject(true).await?;
    Ok(())
}

/// For the job-dispatcher platform the job id is the trailing path segment of
/// the job URL; the hosted VCS resolves jobs from the URL itself.
fn job_metadata(template: &RunnerMetadata, job_url: &str) -> RunnerMetadata {
    if template.platform == PlatformKind::JobDispatcher {
        if let Some(id) = job_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()))
        {
            return template.with_runner_id(id);
        }
    }
    template.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudProvider;
    use crate::config::SupportConfig;
    use crate::manager::RunnerManagerConfig;
    use crate::metrics::MetricSink;
    use crate::reconcile::GracePeriods;
    use crate::testing::{FakeCloud, FakePlatform, FakeQueue, HealthScript, MemorySink, test_metadata};
    use chrono::Duration as ChronoDuration;

    const JOB: &str = r#"{"labels":["x64"],"url":"https://h/jobs/99"}"#;

    struct Fixture {
        cloud: Arc<FakeCloud>,
        platform: Arc<FakePlatform>,
        queue: Arc<FakeQueue>,
        ctx: ConsumerContext,
    }

    fn fixture(messages: &[&str]) -> Fixture {
        let cloud = Arc::new(FakeCloud::new("fleet"));
        let platform = Arc::new(FakePlatform::new());
        let sink = Arc::new(MemorySink::new());
        let queue = Arc::new(FakeQueue::new(messages));
        let manager = Arc::new(RunnerManager::new(
            RunnerManagerConfig {
                name: "fleet".to_string(),
                prefix: "fleet".to_string(),
                labels: vec!["x64".to_string()],
                metadata: test_metadata(),
                support: SupportConfig::default(),
                readiness_schedule: vec![Duration::from_millis(1)],
                create_concurrency: 4,
                grace: GracePeriods {
                    startup: ChronoDuration::minutes(15),
                    build: ChronoDuration::minutes(10),
                },
            },
            Arc::clone(&cloud) as Arc<dyn CloudProvider>,
            Arc::clone(&platform) as Arc<dyn PlatformProvider>,
            Arc::clone(&sink) as Arc<dyn MetricSink>,
        ));
        let ctx = ConsumerContext {
            queue: Arc::clone(&queue) as Arc<dyn JobQueue>,
            manager,
            platform: Arc::clone(&platform) as Arc<dyn PlatformProvider>,
            lock: ReconcileLock::new(),
            supported_labels: ["x64".to_string(), "self-hosted".to_string()]
                .into_iter()
                .collect(),
            dispatch: DispatchCheckConfig {
                attempts: 3,
                interval: 0,
            },
            cancel: CancellationToken::new(),
        };
        Fixture {
            cloud,
            platform,
            queue,
            ctx,
        }
    }

    #[tokio::test]
    async fn spawns_runner_and_acks_once_dispatched() {
        let f = fixture(&[JOB]);
        f.platform.script_health_for_new_runners(HealthScript::IDLE);
        f.platform.script_dispatched(&[false, true]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.cloud.launched().len(), 1);
        assert_eq!(
            f.cloud.launched()[0].reactivity(),
            crate::model::Reactivity::Reactive
        );
        assert_eq!(f.queue.acked(), vec![JOB.to_string()]);
        assert!(f.queue.rejected().is_empty());
    }

    #[tokio::test]
    async fn sentinel_acks_and_stops() {
        let f = fixture(&[END_PROCESSING_PAYLOAD]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.queue.acked(), vec![END_PROCESSING_PAYLOAD.to_string()]);
        assert!(f.cloud.launched().is_empty());
    }

    #[tokio::test]
    async fn unsupported_labels_reject_without_requeue() {
        let job = r#"{"labels":["arm64"],"url":"https://h/jobs/99"}"#;
        let f = fixture(&[job, END_PROCESSING_PAYLOAD]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.queue.rejected(), vec![(job.to_string(), false)]);
        assert!(f.cloud.launched().is_empty());
    }

    #[tokio::test]
    async fn poison_message_rejects_without_requeue() {
        let f = fixture(&["not json", END_PROCESSING_PAYLOAD]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.queue.rejected(), vec![("not json".to_string(), false)]);
        assert!(f.cloud.launched().is_empty());
    }

    #[tokio::test]
    async fn already_dispatched_job_is_acked_without_spawn() {
        let f = fixture(&[JOB, END_PROCESSING_PAYLOAD]);
        f.platform.script_dispatched(&[true]);

        consume(&f.ctx).await.unwrap();

        assert!(f.cloud.launched().is_empty());
        assert_eq!(
            f.queue.acked(),
            vec![JOB.to_string(), END_PROCESSING_PAYLOAD.to_string()]
        );
    }

    #[tokio::test]
    async fn failed_spawn_requeues_the_message() {
        let f = fixture(&[JOB]);
        f.platform.fail_issue();
        f.platform.script_dispatched(&[false]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.queue.rejected(), vec![(JOB.to_string(), true)]);
        assert!(f.queue.acked().is_empty());
    }

    #[tokio::test]
    async fn undispatched_job_requeues_after_polls_exhaust() {
        let f = fixture(&[JOB]);
        f.platform.script_health_for_new_runners(HealthScript::IDLE);
        f.platform.script_dispatched(&[false]);

        consume(&f.ctx).await.unwrap();

        assert_eq!(f.cloud.launched().len(), 1);
        assert_eq!(f.queue.rejected(), vec![(JOB.to_string(), true)]);
        // One check before the spawn, then every configured poll.
        assert_eq!(f.platform.dispatch_checks(), 4);
    }

    #[tokio::test]
    async fn dispatcher_metadata_takes_job_id_from_url() {
        let template = RunnerMetadata {
            platform: PlatformKind::JobDispatcher,
            runner_id: None,
            url: "https://dispatcher.example".to_string(),
        };
        let metadata = job_metadata(&template, "https://dispatcher.example/v1/jobs/42");
        assert_eq!(metadata.runner_id.as_deref(), Some("42"));

        let untouched = job_metadata(&template, "https://dispatcher.example/v1/jobs/latest");
        assert_eq!(untouched.runner_id, None);

        let vcs = job_metadata(&test_metadata(), "https://h/jobs/42");
        assert_eq!(vcs.runner_id, None);
    }
}
