use crate::lock::ReconcileLock;
use crate::manager::FlushMode;
use crate::scaler::RunnerScaler;
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub scaler: Arc<RunnerScaler>,
    pub lock: ReconcileLock,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runner/flush", post(flush_runner))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct FlushParams {
    #[serde(rename = "flush-busy")]
    flush_busy: Option<String>,
}

async fn flush_runner(
    State(state): State<AppState>,
    Query(params): Query<FlushParams>,
) -> Response {
    let flush_busy = params
        .flush_busy
        .as_deref()
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    let mode = if flush_busy {
        FlushMode::Busy
    } else {
        FlushMode::Idle
    };

    tracing::info!(
        locked = state.lock.is_locked(),
        "attempting to acquire the reconcile lock"
    );
    let _guard = state.lock.acquire().await;
    match state.scaler.flush(mode).await {
        Ok(flushed) => {
            tracing::info!(flushed, "flushed runners");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "flush failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudProvider;
    use crate::config::{DispatchCheckConfig, SupportConfig};
    use crate::manager::{RunnerManager, RunnerManagerConfig};
    use crate::metrics::MetricSink;
    use crate::model::{InstanceId, Reactivity};
    use crate::platform::PlatformProvider;
    use crate::reconcile::GracePeriods;
    use crate::scaler::ScalerConfig;
    use crate::testing::{FakeCloud, FakePlatform, HealthScript, MemorySink, test_metadata};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state(cloud: &Arc<FakeCloud>, platform: &Arc<FakePlatform>) -> AppState {
        let sink = Arc::new(MemorySink::new());
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
            Arc::clone(cloud) as Arc<dyn CloudProvider>,
            Arc::clone(platform) as Arc<dyn PlatformProvider>,
            Arc::clone(&sink) as Arc<dyn MetricSink>,
        ));
        let lock = ReconcileLock::new();
        let scaler = Arc::new(RunnerScaler::new(
            ScalerConfig {
                flavor: "fleet".to_string(),
                base_quantity: 0,
                max_quantity: 0,
                supported_labels: ["x64".to_string()].into_iter().collect(),
                dispatch: DispatchCheckConfig {
                    attempts: 1,
                    interval: 0,
                },
            },
            manager,
            Arc::clone(platform) as Arc<dyn PlatformProvider>,
            None,
            lock.clone(),
            sink as Arc<dyn MetricSink>,
            CancellationToken::new(),
        ));
        AppState { scaler, lock }
    }

    #[tokio::test]
    async fn health_returns_no_content() {
        let cloud = Arc::new(FakeCloud::new("fleet"));
        let platform = Arc::new(FakePlatform::new());
        let app = router(state(&cloud, &platform));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn flush_defaults_to_idle_mode() {
        let cloud = Arc::new(FakeCloud::new("fleet"));
        let platform = Arc::new(FakePlatform::new());
        let id = InstanceId::generate("fleet", Reactivity::NonReactive);
        cloud.seed(FakeCloud::active_instance(&id, 10));
        platform.script_health(&id.to_string(), &[HealthScript::IDLE]);
        let app = router(state(&cloud, &platform));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runner/flush")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let commands = cloud.ssh_commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("! pgrep -x Runner.Worker"));
    }

    #[tokio::test]
    async fn flush_busy_kills_all_agents() {
        let cloud = Arc::new(FakeCloud::new("fleet"));
        let platform = Arc::new(FakePlatform::new());
        let id = InstanceId::generate("fleet", Reactivity::NonReactive);
        cloud.seed(FakeCloud::active_instance(&id, 10));
        platform.script_health(&id.to_string(), &[HealthScript::BUSY]);
        let app = router(state(&cloud, &platform));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runner/flush?flush-busy=True")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let commands = cloud.ssh_commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("kill $(pgrep -x Runner.Worker)"));
    }
}
