pub mod admission;
pub mod health;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(admission::router())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::admission::{AdmissionController, CommandLimit, LimitTable};
    use crate::followup::FollowUpRegistry;
    use crate::queue::{JobWorker, WorkerOptions, job_queue};
    use crate::server::AppState;
    use crate::test_support::NoopProcessor;
    use async_trait::async_trait;
    use bb_gen::{GenerationRequest, GenerationTransport, ProbeReport, ProbeStatus};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Answers reachability checks with a fixed status and never generates.
    struct FixedApi(ProbeStatus);

    #[async_trait]
    impl GenerationTransport for FixedApi {
        async fn send(&self, _request: &GenerationRequest) -> bb_gen::Result<serde_json::Value> {
            Err(bb_gen::GenError::Transport("not used over http".to_string()))
        }

        async fn probe(&self) -> ProbeReport {
            ProbeReport::new(self.0, "scripted")
        }
    }

    pub fn state(limit: u32) -> (Arc<AppState>, JobWorker) {
        state_with_api(limit, ProbeStatus::Ok)
    }

    pub fn state_with_api(limit: u32, api: ProbeStatus) -> (Arc<AppState>, JobWorker) {
        let (jobs, worker) = job_queue(
            Arc::new(NoopProcessor),
            WorkerOptions {
                temp_root: std::env::temp_dir().join(format!("bananabot-http-{}", ulid::Ulid::new())),
                job_timeout: None,
                progress_step_delay: Duration::ZERO,
            },
        );
        let mut overrides = HashMap::new();
        overrides.insert(
            "imagine".to_string(),
            CommandLimit {
                limit,
                window_seconds: 300,
            },
        );
        let state = Arc::new(AppState {
            started_at: Instant::now(),
            jobs,
            admission: Arc::new(AdmissionController::new(LimitTable {
                default: CommandLimit {
                    limit: 10,
                    window_seconds: 60,
                },
                overrides,
            })),
            followups: Arc::new(FollowUpRegistry::default()),
            channels: vec!["recording".to_string()],
            api: Arc::new(FixedApi(api)),
            cache_dir: std::env::temp_dir().join(format!("bananabot-cache-{}", ulid::Ulid::new())),
        });
        (state, worker)
    }

    pub async fn get_json(app: axum::Router, uri: &str) -> (axum::http::StatusCode, serde_json::Value) {
        use tower::ServiceExt;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}
