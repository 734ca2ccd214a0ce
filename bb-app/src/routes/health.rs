use crate::server::AppState;
use crate::storage::check_cache_writable;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use bb_gen::ProbeStatus;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[derive(Debug, Default, Deserialize)]
struct HealthQuery {
    /// Also check the generation API and cache storage.
    #[serde(default)]
    deep: bool,
}

#[tracing::instrument(level = "debug", skip_all, fields(deep = query.deep))]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "queue_depth": state.jobs.pending(),
        "tracked_users": state.admission.tracked_users(),
        "follow_ups": state.followups.len(),
        "channels": state.channels,
        "checked_at": Utc::now(),
    });
    if !query.deep {
        return (StatusCode::OK, Json(body));
    }

    let (api, storage) = tokio::join!(state.api.probe(), check_cache_writable(&state.cache_dir));
    let overall = api.status.max(storage.status);
    body["status"] = serde_json::json!(overall);
    body["checks"] = serde_json::json!({
        "generation_api": api,
        "cache_storage": storage,
    });
    let code = match overall {
        ProbeStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        ProbeStatus::Ok | ProbeStatus::Degraded => StatusCode::OK,
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use crate::routes::testing;
    use crate::server::app;
    use axum::http::StatusCode;
    use bb_gen::ProbeStatus;

    #[tokio::test]
    async fn health_reports_queue_depth_and_channels() {
        let (state, _worker) = testing::state(5);
        let (status, body) = testing::get_json(app(state), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue_depth"], 0);
        assert_eq!(body["channels"][0], "recording");
        assert!(body.get("checks").is_none());
    }

    #[tokio::test]
    async fn deep_health_reports_each_check() {
        let (state, _worker) = testing::state_with_api(5, ProbeStatus::Degraded);
        let (status, body) = testing::get_json(app(state), "/api/v1/health?deep=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["generation_api"]["status"], "degraded");
        assert_eq!(body["checks"]["cache_storage"]["status"], "ok");
    }

    #[tokio::test]
    async fn unreachable_api_makes_deep_health_unavailable() {
        let (state, _worker) = testing::state_with_api(5, ProbeStatus::Unhealthy);
        let (status, body) = testing::get_json(app(state), "/api/v1/health?deep=true").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"]["generation_api"]["message"], "scripted");
    }
}
