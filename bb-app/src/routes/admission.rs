use crate::server::AppState;
use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/admission/{user_id}/{command}",
        get(get_admission),
    )
}

/// Remaining quota and reset time. Never records an attempt.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_admission(
    Extension(state): Extension<Arc<AppState>>,
    Path((user_id, command)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let now = Utc::now();
    let limit = state.admission.limits().get(&command);
    let (remaining, reset_time) = state.admission.status(&user_id, &command, now);
    Json(serde_json::json!({
        "user_id": user_id,
        "command": command,
        "limit": limit.limit,
        "window_seconds": limit.window_seconds,
        "remaining": remaining,
        "reset_time": reset_time,
        "checked_at": now,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::testing;
    use crate::server::app;
    use axum::http::StatusCode;
    use chrono::Utc;

    #[tokio::test]
    async fn unknown_user_has_the_full_quota() {
        let (state, _worker) = testing::state(5);
        let (status, body) =
            testing::get_json(app(state.clone()), "/api/v1/admission/alice/imagine").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["window_seconds"], 300);
        assert_eq!(body["remaining"], 5);
        assert_eq!(state.admission.tracked_users(), 0);
    }

    #[tokio::test]
    async fn query_reflects_admissions_without_consuming_quota() {
        let (state, _worker) = testing::state(2);
        assert!(state.admission.check("bob", "imagine", Utc::now()));

        for _ in 0..3 {
            let (_, body) =
                testing::get_json(app(state.clone()), "/api/v1/admission/bob/imagine").await;
            assert_eq!(body["remaining"], 1);
        }
        assert_eq!(state.admission.remaining("bob", "imagine", Utc::now()), 1);

        let (_, other) = testing::get_json(app(state), "/api/v1/admission/bob/blend").await;
        assert_eq!(other["limit"], 10);
        assert_eq!(other["remaining"], 10);
    }
}
