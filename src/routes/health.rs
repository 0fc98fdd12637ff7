use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::dto::session_dto::HealthResponse;
use crate::utils::time::now;
use crate::AppState;

#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                storage: "ok",
                timestamp: now(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = ?e, "storage ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    storage: "unavailable",
                    timestamp: now(),
                }),
            )
        }
    }
}
