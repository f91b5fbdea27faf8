use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/readiness", get(readiness_check))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ReadinessResponse {
    pub status: String,
    /// Counter store backend, or `disabled`
    pub store: String,
}

/// Liveness probe; never touches the counter store
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Process is up", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: pings the counter store when one is configured
///
/// Running without a store is a supported mode (rate limiting disabled), so
/// it still reports ready.
#[utoipa::path(
    get,
    path = "/readiness",
    responses(
        (status = 200, description = "Ready to serve", body = ReadinessResponse),
        (status = 503, description = "Counter store unreachable", body = ReadinessResponse)
    ),
    tag = "system"
)]
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = &state.store else {
        return (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
                store: "disabled".to_string(),
            }),
        );
    };

    match store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
                store: store.backend().to_string(),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, backend = store.backend(), "readiness: store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "degraded".to_string(),
                    store: store.backend().to_string(),
                }),
            )
        }
    }
}
