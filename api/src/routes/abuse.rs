use std::net::IpAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tees_core::abuse::{
    AbuseScoreQuery, AbuseScoreResponse, KindScore, SubjectKey, TrackAbuseEventRequest,
    TrackAbuseEventResponse,
};

use crate::auth::{AuthenticatedUser, require_admin};
use crate::error::AppError;
use crate::extract::{AppJson, AppQuery};
use crate::state::AppState;

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/abuse/events", post(track_abuse_event))
        .route("/v1/admin/abuse/score", get(get_abuse_score))
}

/// Record an abuse event against an IP or (IP, user) subject
///
/// Used by other services (login, checkout) to feed the adaptive rate limiter.
/// Recording is best-effort: when the store is down the event is dropped and
/// the returned score is 0.
#[utoipa::path(
    post,
    path = "/v1/admin/abuse/events",
    request_body = TrackAbuseEventRequest,
    responses(
        (status = 202, description = "Event accepted", body = TrackAbuseEventResponse),
        (status = 400, description = "Invalid IP, kind or weight", body = tees_core::error::ApiError),
        (status = 401, description = "Not authenticated", body = tees_core::error::ApiError),
        (status = 403, description = "Not an admin", body = tees_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "abuse"
)]
pub async fn track_abuse_event(
    admin: AuthenticatedUser,
    State(state): State<AppState>,
    AppJson(req): AppJson<TrackAbuseEventRequest>,
) -> Result<(StatusCode, Json<TrackAbuseEventResponse>), AppError> {
    require_admin(&admin, "record abuse events")?;
    validate_ip(&req.ip)?;

    let weight = req
        .weight
        .unwrap_or_else(|| state.tracker.policy().kind(req.kind).weight);
    if weight == 0 {
        return Err(AppError::Validation {
            message: "weight must be a positive integer".to_string(),
            field: Some("weight".to_string()),
            received: Some(serde_json::json!(weight)),
            docs_hint: Some("Omit weight to use the configured default for the kind.".to_string()),
        });
    }

    let user_id = req.user_id.as_deref();
    state
        .tracker
        .track_abuse_event(&req.ip, user_id, req.kind, weight)
        .await;
    let score = state.tracker.get_abuse_score(&req.ip, user_id).await;

    tracing::info!(
        admin = %admin.sub,
        ip = %req.ip,
        kind = %req.kind,
        weight,
        score,
        "abuse event reported by operator"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(TrackAbuseEventResponse {
            subject: SubjectKey::new(req.ip.as_str(), user_id).to_string(),
            kind: req.kind,
            weight,
            score,
            recorded_at: chrono::Utc::now(),
        }),
    ))
}

/// Inspect the abuse score of a subject, broken down by kind
#[utoipa::path(
    get,
    path = "/v1/admin/abuse/score",
    params(AbuseScoreQuery),
    responses(
        (status = 200, description = "Current score in the scoring window", body = AbuseScoreResponse),
        (status = 400, description = "Invalid IP", body = tees_core::error::ApiError),
        (status = 401, description = "Not authenticated", body = tees_core::error::ApiError),
        (status = 403, description = "Not an admin", body = tees_core::error::ApiError),
        (status = 503, description = "Counter store unavailable", body = tees_core::error::ApiError),
    ),
    security(("bearer_auth" = [])),
    tag = "abuse"
)]
pub async fn get_abuse_score(
    admin: AuthenticatedUser,
    State(state): State<AppState>,
    AppQuery(query): AppQuery<AbuseScoreQuery>,
) -> Result<Json<AbuseScoreResponse>, AppError> {
    require_admin(&admin, "inspect abuse scores")?;
    validate_ip(&query.ip)?;

    let subject = SubjectKey::new(query.ip.as_str(), query.user_id.as_deref());
    let scores = state.tracker.subject_scores(&subject).await?;
    let policy = state.tracker.policy();

    let kinds = scores
        .kinds
        .iter()
        .map(|(kind, _)| KindScore {
            kind: *kind,
            score: scores.kind_score(*kind),
            threshold: policy.kind(*kind).threshold,
        })
        .collect();

    Ok(Json(AbuseScoreResponse {
        subject: subject.to_string(),
        score: scores.score(),
        kinds,
        blocked: scores.breach(policy).is_some(),
    }))
}

fn validate_ip(ip: &str) -> Result<(), AppError> {
    ip.parse::<IpAddr>().map(|_| ()).map_err(|_| AppError::Validation {
        message: format!("'{ip}' is not a valid IPv4 or IPv6 address"),
        field: Some("ip".to_string()),
        received: Some(serde_json::json!(ip)),
        docs_hint: None,
    })
}

#[cfg(test)]
mod tests {
    use super::validate_ip;

    #[test]
    fn accepts_v4_and_v6() {
        assert!(validate_ip("203.0.113.7").is_ok());
        assert!(validate_ip("2001:db8::1").is_ok());
    }

    #[test]
    fn rejects_hostnames_and_blank() {
        assert!(validate_ip("example.com").is_err());
        assert!(validate_ip("").is_err());
        assert!(validate_ip("203.0.113.7:443").is_err());
    }
}
