use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

mod abuse;
mod auth;
mod config;
mod error;
mod extract;
mod identity;
mod limiter;
mod middleware;
mod routes;
mod state;
mod store;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tees From The Past API",
        version = "0.1.0",
        description = "Storefront API guard: adaptive rate limiting driven by per-client abuse scores."
    ),
    paths(
        routes::health::health_check,
        routes::health::readiness_check,
        routes::abuse::track_abuse_event,
        routes::abuse::get_abuse_score,
    ),
    components(schemas(
        HealthResponse,
        routes::health::ReadinessResponse,
        tees_core::abuse::AbuseKind,
        tees_core::abuse::TrackAbuseEventRequest,
        tees_core::abuse::TrackAbuseEventResponse,
        tees_core::abuse::KindScore,
        tees_core::abuse::AbuseScoreResponse,
        tees_core::error::ApiError,
        tees_core::error::RateLimitedBody,
        tees_core::error::RateLimitedError,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn build_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(routes::health::router())
        .merge(routes::abuse::admin_router());
    layered(router, state)
}

/// Wrap `router` in the middleware stack.
///
/// Innermost first: panics become 500s before the abuse signal and rate
/// limit layers see the response, so telemetry headers land on every
/// outcome. Identity injection runs before the limiter so authenticated
/// callers get their own window.
fn layered(router: Router<AppState>, state: AppState) -> Router {
    let config = state.config.clone();
    let verifier = config.jwt_secret.as_deref().map(auth::JwtVerifier::new);
    if verifier.is_none() {
        tracing::warn!("JWT_SECRET not set; all requests are treated as anonymous");
    }

    router
        .fallback(routes::not_found)
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(middleware::abuse_signal::AbuseSignalLayer::new(
            state.tracker.clone(),
            config.trust_proxy,
        ))
        .layer(middleware::rate_limit::RateLimitLayer::new(
            state.limiter.clone(),
            config.trust_proxy,
        ))
        .layer(auth::InjectAuthLayer::new(
            verifier,
            state.tracker.clone(),
            state.limiter.clone(),
            config.trust_proxy,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers::apply))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CompressionLayer::new())
                .layer(middleware::cors::build_cors_layer(&config.cors_origins)),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tees_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let store = store::connect(&config.store).await;
    match &store {
        Some(store) => tracing::info!(backend = store.backend(), "counter store ready"),
        None => tracing::warn!("no counter store; rate limiting disabled"),
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = build_app(AppState::new(config, store));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("Tees API listening on {}", addr);

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!(error = %err, "server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
