use std::any::Any;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tees_core::error::{self, ApiError};

use crate::store::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or invalid credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Authenticated but not allowed (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// No route matched (404)
    NotFound { path: String },
    /// Counter store unreachable (503)
    Store(StoreError),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: error::codes::UNAUTHORIZED.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::NotFound { path } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message: format!("No route for {path}"),
                    field: None,
                    received: None,
                    request_id,
                    docs_hint: Some(
                        "See GET /api-doc/openapi.json for available endpoints.".to_string(),
                    ),
                },
            ),
            AppError::Store(err) => {
                tracing::error!(error = %err, "counter store error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiError {
                        error: error::codes::SERVICE_UNAVAILABLE.to_string(),
                        message: "Abuse score storage is unavailable".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: Some(
                            "Retry shortly; GET /readiness reports store health.".to_string(),
                        ),
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id,
                        docs_hint: None,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

/// `CatchPanicLayer` handler: a panicking handler becomes a structured 500
/// that still flows back out through the rate limit layer.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    AppError::Internal(format!("handler panicked: {detail}")).into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::{AppError, panic_response};
    use crate::store::StoreError;

    #[test]
    fn status_codes_follow_variants() {
        let validation = AppError::Validation {
            message: "bad".to_string(),
            field: Some("ip".to_string()),
            received: None,
            docs_hint: None,
        };
        assert_eq!(validation.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::Store(StoreError::Unavailable("down".to_string()))
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("boom".to_string()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn panic_payload_becomes_internal_error() {
        let response = panic_response(Box::new("handler exploded"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
