use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response shared by every non-rate-limit failure.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "unauthorized")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Body returned with every 429.
///
/// The storefront frontend branches on `ok` and `error.code`, so this shape
/// differs from [`ApiError`].
#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitedBody {
    pub ok: bool,
    pub error: RateLimitedError,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RateLimitedError {
    /// Always `RATE_LIMITED`
    pub code: String,
    pub message: String,
    pub retry_after_secs: u64,
    pub request_id: String,
}

impl RateLimitedBody {
    pub fn new(retry_after_secs: u64, request_id: String) -> Self {
        Self {
            ok: false,
            error: RateLimitedError {
                code: codes::RATE_LIMITED.to_string(),
                message: format!("Too many requests. Retry after {retry_after_secs} seconds."),
                retry_after_secs,
                request_id,
            },
        }
    }
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
}
