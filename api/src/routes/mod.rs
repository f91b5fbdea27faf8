use axum::http::Uri;

use crate::error::AppError;

pub mod abuse;
pub mod health;

/// Router fallback, so unknown `/v1/` paths still flow through the layers
/// and count as client errors.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound {
        path: uri.path().to_string(),
    }
}
