//! Custom extractors that convert axum rejections to structured AppError responses.
//!
//! Use `AppJson<T>` / `AppQuery<T>` in place of `axum::Json<T>` / `axum::extract::Query<T>`.
//! Deserialization failures produce a JSON `AppError` instead of axum's
//! default plain-text rejection.

use axum::{
    Json,
    extract::{
        FromRequest, FromRequestParts, Query, Request,
        rejection::{JsonRejection, QueryRejection},
    },
    http::request::Parts,
};

use crate::error::AppError;

/// JSON extractor that converts deserialization errors to `AppError::Validation`.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Query-string extractor with the same error shape as [`AppJson`].
pub struct AppQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(AppQuery(value)),
            Err(rejection) => Err(AppError::Validation {
                message: format!("Invalid query string: {}", rejection.body_text()),
                field: extract_field_from_serde_message(&rejection.body_text())
                    .or(Some("query".to_string())),
                received: None,
                docs_hint: Some(
                    "Check the query parameters against GET /api-doc/openapi.json.".to_string(),
                ),
            }),
        }
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();

    // Extract a useful field hint from common serde error patterns:
    // "missing field `ip`" → field = "ip"
    // "unknown field `foo`" → field = "foo"
    let field_hint = extract_field_from_serde_message(&body_text);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_hint.unwrap_or("body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /api-doc/openapi.json)."
                .to_string(),
        ),
    }
}

/// Try to extract a field name from serde's error messages.
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    for pattern in ["missing field `", "unknown field `"] {
        if let Some(start) = msg.find(pattern) {
            let after = &msg[start + pattern.len()..];
            if let Some(end) = after.find('`') {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_missing_field_name() {
        let msg = "Failed to deserialize: missing field `kind` at line 1 column 24";
        assert_eq!(extract_field_from_serde_message(msg), Some("kind".to_string()));
    }

    #[test]
    fn extracts_unknown_field_name() {
        let msg = "unknown field `severity`, expected one of `ip`, `user_id`, `kind`, `weight`";
        assert_eq!(
            extract_field_from_serde_message(msg),
            Some("severity".to_string())
        );
    }

    #[test]
    fn returns_none_for_generic_error() {
        let msg = "invalid type: string, expected u64";
        assert_eq!(extract_field_from_serde_message(msg), None);
    }
}
