use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

/// Apply a minimal security-header baseline to all responses.
///
/// API responses under `/v1/` additionally carry `cache-control: no-store`
/// since they may include per-subject abuse scores.
pub async fn apply(req: Request, next: Next) -> Response {
    let api_path = req.uri().path().starts_with("/v1/");
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("frame-ancestors 'none'"),
    );
    if api_path {
        headers.insert("cache-control", HeaderValue::from_static("no-store"));
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::{Router, middleware};
    use tower::ServiceExt;

    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    fn app() -> Router {
        Router::new()
            .route("/health", get(ok))
            .route("/v1/admin/abuse/score", get(ok))
            .layer(middleware::from_fn(super::apply))
    }

    async fn get_headers(uri: &str) -> axum::http::HeaderMap {
        app()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed")
            .headers()
            .clone()
    }

    #[tokio::test]
    async fn apply_adds_baseline_headers() {
        let headers = get_headers("/health").await;
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            headers.get("content-security-policy").unwrap(),
            "frame-ancestors 'none'"
        );
        assert!(headers.get("cache-control").is_none());
    }

    #[tokio::test]
    async fn api_responses_are_not_cacheable() {
        let headers = get_headers("/v1/admin/abuse/score").await;
        assert_eq!(headers.get("cache-control").unwrap(), "no-store");
    }
}
