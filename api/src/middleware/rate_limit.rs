use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::Json;
use axum::extract::Request;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tees_core::error::RateLimitedBody;
use tower::{Layer, Service, ServiceExt};

use crate::identity::RequestIdentity;
use crate::limiter::{RateDecision, RateLimiter, RateStatus};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_DISABLED: HeaderName = HeaderName::from_static("x-ratelimit-disabled");
pub const X_ABUSE_SCORE: HeaderName = HeaderName::from_static("x-abuse-score");

/// Tower Layer enforcing the adaptive rate limit.
///
/// Runs after `InjectAuthLayer` so authenticated callers are keyed by user.
/// Telemetry headers are written onto whatever the inner service returns,
/// error and panic responses included. Blocked requests never reach it.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
    trust_proxy: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter, trust_proxy: bool) -> Self {
        Self {
            limiter,
            trust_proxy,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimiter,
    trust_proxy: bool,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let limiter = self.limiter.clone();
        let identity = RequestIdentity::from_request(&req, self.trust_proxy);

        Box::pin(async move {
            let path = req.uri().path().to_owned();

            match limiter.check(&path, &identity).await {
                RateDecision::Exempt => Ok(ready.oneshot(req).await.into_response()),
                RateDecision::Disabled => {
                    let mut response = ready.oneshot(req).await.into_response();
                    let headers = response.headers_mut();
                    headers.insert(X_RATELIMIT_DISABLED, HeaderValue::from_static("true"));
                    headers.insert(X_ABUSE_SCORE, HeaderValue::from_static("0"));
                    Ok(response)
                }
                RateDecision::Allowed(status) => {
                    let mut response = ready.oneshot(req).await.into_response();
                    annotate(response.headers_mut(), &status);
                    Ok(response)
                }
                RateDecision::Blocked {
                    status,
                    retry_after_secs,
                    causes,
                } => {
                    tracing::warn!(
                        path = %path,
                        ip = %identity.ip,
                        user_id = identity.user_id.as_deref().unwrap_or("-"),
                        abuse_score = status.abuse_score,
                        retry_after_secs,
                        causes = ?causes,
                        "request rate limited"
                    );
                    Ok(blocked_response(&status, retry_after_secs))
                }
            }
        })
    }
}

fn annotate(headers: &mut HeaderMap, status: &RateStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset_at));
    headers.insert(X_ABUSE_SCORE, HeaderValue::from(status.abuse_score));
}

/// 429 in the `{ ok: false, error: { code: "RATE_LIMITED" } }` shape with `Retry-After`.
fn blocked_response(status: &RateStatus, retry_after_secs: u64) -> Response {
    let request_id = uuid::Uuid::now_v7().to_string();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, HeaderValue::from(retry_after_secs))],
        Json(RateLimitedBody::new(retry_after_secs, request_id)),
    )
        .into_response();
    annotate(response.headers_mut(), status);
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;
    use crate::abuse::{AbusePolicy, AbuseTracker};
    use crate::limiter::RateLimitPolicy;
    use crate::store::CounterStore;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::FailingStore;

    fn limiter(store: Option<Arc<dyn CounterStore>>, max_requests: u64) -> RateLimiter {
        let tracker = AbuseTracker::new(store.clone(), AbusePolicy::default());
        RateLimiter::new(
            store,
            tracker,
            RateLimitPolicy {
                window: Duration::from_secs(60),
                max_requests,
                exempt_paths: vec!["/health".to_string()],
            },
        )
    }

    fn app(limiter: RateLimiter, hits: Arc<AtomicUsize>) -> Router {
        let handler = move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        };
        Router::new()
            .route("/v1/products", get(handler.clone()))
            .route("/health", get(handler))
            .layer(RateLimitLayer::new(limiter, true))
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .expect("request should build")
    }

    fn header<'a>(response: &'a Response, name: &HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn allowed_request_carries_telemetry_headers() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(1_000));
        let app = app(limiter(Some(store), 3), Arc::new(AtomicUsize::new(0)));

        let response = app.oneshot(request("/v1/products")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_RATELIMIT_LIMIT), Some("3"));
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), Some("2"));
        assert_eq!(header(&response, &X_ABUSE_SCORE), Some("0"));
        let reset: i64 = header(&response, &X_RATELIMIT_RESET)
            .expect("reset header")
            .parse()
            .expect("reset is epoch seconds");
        assert!(reset > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn blocked_request_short_circuits_with_429() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(1_000));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter(Some(store), 1), hits.clone());

        let first = app.clone().oneshot(request("/v1/products")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request("/v1/products")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(header(&second, &X_RATELIMIT_REMAINING), Some("0"));
        let retry_after: u64 = header(&second, &RETRY_AFTER)
            .expect("retry-after header")
            .parse()
            .expect("retry-after is seconds");
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn exempt_path_has_no_headers() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(1_000));
        let app = app(limiter(Some(store), 0), Arc::new(AtomicUsize::new(0)));

        let response = app.oneshot(request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert!(response.headers().get(X_ABUSE_SCORE).is_none());
        assert!(response.headers().get(X_RATELIMIT_DISABLED).is_none());
    }

    #[tokio::test]
    async fn missing_store_passes_through_marked_disabled() {
        let app = app(limiter(None, 0), Arc::new(AtomicUsize::new(0)));

        let response = app.oneshot(request("/v1/products")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_RATELIMIT_DISABLED), Some("true"));
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn failing_store_degrades_to_pass_through() {
        let store: Arc<dyn CounterStore> = Arc::new(FailingStore);
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(limiter(Some(store), 0), hits.clone());

        let response = app.oneshot(request("/v1/products")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_RATELIMIT_DISABLED), Some("true"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
