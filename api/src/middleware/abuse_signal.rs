use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tees_core::abuse::AbuseKind;
use tower::{Layer, Service, ServiceExt};

use crate::abuse::AbuseTracker;
use crate::auth::TokenRejected;
use crate::identity::RequestIdentity;

/// Tower Layer that turns client-error responses into abuse events.
///
/// Runs inside `RateLimitLayer`, so 429s it produces are never seen here and
/// cannot feed back twice. Only `/v1/` traffic is considered, and a 401 for a
/// token `InjectAuthLayer` already scored is not counted again.
#[derive(Clone)]
pub struct AbuseSignalLayer {
    tracker: AbuseTracker,
    trust_proxy: bool,
}

impl AbuseSignalLayer {
    pub fn new(tracker: AbuseTracker, trust_proxy: bool) -> Self {
        Self {
            tracker,
            trust_proxy,
        }
    }
}

impl<S> Layer<S> for AbuseSignalLayer {
    type Service = AbuseSignalService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AbuseSignalService {
            inner,
            tracker: self.tracker.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

#[derive(Clone)]
pub struct AbuseSignalService<S> {
    inner: S,
    tracker: AbuseTracker,
    trust_proxy: bool,
}

impl<S> Service<Request> for AbuseSignalService<S>
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
        let tracker = self.tracker.clone();
        let trust_proxy = self.trust_proxy;

        Box::pin(async move {
            if !req.uri().path().starts_with("/v1/") {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let identity = RequestIdentity::from_request(&req, trust_proxy);
            let token_rejected = req.extensions().get::<TokenRejected>().is_some();
            let response = ready.oneshot(req).await.into_response();

            match classify(response.status()) {
                Some(AbuseKind::AuthFailure) if token_rejected => {}
                Some(kind) => tracker.track_default(&identity.subject(), kind).await,
                None => {}
            }

            Ok(response)
        })
    }
}

/// Map a response status to the abuse kind it signals, if any.
fn classify(status: StatusCode) -> Option<AbuseKind> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(AbuseKind::AuthFailure),
        StatusCode::TOO_MANY_REQUESTS => None,
        s if s.is_client_error() => Some(AbuseKind::ClientError),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::abuse::AbusePolicy;
    use crate::store::CounterStore;
    use crate::store::memory::MemoryStore;

    #[test]
    fn classify_maps_statuses() {
        assert_eq!(classify(StatusCode::UNAUTHORIZED), Some(AbuseKind::AuthFailure));
        assert_eq!(classify(StatusCode::FORBIDDEN), Some(AbuseKind::AuthFailure));
        assert_eq!(classify(StatusCode::NOT_FOUND), Some(AbuseKind::ClientError));
        assert_eq!(classify(StatusCode::BAD_REQUEST), Some(AbuseKind::ClientError));
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS), None);
        assert_eq!(classify(StatusCode::OK), None);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR), None);
    }

    async fn run(path: &str, status: StatusCode) -> u64 {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(1_000));
        let tracker = AbuseTracker::new(Some(store), AbusePolicy::default());
        let app = Router::new()
            .fallback(move || async move { status })
            .layer(AbuseSignalLayer::new(tracker.clone(), true));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(path)
                    .header("x-forwarded-for", "198.51.100.4")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), status);

        tracker.get_abuse_score("198.51.100.4", None).await
    }

    #[tokio::test]
    async fn not_found_under_v1_scores_client_error() {
        assert_eq!(run("/v1/missing", StatusCode::NOT_FOUND).await, 1);
    }

    #[tokio::test]
    async fn forbidden_scores_auth_failure() {
        assert_eq!(run("/v1/admin/abuse/score", StatusCode::FORBIDDEN).await, 2);
    }

    #[tokio::test]
    async fn already_scored_token_rejection_is_not_counted_again() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new(1_000));
        let tracker = AbuseTracker::new(Some(store), AbusePolicy::default());
        let app = Router::new()
            .fallback(|| async { StatusCode::UNAUTHORIZED })
            .layer(AbuseSignalLayer::new(tracker.clone(), true));

        let mut request = Request::builder()
            .uri("/v1/admin/abuse/score")
            .header("x-forwarded-for", "198.51.100.5")
            .body(Body::empty())
            .expect("request should build");
        request.extensions_mut().insert(TokenRejected);
        let response = app.oneshot(request).await.expect("request should succeed");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(tracker.get_abuse_score("198.51.100.5", None).await, 0);
    }

    #[tokio::test]
    async fn paths_outside_v1_are_ignored() {
        assert_eq!(run("/favicon.ico", StatusCode::NOT_FOUND).await, 0);
    }

    #[tokio::test]
    async fn success_is_not_scored() {
        assert_eq!(run("/v1/products", StatusCode::OK).await, 0);
    }
}
