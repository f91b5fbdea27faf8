use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tees_core::abuse::{AbuseKind, SubjectKey};
use tower::{Layer, Service, ServiceExt};

use crate::abuse::AbuseTracker;
use crate::error::AppError;
use crate::identity::client_ip;
use crate::limiter::RateLimiter;

/// Identity carried by a storefront session token.
///
/// Two-phase resolution:
/// 1. `InjectAuthLayer` verifies the bearer token and stores this in extensions
/// 2. Handlers extract it from extensions, rejecting with 401 when absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub sub: String,
    pub role: Option<String>,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }
}

/// Claims issued by the storefront's login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: u64,
}

/// HS256 verifier for storefront session tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(AuthenticatedUser {
            sub: data.claims.sub,
            role: data.claims.role,
        })
    }
}

pub fn require_admin(auth: &AuthenticatedUser, operation: &str) -> Result<(), AppError> {
    if auth.is_admin() {
        tracing::info!(
            user = %auth.sub,
            operation = operation,
            decision = "allow",
            "admin authorization decision"
        );
        return Ok(());
    }

    tracing::warn!(
        user = %auth.sub,
        operation = operation,
        role = ?auth.role,
        decision = "deny",
        "admin authorization decision"
    );
    Err(AppError::Forbidden {
        message: format!("Operation '{operation}' requires the admin role"),
        docs_hint: Some("Use a session token issued to an admin account.".to_string()),
    })
}

/// Marks a request whose bearer token failed verification. The failure is
/// already scored, so downstream layers must not count its 401 again.
#[derive(Debug, Clone, Copy)]
pub struct TokenRejected;

// --- Tower Layer/Service for auth injection ---

/// Tower Layer that injects `AuthenticatedUser` into request extensions.
///
/// Never rejects: anonymous requests continue untouched, and a bearer token
/// that fails verification continues anonymously after recording an
/// `auth_failure` event against the client address. Exempt paths are never
/// scored.
#[derive(Clone)]
pub struct InjectAuthLayer {
    verifier: Option<JwtVerifier>,
    tracker: AbuseTracker,
    limiter: RateLimiter,
    trust_proxy: bool,
}

impl InjectAuthLayer {
    pub fn new(
        verifier: Option<JwtVerifier>,
        tracker: AbuseTracker,
        limiter: RateLimiter,
        trust_proxy: bool,
    ) -> Self {
        Self {
            verifier,
            tracker,
            limiter,
            trust_proxy,
        }
    }
}

impl<S> Layer<S> for InjectAuthLayer {
    type Service = InjectAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectAuthService {
            inner,
            verifier: self.verifier.clone(),
            tracker: self.tracker.clone(),
            limiter: self.limiter.clone(),
            trust_proxy: self.trust_proxy,
        }
    }
}

#[derive(Clone)]
pub struct InjectAuthService<S> {
    inner: S,
    verifier: Option<JwtVerifier>,
    tracker: AbuseTracker,
    limiter: RateLimiter,
    trust_proxy: bool,
}

impl<S> Service<Request> for InjectAuthService<S>
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

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let tracker = self.tracker.clone();

        // Verification is synchronous; only the failure bookkeeping awaits.
        let failed_ip = match (extract_bearer_token(&req), &self.verifier) {
            (Some(token), Some(verifier)) => match verifier.verify(&token) {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                    None
                }
                Err(err) => {
                    let ip = client_ip(&req, self.trust_proxy);
                    tracing::debug!(error = %err, ip = %ip, "bearer token rejected");
                    if self.limiter.is_exempt(req.uri().path()) {
                        None
                    } else {
                        req.extensions_mut().insert(TokenRejected);
                        Some(ip)
                    }
                }
            },
            _ => None,
        };

        Box::pin(async move {
            if let Some(ip) = failed_ip {
                tracker
                    .track_default(&SubjectKey::new(ip, None), AbuseKind::AuthFailure)
                    .await;
            }
            Ok(ready.oneshot(req).await.into_response())
        })
    }
}

/// Extract bearer token from Authorization header (synchronous, no body access).
fn extract_bearer_token(req: &Request) -> Option<String> {
    let auth_header = req.headers().get("authorization")?.to_str().ok()?;
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

// --- Extractor (used by handlers) ---

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized {
                message: "Missing or invalid session token".to_string(),
                docs_hint: Some("Include 'Authorization: Bearer <token>' header.".to_string()),
            })
    }
}
