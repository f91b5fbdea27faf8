use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use tees_core::abuse::SubjectKey;

use crate::auth::AuthenticatedUser;

/// Who a request is attributed to for rate limiting and abuse scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub ip: String,
    pub user_id: Option<String>,
}

impl RequestIdentity {
    /// Reads `AuthenticatedUser` from extensions, so this must run inside
    /// `InjectAuthLayer`.
    pub fn from_request(req: &Request, trust_proxy: bool) -> Self {
        Self {
            ip: client_ip(req, trust_proxy),
            user_id: req
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.sub.clone()),
        }
    }

    /// Window counter key. An authenticated user keeps one window across
    /// addresses; anonymous traffic is counted per IP.
    pub fn rate_key(&self) -> String {
        match &self.user_id {
            Some(user_id) => format!("rl:user:{user_id}"),
            None => format!("rl:ip:{}", self.ip),
        }
    }

    pub fn subject(&self) -> SubjectKey {
        SubjectKey::new(self.ip.clone(), self.user_id.as_deref())
    }
}

pub fn client_ip(req: &Request, trust_proxy: bool) -> String {
    if trust_proxy && let Some(ip) = forwarded_ip(req.headers()) {
        return ip.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`. Entries that are not
/// addresses are ignored so junk headers cannot mint fresh score keys.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let parse = |value: &str| value.trim().parse::<IpAddr>().ok();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(parse)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(parse)
        })
}
