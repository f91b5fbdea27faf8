use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Category of a weighted abuse signal.
///
/// Every kind has its own weight and threshold in the server's policy table;
/// the wire name is what clients send and what appears in score breakdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AbuseKind {
    LoginFailure,
    AuthFailure,
    #[serde(rename = "4xx_error")]
    ClientError,
    RateLimitExceeded,
    GenericAbuse,
}

impl AbuseKind {
    pub const ALL: [AbuseKind; 5] = [
        AbuseKind::LoginFailure,
        AbuseKind::AuthFailure,
        AbuseKind::ClientError,
        AbuseKind::RateLimitExceeded,
        AbuseKind::GenericAbuse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AbuseKind::LoginFailure => "login_failure",
            AbuseKind::AuthFailure => "auth_failure",
            AbuseKind::ClientError => "4xx_error",
            AbuseKind::RateLimitExceeded => "rate_limit_exceeded",
            AbuseKind::GenericAbuse => "generic_abuse",
        }
    }
}

impl fmt::Display for AbuseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown abuse kind '{0}' (expected one of: login_failure, auth_failure, 4xx_error, rate_limit_exceeded, generic_abuse)")]
pub struct UnknownAbuseKind(pub String);

impl FromStr for AbuseKind {
    type Err = UnknownAbuseKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        AbuseKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| UnknownAbuseKind(s.to_string()))
    }
}

/// Identity an abuse score is accumulated under.
///
/// Scoped to `(ip, user)` when a user is known, to `ip` alone otherwise, so
/// two users behind one address never share a score.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectKey {
    pub ip: String,
    pub user_id: Option<String>,
}

impl SubjectKey {
    pub fn new(ip: impl Into<String>, user_id: Option<&str>) -> Self {
        Self {
            ip: ip.into(),
            user_id: user_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_owned),
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_id {
            Some(user_id) => write!(f, "ip:{}:user:{}", self.ip, user_id),
            None => write!(f, "ip:{}", self.ip),
        }
    }
}

/// Request to record an abuse event (POST /v1/admin/abuse/events)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TrackAbuseEventRequest {
    /// Client IP the event is attributed to
    pub ip: String,
    /// Authenticated user, when the event happened inside a session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub kind: AbuseKind,
    /// Defaults to the configured weight for `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrackAbuseEventResponse {
    pub subject: String,
    pub kind: AbuseKind,
    pub weight: u64,
    /// Aggregate score after the event was recorded
    pub score: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Query for GET /v1/admin/abuse/score
#[derive(Debug, Clone, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AbuseScoreQuery {
    pub ip: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KindScore {
    pub kind: AbuseKind,
    pub score: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AbuseScoreResponse {
    pub subject: String,
    /// Sum of all event weights in the current scoring window
    pub score: u64,
    pub kinds: Vec<KindScore>,
    /// Whether the next rate-limited request from this subject would be rejected
    pub blocked: bool,
}
