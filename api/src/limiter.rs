//! Admission decisions: a fixed request window per identity, tightened by
//! the subject's abuse score.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tees_core::abuse::AbuseKind;

use crate::abuse::{AbuseTracker, SubjectScores};
use crate::config::ConfigError;
use crate::identity::RequestIdentity;
use crate::store::CounterStore;

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u64,
    /// Path prefixes that bypass limiting entirely
    pub exempt_paths: Vec<String>,
}

impl RateLimitPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Policy("rate limit window must be positive".to_string()));
        }
        if self.max_requests == 0 {
            return Err(ConfigError::Policy(
                "rate limit max requests must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counter state reported back to the client in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch seconds at which the current window closes
    pub reset_at: i64,
    pub abuse_score: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Path is on the exempt list; nothing is counted or reported.
    Exempt,
    /// No usable store; the request passes through unmetered.
    Disabled,
    Allowed(RateStatus),
    Blocked {
        status: RateStatus,
        retry_after_secs: u64,
        causes: Vec<&'static str>,
    },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Option<Arc<dyn CounterStore>>,
    tracker: AbuseTracker,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimiter {
    pub fn new(
        store: Option<Arc<dyn CounterStore>>,
        tracker: AbuseTracker,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            store,
            tracker,
            policy: Arc::new(policy),
        }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.policy
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub async fn check(&self, path: &str, identity: &RequestIdentity) -> RateDecision {
        if self.is_exempt(path) {
            return RateDecision::Exempt;
        }
        let Some(store) = &self.store else {
            return RateDecision::Disabled;
        };

        let rate_key = identity.rate_key();
        let window = match store.incr(&rate_key, 1, self.policy.window).await {
            Ok(window) => window,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    rate_key = %rate_key,
                    "rate limit store unavailable; passing request through"
                );
                return RateDecision::Disabled;
            }
        };

        let subject = identity.subject();
        let window_exhausted = window.value > self.policy.max_requests;
        // Hammering past the window feeds back into the abuse score. The
        // event is recorded before scoring so the block it triggers is
        // reflected in this response's Retry-After.
        if window_exhausted {
            self.tracker
                .track_default(&subject, AbuseKind::RateLimitExceeded)
                .await;
        }

        let scores = match self.tracker.subject_scores(&subject).await {
            Ok(scores) => scores,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    subject = %subject,
                    "abuse score lookup failed; treating score as zero"
                );
                SubjectScores::default()
            }
        };

        let status = RateStatus {
            limit: self.policy.max_requests,
            remaining: self.policy.max_requests.saturating_sub(window.value),
            reset_at: Utc::now().timestamp() + ceil_secs(window.ttl) as i64,
            abuse_score: scores.score(),
        };

        let mut causes = Vec::new();
        let mut retry_after = Duration::ZERO;
        if window_exhausted {
            causes.push("rate_window");
            retry_after = window.ttl;
        }
        if let Some(breach) = scores.breach(self.tracker.policy()) {
            causes.extend(breach.causes);
            retry_after = retry_after.max(breach.retry_after);
        }

        if causes.is_empty() {
            return RateDecision::Allowed(status);
        }

        RateDecision::Blocked {
            status,
            retry_after_secs: ceil_secs(retry_after).max(1),
            causes,
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
