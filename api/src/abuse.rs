//! Weighted abuse events and the scores they accumulate into.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tees_core::abuse::{AbuseKind, SubjectKey};

use crate::config::ConfigError;
use crate::store::{Counter, CounterStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    /// Weight applied when a caller does not supply one
    pub weight: u64,
    /// Per-kind score above which the subject is rejected
    pub threshold: u64,
}

/// Scoring inputs: one row per [`AbuseKind`] plus the aggregate limit.
#[derive(Debug, Clone)]
pub struct AbusePolicy {
    kinds: HashMap<AbuseKind, KindPolicy>,
    /// Lifetime of a score counter, measured from the first event.
    pub window: Duration,
    /// Aggregate score above which the subject is rejected
    pub score_limit: u64,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        let kinds = HashMap::from([
            (AbuseKind::LoginFailure, KindPolicy { weight: 3, threshold: 15 }),
            (AbuseKind::AuthFailure, KindPolicy { weight: 2, threshold: 20 }),
            (AbuseKind::ClientError, KindPolicy { weight: 1, threshold: 50 }),
            (AbuseKind::RateLimitExceeded, KindPolicy { weight: 5, threshold: 25 }),
            (AbuseKind::GenericAbuse, KindPolicy { weight: 5, threshold: 10 }),
        ]);
        Self {
            kinds,
            window: Duration::from_secs(3600),
            score_limit: 100,
        }
    }
}

impl AbusePolicy {
    pub fn kind(&self, kind: AbuseKind) -> KindPolicy {
        self.kinds.get(&kind).copied().unwrap_or(KindPolicy {
            weight: 1,
            threshold: u64::MAX,
        })
    }

    pub fn set_weight(&mut self, kind: AbuseKind, weight: u64) {
        let threshold = self.kind(kind).threshold;
        self.kinds.insert(kind, KindPolicy { weight, threshold });
    }

    pub fn set_threshold(&mut self, kind: AbuseKind, threshold: u64) {
        let weight = self.kind(kind).weight;
        self.kinds.insert(kind, KindPolicy { weight, threshold });
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::Policy("abuse window must be positive".to_string()));
        }
        if self.score_limit == 0 {
            return Err(ConfigError::Policy("abuse score limit must be positive".to_string()));
        }
        for kind in AbuseKind::ALL {
            let Some(policy) = self.kinds.get(&kind) else {
                return Err(ConfigError::Policy(format!("no policy configured for {kind}")));
            };
            if policy.weight == 0 || policy.threshold == 0 {
                return Err(ConfigError::Policy(format!(
                    "{kind} weight and threshold must be positive"
                )));
            }
        }
        Ok(())
    }
}

fn score_key(subject: &SubjectKey) -> String {
    format!("abuse:{subject}")
}

fn kind_key(kind: AbuseKind, subject: &SubjectKey) -> String {
    format!("abuse:{kind}:{subject}")
}

/// Scores currently held for one subject.
#[derive(Debug, Clone, Default)]
pub struct SubjectScores {
    pub aggregate: Option<Counter>,
    pub kinds: Vec<(AbuseKind, Option<Counter>)>,
}

/// Why a subject's scores reject it, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseBreach {
    /// `abuse_score` for the aggregate limit, otherwise the kind name
    pub causes: Vec<&'static str>,
    pub retry_after: Duration,
}

impl SubjectScores {
    pub fn score(&self) -> u64 {
        self.aggregate.map_or(0, |counter| counter.value)
    }

    pub fn kind_score(&self, kind: AbuseKind) -> u64 {
        self.kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .and_then(|(_, counter)| *counter)
            .map_or(0, |counter| counter.value)
    }

    /// Scores strictly above their limit. The retry hint is the longest TTL
    /// among the offending counters since all of them must expire first.
    pub fn breach(&self, policy: &AbusePolicy) -> Option<AbuseBreach> {
        let mut causes = Vec::new();
        let mut retry_after = Duration::ZERO;

        if let Some(counter) = self.aggregate
            && counter.value > policy.score_limit
        {
            causes.push("abuse_score");
            retry_after = retry_after.max(counter.ttl);
        }
        for (kind, counter) in &self.kinds {
            if let Some(counter) = counter
                && counter.value > policy.kind(*kind).threshold
            {
                causes.push(kind.as_str());
                retry_after = retry_after.max(counter.ttl);
            }
        }

        (!causes.is_empty()).then_some(AbuseBreach {
            causes,
            retry_after,
        })
    }
}

/// Records abuse events and answers score queries.
///
/// Never fails the caller: backend errors are logged and treated as "no
/// score", so tracking can sit on the request path.
#[derive(Clone)]
pub struct AbuseTracker {
    store: Option<Arc<dyn CounterStore>>,
    policy: Arc<AbusePolicy>,
}

impl AbuseTracker {
    pub fn new(store: Option<Arc<dyn CounterStore>>, policy: AbusePolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &AbusePolicy {
        &self.policy
    }

    pub fn subject_key(ip: &str, user_id: Option<&str>) -> SubjectKey {
        SubjectKey::new(ip, user_id)
    }

    pub async fn track_abuse_event(
        &self,
        ip: &str,
        user_id: Option<&str>,
        kind: AbuseKind,
        weight: u64,
    ) {
        self.track(&Self::subject_key(ip, user_id), kind, weight).await;
    }

    /// Record with the policy's default weight for `kind`.
    pub async fn track_default(&self, subject: &SubjectKey, kind: AbuseKind) {
        self.track(subject, kind, self.policy.kind(kind).weight).await;
    }

    pub async fn track(&self, subject: &SubjectKey, kind: AbuseKind, weight: u64) {
        if weight == 0 {
            return;
        }
        let Some(store) = &self.store else {
            tracing::debug!(
                subject = %subject,
                kind = %kind,
                "abuse tracking disabled; event dropped"
            );
            return;
        };

        let window = self.policy.window;
        let recorded = async {
            let total = store.incr(&score_key(subject), weight, window).await?;
            store.incr(&kind_key(kind, subject), weight, window).await?;
            Ok::<_, StoreError>(total)
        }
        .await;

        match recorded {
            Ok(total) => tracing::info!(
                subject = %subject,
                kind = %kind,
                weight,
                score = total.value,
                "abuse event recorded"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                subject = %subject,
                kind = %kind,
                "failed to record abuse event"
            ),
        }
    }

    /// Aggregate score, `0` when unseen, expired or unreadable.
    pub async fn get_abuse_score(&self, ip: &str, user_id: Option<&str>) -> u64 {
        let subject = Self::subject_key(ip, user_id);
        let Some(store) = &self.store else {
            return 0;
        };
        match store.get(&score_key(&subject)).await {
            Ok(counter) => counter.map_or(0, |counter| counter.value),
            Err(err) => {
                tracing::warn!(error = %err, subject = %subject, "failed to read abuse score");
                0
            }
        }
    }

    /// Aggregate and per-kind counters in a single store round trip.
    pub async fn subject_scores(&self, subject: &SubjectKey) -> Result<SubjectScores, StoreError> {
        let Some(store) = &self.store else {
            return Ok(SubjectScores::default());
        };

        let mut keys = Vec::with_capacity(AbuseKind::ALL.len() + 1);
        keys.push(score_key(subject));
        keys.extend(AbuseKind::ALL.iter().map(|kind| kind_key(*kind, subject)));

        let mut counters = store.get_many(&keys).await?.into_iter();
        let aggregate = counters.next().flatten();
        let kinds = AbuseKind::ALL.into_iter().zip(counters).collect();
        Ok(SubjectScores { aggregate, kinds })
    }
}
