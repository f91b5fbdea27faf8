use std::sync::Arc;

use crate::abuse::AbuseTracker;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::store::CounterStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when no counter store is configured or reachable.
    pub store: Option<Arc<dyn CounterStore>>,
    pub tracker: AbuseTracker,
    pub limiter: RateLimiter,
}

impl AppState {
    /// Tracker and limiter share one store handle so their keys live side by side.
    pub fn new(config: Config, store: Option<Arc<dyn CounterStore>>) -> Self {
        let tracker = AbuseTracker::new(store.clone(), config.abuse.clone());
        let limiter = RateLimiter::new(store.clone(), tracker.clone(), config.rate_limit.clone());
        Self {
            config: Arc::new(config),
            store,
            tracker,
            limiter,
        }
    }
}
