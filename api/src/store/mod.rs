//! Counter stores backing the rate limiter and the abuse tracker.
//!
//! Both consumers only need three primitives: an atomic add-and-get that sets
//! a TTL when the key is created, a read, and a liveness probe. Keeping the
//! surface that small lets the in-memory map and Redis behave identically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};

pub mod memory;
pub mod redis_store;

/// Redis gets a longer budget for the initial handshake than for commands.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Value of a counter together with the time left before it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: u64,
    pub ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to `key` and return the new value.
    ///
    /// The TTL is only applied when the key is created, which makes every
    /// counter a fixed window: later increments never push the expiry out.
    async fn incr(&self, key: &str, by: u64, ttl: Duration) -> Result<Counter, StoreError>;

    /// Current value of `key`, or `None` when unseen or expired.
    async fn get(&self, key: &str) -> Result<Option<Counter>, StoreError>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Counter>>, StoreError> {
        let mut counters = Vec::with_capacity(keys.len());
        for key in keys {
            counters.push(self.get(key).await?);
        }
        Ok(counters)
    }

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

/// Bounds every call on the wrapped store so a slow backend degrades the
/// limiter to pass-through instead of stalling requests.
pub struct TimeoutStore {
    inner: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for TimeoutStore {
    async fn incr(&self, key: &str, by: u64, ttl: Duration) -> Result<Counter, StoreError> {
        self.bounded(self.inner.incr(key, by, ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Counter>>, StoreError> {
        self.bounded(self.inner.get_many(keys)).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded(self.inner.ping()).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}

/// Build the configured store. `None` means the limiter runs in pass-through
/// mode, either because it was disabled or because Redis could not be reached.
pub async fn connect(config: &StoreConfig) -> Option<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Disabled => {
            tracing::warn!("rate limit store disabled; all requests pass through");
            return None;
        }
        StoreBackend::Memory => {
            let store = Arc::new(memory::MemoryStore::new(config.memory_max_keys));
            memory::spawn_sweeper(store.clone(), config.sweep_interval);
            tracing::info!(
                max_keys = config.memory_max_keys,
                "using in-memory rate limit store"
            );
            store
        }
        StoreBackend::Redis => {
            let Some(redis_url) = config.redis_url.as_deref() else {
                tracing::error!("REDIS_URL missing; rate limiting disabled");
                return None;
            };
            match redis_store::RedisStore::connect(redis_url, REDIS_CONNECT_TIMEOUT).await {
                Ok(store) => {
                    tracing::info!("using redis rate limit store");
                    Arc::new(store)
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "redis unreachable at startup; rate limiting disabled"
                    );
                    return None;
                }
            }
        }
    };

    Some(Arc::new(TimeoutStore::new(store, config.timeout)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Counter, CounterStore, StoreError};

    /// Store that fails every call, standing in for an unreachable backend.
    pub struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn incr(&self, _key: &str, _by: u64, _ttl: Duration) -> Result<Counter, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<Counter>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    /// Store whose calls never finish in time.
    pub struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn incr(&self, _key: &str, _by: u64, _ttl: Duration) -> Result<Counter, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(StoreError::Unavailable("stalled".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<Counter>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        fn backend(&self) -> &'static str {
            "stalled"
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::testing::StalledStore;
    use super::{CounterStore, StoreError, TimeoutStore};
    use crate::config::{StoreBackend, StoreConfig};

    #[tokio::test(start_paused = true)]
    async fn timeout_store_turns_stalled_calls_into_timeouts() {
        let store = TimeoutStore::new(Arc::new(StalledStore), Duration::from_millis(100));

        let err = store
            .incr("rl:ip:203.0.113.9", 1, Duration::from_secs(60))
            .await
            .expect_err("stalled call should time out");
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(matches!(store.ping().await, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn disabled_backend_yields_no_store() {
        let config = StoreConfig {
            backend: StoreBackend::Disabled,
            ..StoreConfig::default()
        };
        assert!(super::connect(&config).await.is_none());
    }

    #[tokio::test]
    async fn redis_backend_without_url_yields_no_store() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: None,
            ..StoreConfig::default()
        };
        assert!(super::connect(&config).await.is_none());
    }

    #[tokio::test]
    async fn memory_backend_is_wrapped_and_usable() {
        let store = super::connect(&StoreConfig::default())
            .await
            .expect("memory store should build");
        assert_eq!(store.backend(), "memory");
        let counter = store
            .incr("abuse:ip:203.0.113.9", 4, Duration::from_secs(60))
            .await
            .expect("incr should succeed");
        assert_eq!(counter.value, 4);
        store.ping().await.expect("memory store should answer ping");
    }
}
