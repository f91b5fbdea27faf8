use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Counter, CounterStore, StoreError};

/// Process-local counter store: a TTL map bounded by least-recently-used
/// eviction, so rotating client addresses cannot grow it without limit.
///
/// State does not survive a restart; every key starts from zero again.
pub struct MemoryStore {
    counters: Mutex<LruCache<String, Entry>>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn counter(&self, now: Instant) -> Counter {
        Counter {
            value: self.value,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// Look up a live entry, dropping it first if its window has passed.
/// A hit also refreshes the key's recency.
fn live_entry<'a>(
    cache: &'a mut LruCache<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if cache.peek(key).is_some_and(|entry| entry.is_expired(now)) {
        cache.pop(key);
        return None;
    }
    cache.get_mut(key)
}

impl MemoryStore {
    pub fn new(max_keys: usize) -> Self {
        let capacity = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            counters: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Remove every expired counter. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.counters.lock().await;
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.counters.lock().await.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str, by: u64, ttl: Duration) -> Result<Counter, StoreError> {
        let now = Instant::now();
        let mut cache = self.counters.lock().await;

        if let Some(entry) = live_entry(&mut cache, key, now) {
            entry.value = entry.value.saturating_add(by);
            return Ok(entry.counter(now));
        }

        let entry = Entry {
            value: by,
            expires_at: now + ttl,
        };
        if let Some((evicted, _)) = cache.push(key.to_owned(), entry) {
            tracing::debug!(
                evicted = %evicted,
                max_keys = cache.cap().get(),
                "memory store evicted counter"
            );
        }
        Ok(entry.counter(now))
    }

    async fn get(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        let now = Instant::now();
        let mut cache = self.counters.lock().await;
        Ok(live_entry(&mut cache, key, now).map(|entry| entry.counter(now)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Periodically drop expired counters. Lazy expiry on read keeps results
/// correct; the sweep only reclaims memory for keys nobody asks about again.
pub fn spawn_sweeper(store: Arc<MemoryStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = store.sweep_expired().await;
            if removed > 0 {
                let remaining = store.len().await;
                tracing::debug!(removed, remaining, "swept expired counters");
            }
        }
    })
}
