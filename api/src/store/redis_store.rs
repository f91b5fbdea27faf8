use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};

use super::{Counter, CounterStore, StoreError};

/// INCRBY and the first-time PEXPIRE must happen atomically, otherwise two
/// concurrent requests can both see a fresh key and one increment is lost
/// against a counter with no expiry.
const INCR_WITH_TTL: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end
return {value, ttl}
"#;

/// Shared counter store for multi-instance deployments.
pub struct RedisStore {
    connection: ConnectionManager,
    incr_script: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new().set_number_of_retries(1);

        let client = Client::open(redis_url)?;
        let connection =
            tokio::time::timeout(timeout, client.get_connection_manager_with_config(config))
                .await
                .map_err(|_| StoreError::Timeout(timeout))??;

        Ok(Self {
            connection,
            incr_script: Script::new(INCR_WITH_TTL),
        })
    }
}

fn ttl_from_millis(ttl_ms: i64) -> Duration {
    Duration::from_millis(ttl_ms.max(0) as u64)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str, by: u64, ttl: Duration) -> Result<Counter, StoreError> {
        let mut connection = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let (value, remaining_ms): (u64, i64) = self
            .incr_script
            .key(key)
            .arg(by)
            .arg(ttl_ms)
            .invoke_async(&mut connection)
            .await?;

        Ok(Counter {
            value,
            ttl: ttl_from_millis(remaining_ms),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        let mut connection = self.connection.clone();
        let (value, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut connection)
            .await?;

        Ok(value.map(|value| Counter {
            value,
            ttl: ttl_from_millis(ttl_ms),
        }))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Counter>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut connection = self.connection.clone();
        let values: Vec<Option<u64>> = connection.mget(keys).await?;

        let mut pipe = redis::pipe();
        for key in keys {
            pipe.pttl(key);
        }
        let ttls: Vec<i64> = pipe.query_async(&mut connection).await?;

        Ok(values
            .into_iter()
            .zip(ttls)
            .map(|(value, ttl_ms)| {
                value.map(|value| Counter {
                    value,
                    ttl: ttl_from_millis(ttl_ms),
                })
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
