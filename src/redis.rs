use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{CounterSnapshot, CounterStore},
};

/// Create-or-increment in one round trip. The TTL is set only by the
/// first writer; a key that somehow lost its TTL is given one again so a
/// window can never become permanent.
const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace prepended to every counter key
    pub key_prefix: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "storefront".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Counter store backed by a shared Redis instance
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisConfig,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Creating Redis counter store");

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::from(e)
        })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Timeout while creating connection manager ({}s)", connect_timeout.as_secs());
                return Err(RateLimitError::StoreUnavailable(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let store = Self {
            connection,
            config,
            script: Script::new(INCREMENT_WITH_EXPIRY),
        };
        store.health_check().await?;

        info!("Redis counter store initialized successfully");
        Ok(store)
    }

    /// Full Redis key for a counter key
    fn namespaced(&self, key: &str) -> String {
        if self.config.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.config.key_prefix, key)
        }
    }

    /// Run a command under the configured command timeout
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match self.config.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(RateLimitError::from),
                Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                    "Redis {} timed out after {}ms",
                    op,
                    limit.as_millis()
                ))),
            },
            None => fut.await.map_err(RateLimitError::from),
        }
    }
}

fn ttl_from_millis(pttl: i64) -> Option<Duration> {
    if pttl < 0 {
        None
    } else {
        Some(Duration::from_millis(pttl as u64))
    }
}

fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        self.timed("INCR", async move { conn.incr(key, 1u64).await }).await
    }

    async fn set_with_expiry_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        let reply: Option<String> = self
            .timed("SET NX", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(window_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        let pttl: i64 = self
            .timed("PTTL", async move {
                redis::cmd("PTTL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(ttl_from_millis(pttl))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        self.timed("GET", async move { conn.get(key).await }).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        self.timed("DEL", async move { conn.del(key).await }).await
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<CounterSnapshot> {
        let key = self.namespaced(key);
        let mut conn = self.connection.clone();
        let script = self.script.clone();
        let (count, pttl): (u64, i64) = self
            .timed("EVALSHA", async move {
                script
                    .key(&key)
                    .arg(window_millis(window))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(CounterSnapshot {
            count,
            ttl: ttl_from_millis(pttl),
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("PING", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}
