//! Redis store backend.

use super::{effective_ttl, Broadcaster, KeyStore, ScanPage, Subscription, TtlStatus};
use crate::error::{Error, Result};
use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default Redis connection pool size.
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: usize = 16;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://localhost:6379"
    pub connection_timeout: Duration,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

/// Snapshot of server health: `PING` round trip plus selected `INFO` fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedisStatus {
    pub connected: bool,
    pub response_time: Duration,
    pub message: String,
    pub used_memory: u64,
    pub max_memory: u64,
    pub connected_clients: u32,
    pub redis_version: String,
}

impl RedisStatus {
    fn disconnected(message: String) -> Self {
        RedisStatus {
            connected: false,
            message,
            ..Default::default()
        }
    }
}

/// Redis backend with connection pooling and async operations.
///
/// Commands go through a `deadpool-redis` pool. Each subscription opens its
/// own pub/sub connection from the underlying `redis::Client` (the
/// `redis` crate re-exported by `deadpool-redis`, so both share one version).
///
/// # Example
///
/// ```no_run
/// # use coalesce_kit::backend::{RedisStore, RedisConfig, KeyStore};
/// # use coalesce_kit::error::Result;
/// # async fn example() -> Result<()> {
/// let store = RedisStore::new(RedisConfig {
///     url: "redis://localhost:6379".to_string(),
///     ..Default::default()
/// })
/// .await?;
/// store.set("cache:key", b"value".to_vec(), None).await?;
/// let value = store.get("cache:key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    connection_timeout: Duration,
}

impl RedisStore {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if the URL is invalid or pool creation fails
    pub async fn new(config: RedisConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::ConfigError("pool_size must be at least 1".to_string()));
        }

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::ConfigError(format!("Invalid Redis URL {}: {}", config.url, e)))?;

        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(PoolConfig::new(config.pool_size));
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Redis backend initialized with server: {} (pool size: {})",
            config.url, config.pool_size
        );

        Ok(RedisStore {
            pool,
            client,
            connection_timeout: config.connection_timeout,
        })
    }

    /// Create from URL directly.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn from_url(url: String) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let config = RedisConfig {
            url,
            pool_size,
            ..Default::default()
        };
        Self::new(config).await
    }

    async fn conn(&self) -> Result<Connection> {
        match tokio::time::timeout(self.connection_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::StoreUnavailable(format!(
                "Failed to get Redis connection: {}",
                e
            ))),
            Err(_) => Err(Error::StoreUnavailable(format!(
                "Timed out after {:?} waiting for a Redis connection",
                self.connection_timeout
            ))),
        }
    }

    /// `PING` timing plus parsed `INFO`.
    ///
    /// Never fails: connectivity problems are reported in the returned status.
    pub async fn status(&self) -> RedisStatus {
        let mut conn = match self.conn().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Error checking Redis status: {}", e);
                return RedisStatus::disconnected(format!("Error checking Redis status: {}", e));
            }
        };

        let started = Instant::now();
        let pong: std::result::Result<String, _> =
            redis::cmd("PING").query_async(&mut conn).await;
        let response_time = started.elapsed();

        let pong = match pong {
            Ok(pong) => pong,
            Err(e) => {
                error!("Error checking Redis status: {}", e);
                return RedisStatus::disconnected(format!("Error checking Redis status: {}", e));
            }
        };

        let info = match redis::cmd("INFO")
            .query_async::<String>(&mut conn)
            .await
        {
            Ok(raw) => parse_info(&raw),
            Err(e) => {
                warn!("INFO command failed: {}", e);
                HashMap::new()
            }
        };

        let connected = pong.eq_ignore_ascii_case("PONG");
        let message = if connected {
            "Redis is up and running and responding correctly".to_string()
        } else {
            let message = format!("Redis is not responding as expected. Response: {}", pong);
            warn!("{}", message);
            message
        };

        RedisStatus {
            connected,
            response_time,
            message,
            used_memory: parse_or(&info, "used_memory", 0),
            max_memory: parse_or(&info, "total_system_memory", 0),
            connected_clients: parse_or(&info, "connected_clients", 0),
            redis_version: info.get("redis_version").cloned().unwrap_or_default(),
        }
    }
}

/// Parse the `key:value` lines of an `INFO` reply, skipping `#` sections.
pub(crate) fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.is_empty() {
                return None;
            }
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_or<T: std::str::FromStr>(info: &HashMap<String, String>, key: &str, default: T) -> T {
    info.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Redis GET failed for key {}: {}", key, e)))?;

        match value {
            Some(_) => debug!("✓ Redis GET {} -> HIT", key),
            None => debug!("✓ Redis GET {} -> MISS", key),
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(d) = effective_ttl(ttl) {
            cmd.arg("PX").arg(ttl_millis(d));
        }

        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Redis SET failed for key {}: {}", key, e)))?;

        match ttl {
            Some(d) => debug!("✓ Redis SET {} (TTL: {:?})", key, d),
            None => debug!("✓ Redis SET {}", key),
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis DEL failed for key {}: {}", key, e))
            })?;

        debug!("✓ Redis DEL {} ({})", key, removed);
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Redis DEL failed: {}", e)))?;

        debug!("✓ Redis DEL {} keys ({} removed)", keys.len(), removed);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis EXISTS failed for key {}: {}", key, e))
            })?;
        Ok(count > 0)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        // SET NX PX: lock creation and expiry in one atomic command.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis SET NX failed for key {}: {}", key, e))
            })?;

        let acquired = reply.is_some();
        debug!("✓ Redis SET NX {} -> {}", key, acquired);
        Ok(acquired)
    }

    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage> {
        let mut conn = self.conn().await?;
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis SCAN failed for {}: {}", pattern, e))
            })?;

        debug!("✓ Redis SCAN {} -> {} keys", pattern, keys.len());
        Ok(ScanPage { cursor, keys })
    }

    async fn ttl(&self, key: &str) -> Result<TtlStatus> {
        let mut conn = self.conn().await?;
        let reply: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis TTL failed for key {}: {}", key, e))
            })?;
        Ok(TtlStatus::from_redis_reply(reply))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated: u64 = pexpire_cmd(key, ttl)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis PEXPIRE failed for key {}: {}", key, e))
            })?;

        debug!("✓ Redis PEXPIRE {} {:?}", key, ttl);
        Ok(updated > 0)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.status().await.connected)
    }
}

impl Broadcaster for RedisStore {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn().await?;
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Redis PUBLISH failed on {}: {}", topic, e))
            })?;

        debug!("✓ Redis PUBLISH {} -> {} receivers", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            Error::StoreUnavailable(format!("Failed to open Redis pub/sub connection: {}", e))
        })?;

        pubsub.subscribe(topic).await.map_err(|e| {
            Error::StoreUnavailable(format!("Redis SUBSCRIBE failed on {}: {}", topic, e))
        })?;

        info!("✓ Redis SUBSCRIBE {}", topic);
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }
}

/// Millisecond expiry argument. Sub-millisecond TTLs round up so Redis never
/// receives `0`, which would delete the key instead of expiring it.
fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

fn pexpire_cmd(key: &str, ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("PEXPIRE");
    cmd.arg(key).arg(ttl_millis(ttl));
    cmd
}
