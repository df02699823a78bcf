//! Redis-backed coordination service
//!
//! - **Values**: plain string keys, `SET` creates or overwrites
//! - **Locks**: `SET resource token NX PX ttl`, released with a token-checked
//!   Lua script so an expired owner cannot delete a successor's lock
//!
//! ```rust,no_run
//! use kafka_bridge::coordination::{CoordinationClient, RedisCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let redis = RedisCoordinator::new("redis://localhost:6379")?;
//!     redis.connect().await?;
//!     redis.write("kafka-bridge/offsets/g/t/0", b"42").await?;
//!     redis.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::distributed_lock::{DistributedLock, LockGuard, LockToken, RetryConfig};
use super::CoordinationClient;
use crate::error::{BridgeError, Result};

const BACKEND: &str = "redis";

// Atomic lock release with token verification
const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Redis implementation of [`CoordinationClient`] and [`DistributedLock`]
#[derive(Clone)]
pub struct RedisCoordinator {
    client: Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    retry: RetryConfig,
}

impl std::fmt::Debug for RedisCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinator")
            .field("url", &self.client.get_connection_info().addr)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RedisCoordinator {
    /// Create a client; no connection is made until [`CoordinationClient::connect`]
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_retry(redis_url, RetryConfig::default())
    }

    /// Create a client with a custom lock retry policy
    pub fn with_retry(redis_url: &str, retry: RetryConfig) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            BridgeError::Configuration(format!("invalid redis url {}: {}", redis_url, e))
        })?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            retry,
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| BridgeError::connectivity(BACKEND, "not connected"))
    }
}

#[async_trait]
impl CoordinationClient for RedisCoordinator {
    async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.write().await;
        if connection.is_some() {
            return Ok(());
        }

        let mut manager = self.client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;

        info!(addr = %self.client.get_connection_info().addr, "Connected to Redis");
        *connection = Some(manager);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connection.write().await.take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(path).await?)
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(path).await?)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(path, data).await.map_err(|e| match BridgeError::from(e) {
            BridgeError::StorageWrite { message, .. } => BridgeError::storage_write(path, message),
            other => other,
        })?;
        debug!(path = %path, bytes = data.len(), "Wrote key");
        Ok(())
    }

    fn lock_service(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[async_trait]
impl DistributedLock for RedisCoordinator {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let token = LockToken::new();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn().await?;

        let result: Value = redis::cmd("SET")
            .arg(resource)
            .arg(token.value())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        match result {
            Value::Okay => {
                debug!(resource = %resource, token = %token, ttl_ms = ttl_ms, "Lock acquired");
                Ok(Some(LockGuard::new(
                    resource.to_string(),
                    token,
                    ttl,
                    Arc::new(self.clone()),
                )))
            }
            _ => {
                debug!(resource = %resource, "Lock already held");
                Ok(None)
            }
        }
    }

    async fn release_internal(&self, resource: &str, token: &LockToken) -> Result<()> {
        let script = Script::new(RELEASE_SCRIPT);
        let mut conn = self.conn().await?;

        let result: i32 = script
            .key(resource)
            .arg(token.value())
            .invoke_async(&mut conn)
            .await?;

        if result == 0 {
            warn!(
                resource = %resource,
                token = %token,
                "Lock release failed: token mismatch or already released"
            );
            return Err(BridgeError::lock(
                resource,
                "token mismatch or lock already released",
            ));
        }

        debug!(resource = %resource, "Lock released");
        Ok(())
    }

    async fn is_locked(&self, resource: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(resource).await?)
    }

    fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }
}
