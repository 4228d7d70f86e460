use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};
use crate::data::cache::{CacheBackend, CacheError};

/// Networked backend. Expiry is native (`PSETEX`), so an expired key simply
/// reads back as nil.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    redis_url: String,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("redis_url", &self.redis_url)
            .field("conn_manager", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Initializing Redis connection manager for URL: {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis ConnectionManager: {}", e);
            anyhow!("Failed to create Redis ConnectionManager: {}", e)
        })?;

        Ok(Self {
            conn_manager,
            redis_url: redis_url.to_string(),
        })
    }
}

/// Upper bound on a single command; a stalled server must not stall a cycle.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

async fn bounded<T, F>(limit: Duration, command: F) -> Result<T, CacheError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, command).await {
        Ok(result) => result.map_err(unavailable),
        Err(_) => Err(CacheError::Unavailable(format!("redis command timed out after {:?}", limit))),
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        bounded(COMMAND_TIMEOUT, conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        // PSETEX rejects a zero TTL
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        bounded(COMMAND_TIMEOUT, conn.pset_ex::<_, _, ()>(key, value, ttl_ms)).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        bounded(COMMAND_TIMEOUT, conn.del::<_, i64>(key)).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
