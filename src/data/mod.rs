pub mod cache;
pub mod kalshi_api;
pub mod redis_cache;
pub mod sqlite_cache;
pub mod types;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use crate::config::CacheConfig;
use cache::{CacheBackend, MemoryCache};
use redis_cache::RedisCache;
use sqlite_cache::SqliteCache;

/// Open the cache backend named in the config. An unreachable Redis at
/// startup falls back to the in-memory backend instead of aborting.
pub async fn open_cache_backend(config: &CacheConfig, redis_url: &str) -> Result<Arc<dyn CacheBackend>> {
    let backend: Arc<dyn CacheBackend> = match config.backend.to_lowercase().as_str() {
        "memory" => Arc::new(MemoryCache::new()),
        "sqlite" | "file" => Arc::new(SqliteCache::new(&config.sqlite_path)?),
        "redis" => match RedisCache::connect(redis_url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                error!("Redis unavailable ({:#}), falling back to in-memory cache", e);
                Arc::new(MemoryCache::new())
            }
        },
        other => anyhow::bail!("Unknown cache backend: {}", other),
    };

    info!("Cache backend: {}", backend.name());
    Ok(backend)
}
