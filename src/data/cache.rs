use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// String key-value store with per-entry TTL. A read of an expired entry
/// must behave exactly like a missing one.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove expired entries still held by the backend. Backends with
    /// native expiry have nothing to do.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}

/// In-process backend, lost on restart.
pub struct MemoryCache {
    cache: DashMap<String, CachedValue>,
}

struct CachedValue {
    value: String,
    timestamp: Instant,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let hit = self.cache.get(key).and_then(|entry| {
            if entry.timestamp.elapsed() >= entry.ttl {
                None
            } else {
                Some(entry.value.clone())
            }
        });

        if hit.is_none() {
            // Evict on read; re-check under the write lock so a fresh value
            // written in between is kept
            self.cache.remove_if(key, |_, entry| entry.timestamp.elapsed() >= entry.ttl);
        }

        Ok(hit)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.cache.insert(key.to_string(), CachedValue {
            value: value.to_string(),
            timestamp: Instant::now(),
            ttl,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.cache.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.timestamp.elapsed() < entry.ttl);
        Ok(before.saturating_sub(self.cache.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend-agnostic JSON cache used by the pipeline.
///
/// Backend failures never reach callers: a failed read is a miss and a
/// failed write is logged and dropped, so an unreachable backend degrades
/// to regenerating on every cycle.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = self.full_key(key);

        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!("Cache HIT for key: {}", key);
                    Some(value)
                }
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    let _ = self.backend.delete(&key).await;
                    None
                }
            },
            Ok(None) => {
                debug!("Cache MISS for key: {}", key);
                None
            }
            Err(e) => {
                warn!("{} cache read failed for {}, treating as miss: {}", self.backend.name(), key, e);
                None
            }
        }
    }

    /// Store a value; returns whether the backend accepted it.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let key = self.full_key(key);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize cache value for {}: {}", key, e);
                return false;
            }
        };

        match self.backend.set(&key, &raw, ttl).await {
            Ok(()) => {
                debug!("Cache SET {} (ttl {:?})", key, ttl);
                true
            }
            Err(e) => {
                warn!("{} cache write failed for {}: {}", self.backend.name(), key, e);
                false
            }
        }
    }

    /// Sweep expired entries; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        match self.backend.purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    debug!("Purged {} expired {} cache entries", purged, self.backend.name());
                }
                purged
            }
            Err(e) => {
                warn!("{} cache purge failed: {}", self.backend.name(), e);
                0
            }
        }
    }

    #[cfg(test)]
    pub async fn delete(&self, key: &str) -> bool {
        let key = self.full_key(key);

        match self.backend.delete(&key).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} cache delete failed for {}: {}", self.backend.name(), key, e);
                false
            }
        }
    }
}
