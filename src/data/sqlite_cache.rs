use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use crate::data::cache::{CacheBackend, CacheError};

/// File-backed cache on a single SQLite table. Expiry is lazy: expired rows
/// are ignored and removed when read, and swept by `purge_expired`.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    pub fn new(db_path: &str) -> Result<Self> {
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create cache directory for {}", db_path))?;
                }
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open cache database: {}", db_path))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at_ms);
            "#
        )?;

        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let purged = cache.purge_expired_blocking()?;
        info!("Initialized SQLite cache at {} ({} expired entries purged)", db_path, purged);

        Ok(cache)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn purge_expired_blocking(&self) -> Result<usize> {
        let conn = self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("cache connection poisoned"))?;
        let purged = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at_ms <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(purged)
    }
}

fn unavailable(e: rusqlite::Error) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
    conn.lock()
        .map_err(|_| CacheError::Unavailable("cache connection poisoned".to_string()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Unavailable(format!("cache task failed: {}", e)))?
}

#[async_trait]
impl CacheBackend for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.clone();
        let key = key.to_string();

        run_blocking(move || {
            let conn = lock(&conn)?;
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at_ms FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(unavailable)?;

            match row {
                Some((_, expires_at_ms)) if expires_at_ms <= Utc::now().timestamp_millis() => {
                    debug!("Evicting expired cache entry {}", key);
                    conn.execute(
                        "DELETE FROM cache_entries WHERE key = ?1 AND expires_at_ms <= ?2",
                        params![key, Utc::now().timestamp_millis()],
                    )
                    .map_err(unavailable)?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now();
        let expires_at_ms = now.timestamp_millis().saturating_add(ttl.as_millis() as i64);

        run_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO cache_entries (key, value, created_at, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    created_at = excluded.created_at,
                    expires_at_ms = excluded.expires_at_ms",
                params![key, value, now.to_rfc3339(), expires_at_ms],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.conn.clone();
        let key = key.to_string();

        run_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let conn = self.conn.clone();
        run_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at_ms <= ?1",
                params![Utc::now().timestamp_millis()],
            )
            .map_err(unavailable)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_before_ttl() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.set("article:FED", "{\"a\":1}", Duration::from_secs(60)).await.unwrap();

        assert_eq!(
            cache.get("article:FED").await.unwrap(),
            Some("{\"a\":1}".to_string())
        );
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.set("k", "v", Duration::from_millis(200)).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value_and_ttl() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.set("k", "old", Duration::from_millis(100)).await.unwrap();
        cache.set("k", "new", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.set("gone", "1", Duration::from_secs(60)).await.unwrap();
        cache.set("stale", "2", Duration::from_millis(50)).await.unwrap();
        cache.delete("gone").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.get("gone").await.unwrap(), None);
    }
}
