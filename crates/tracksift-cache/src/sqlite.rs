// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::Result;
use crate::store::CacheStore;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tracksift_domain::{FingerprintKey, RecognitionResult};

/// Row count and access clock, seeded from the table once when the store opens
/// so point reads and writes never scan it.
#[derive(Debug)]
struct Bookkeeping {
    rows: AtomicU64,
    clock: AtomicI64,
    eviction: Mutex<()>,
}

impl Bookkeeping {
    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Recognition cache persisted in SQLite, one row per fingerprint key.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
    capacity: Option<u64>,
    books: Arc<Bookkeeping>,
}

impl SqliteCacheStore {
    /// Open (creating if needed) the cache database at `path` and run migrations.
    pub async fn open(path: &Path, capacity: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                debug!(target: "cache", path = %parent.display(), "ensured cache directory");
            }
        }

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let path_str = absolute_path.to_string_lossy().replace('\\', "/");
        let db_url = format!("sqlite://{}?mode=rwc", path_str);

        info!(target: "cache", db_url = %db_url, "opening recognition cache");
        Self::connect(&db_url, 4, capacity).await
    }

    /// Private in-memory database; every connection would get its own, so the pool holds one.
    pub async fn in_memory(capacity: Option<u64>) -> Result<Self> {
        Self::connect("sqlite::memory:", 1, capacity).await
    }

    async fn connect(db_url: &str, max_connections: u32, capacity: Option<u64>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;

        sqlx::migrate!("../../migrations").run(&pool).await?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(MAX(last_used), 0) AS tick FROM recognition_cache",
        )
        .fetch_one(&pool)
        .await?;
        let rows: i64 = row.try_get("n")?;
        let tick: i64 = row.try_get("tick")?;
        debug!(target: "cache", rows, tick, "recognition cache bookkeeping seeded");

        Ok(Self {
            pool,
            capacity,
            books: Arc::new(Bookkeeping {
                rows: AtomicU64::new(rows.max(0) as u64),
                clock: AtomicI64::new(tick),
                eviction: Mutex::new(()),
            }),
        })
    }

    /// Delete least-recently-used rows until the store fits its capacity.
    async fn evict_overflow(&self) -> Result<u64> {
        let Some(capacity) = self.capacity else {
            return Ok(0);
        };
        if self.books.rows.load(Ordering::Acquire) <= capacity {
            return Ok(0);
        }

        // Serialised so concurrent writers do not each evict the same overflow.
        let _evicting = self.books.eviction.lock().await;
        let overflow = self.books.rows.load(Ordering::Acquire).saturating_sub(capacity);
        if overflow == 0 {
            return Ok(0);
        }

        let deleted = sqlx::query(
            "DELETE FROM recognition_cache WHERE key IN (
                SELECT key FROM recognition_cache ORDER BY last_used ASC LIMIT ?
            )",
        )
        .bind(overflow as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.books.rows.fetch_sub(deleted.min(overflow), Ordering::AcqRel);

        debug!(target: "cache", deleted, capacity, "evicted least recently used entries");
        Ok(deleted)
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &FingerprintKey) -> Result<Option<RecognitionResult>> {
        let key_hex = key.to_hex();
        let row = sqlx::query("SELECT result_json FROM recognition_cache WHERE key = ? LIMIT 1")
            .bind(&key_hex)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.try_get("result_json")?;
        let result: RecognitionResult = serde_json::from_str(&json)?;

        if self.capacity.is_some() {
            sqlx::query("UPDATE recognition_cache SET last_used = ? WHERE key = ?")
                .bind(self.books.tick())
                .bind(&key_hex)
                .execute(&self.pool)
                .await?;
        }

        Ok(Some(result))
    }

    async fn put(&self, key: &FingerprintKey, value: &RecognitionResult) -> Result<()> {
        let key_hex = key.to_hex();
        let json = serde_json::to_string(value)?;
        let tick = self.books.tick();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO recognition_cache (key, result_json, last_used) VALUES (?, ?, ?)",
        )
        .bind(&key_hex)
        .bind(&json)
        .bind(tick)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            sqlx::query("UPDATE recognition_cache SET result_json = ?, last_used = ? WHERE key = ?")
                .bind(&json)
                .bind(tick)
                .bind(&key_hex)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        self.books.rows.fetch_add(inserted, Ordering::AcqRel);
        self.evict_overflow().await?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM recognition_cache")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracksift_domain::ProviderId;

    fn key(n: u8) -> FingerprintKey {
        FingerprintKey::derive(&ProviderId::from("acoustid"), &[n])
    }

    fn result(title: &str) -> RecognitionResult {
        RecognitionResult::new(title, "Artist", 0.9, ProviderId::from("acoustid"))
            .with_matched_at(1_500)
            .with_raw_metadata(serde_json::json!({"acoustid": "abc"}))
    }

    #[tokio::test]
    async fn put_then_get_returns_same_result() {
        let store = SqliteCacheStore::in_memory(None).await.unwrap();
        store.put(&key(1), &result("Track A")).await.unwrap();

        assert_eq!(store.get(&key(1)).await.unwrap(), Some(result("Track A")));
        assert_eq!(store.get(&key(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_replaces_existing_entry() {
        let store = SqliteCacheStore::in_memory(None).await.unwrap();
        store.put(&key(1), &result("Old")).await.unwrap();
        store.put(&key(1), &result("New")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get(&key(1)).await.unwrap().unwrap().track_title, "New");
    }

    #[tokio::test]
    async fn evicts_least_recently_used_beyond_capacity() {
        let store = SqliteCacheStore::in_memory(Some(2)).await.unwrap();
        store.put(&key(1), &result("A")).await.unwrap();
        store.put(&key(2), &result("B")).await.unwrap();

        // Touch A so B becomes the oldest.
        store.get(&key(1)).await.unwrap();
        store.put(&key(3), &result("C")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store.get(&key(1)).await.unwrap().is_some());
        assert!(store.get(&key(2)).await.unwrap().is_none());
        assert!(store.get(&key(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn survives_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        {
            let store = SqliteCacheStore::open(&path, None).await.unwrap();
            store.put(&key(7), &result("Persisted")).await.unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteCacheStore::open(&path, None).await.unwrap();
        let hit = reopened.get(&key(7)).await.unwrap().unwrap();
        assert_eq!(hit.track_title, "Persisted");
        assert_eq!(hit.matched_at_ms, Some(1_500));
    }

    #[tokio::test]
    async fn rewriting_a_key_does_not_count_as_a_new_row() {
        let store = SqliteCacheStore::in_memory(Some(2)).await.unwrap();
        for _ in 0..5 {
            store.put(&key(1), &result("A")).await.unwrap();
        }
        store.put(&key(2), &result("B")).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store.get(&key(1)).await.unwrap().is_some());
        assert!(store.get(&key(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bookkeeping_is_seeded_from_an_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = SqliteCacheStore::open(&path, Some(2)).await.unwrap();
            store.put(&key(1), &result("A")).await.unwrap();
            store.put(&key(2), &result("B")).await.unwrap();
            store.get(&key(1)).await.unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteCacheStore::open(&path, Some(2)).await.unwrap();
        reopened.put(&key(3), &result("C")).await.unwrap();

        assert_eq!(reopened.len().await.unwrap(), 2);
        // B was the least recently used before the restart.
        assert!(reopened.get(&key(2)).await.unwrap().is_none());
        assert!(reopened.get(&key(1)).await.unwrap().is_some());
        assert!(reopened.get(&key(3)).await.unwrap().is_some());
    }
}
