//! `SharedStore` over sqlite.
//!
//! Every mutating primitive runs in one short transaction whose first
//! statement is the lazy expiry purge for its key. That purge is a write, so
//! the transaction holds the write lock from its first statement and never
//! has to upgrade a read snapshot, which is what lets several worker
//! processes share one WAL-mode database file.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricebot_core::clock::{Clock, SystemClock};
use pricebot_core::store::{SharedStore, StoreError};
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::DbPool;

pub struct SqlSharedStore {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl SqlSharedStore {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn with_system_clock(pool: DbPool) -> Self {
        Self::new(pool, Arc::new(SystemClock))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Removes every expired key in one pass. Reads already ignore expired
    /// keys; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let mut removed = 0;
        for statement in [
            "DELETE FROM store_kv WHERE key IN
                (SELECT key FROM store_expiry WHERE expires_at_ms <= ?)",
            "DELETE FROM store_zset WHERE key IN
                (SELECT key FROM store_expiry WHERE expires_at_ms <= ?)",
        ] {
            removed += sqlx::query(statement)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?
                .rows_affected();
        }
        sqlx::query("DELETE FROM store_expiry WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        debug!(event_name = "store.sqlite.purged", removed, "expired store rows removed");
        Ok(removed)
    }

    fn expiry_from(&self, ttl: Duration) -> i64 {
        self.clock.now_millis().saturating_add(duration_millis(ttl))
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn store_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(database) => {
            let message = database.message().to_ascii_lowercase();
            if message.contains("locked") || message.contains("busy") {
                StoreError::Unavailable(error.to_string())
            } else {
                StoreError::Backend(error.to_string())
            }
        }
        _ => StoreError::Backend(error.to_string()),
    }
}

async fn purge_key(conn: &mut SqliteConnection, key: &str, now: i64) -> Result<(), StoreError> {
    sqlx::query(
        "DELETE FROM store_kv
         WHERE key = ?
           AND key IN (SELECT key FROM store_expiry WHERE key = ? AND expires_at_ms <= ?)",
    )
    .bind(key)
    .bind(key)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    sqlx::query(
        "DELETE FROM store_zset
         WHERE key = ?
           AND key IN (SELECT key FROM store_expiry WHERE key = ? AND expires_at_ms <= ?)",
    )
    .bind(key)
    .bind(key)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    sqlx::query("DELETE FROM store_expiry WHERE key = ? AND expires_at_ms <= ?")
        .bind(key)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;
    Ok(())
}

async fn is_expired(conn: &mut SqliteConnection, key: &str, now: i64) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM store_expiry WHERE key = ? AND expires_at_ms <= ?")
        .bind(key)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;
    Ok(row.is_some())
}

async fn has_text(conn: &mut SqliteConnection, key: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM store_kv WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;
    Ok(row.is_some())
}

async fn has_sorted(conn: &mut SqliteConnection, key: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT 1 FROM store_zset WHERE key = ? LIMIT 1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_error)?;
    Ok(row.is_some())
}

async fn ensure_sorted(
    conn: &mut SqliteConnection,
    key: &str,
    operation: &'static str,
) -> Result<(), StoreError> {
    if has_text(conn, key).await? {
        return Err(StoreError::WrongType { key: key.to_owned(), operation });
    }
    Ok(())
}

async fn ensure_text(
    conn: &mut SqliteConnection,
    key: &str,
    operation: &'static str,
) -> Result<(), StoreError> {
    if has_sorted(conn, key).await? {
        return Err(StoreError::WrongType { key: key.to_owned(), operation });
    }
    Ok(())
}

async fn write_expiry(
    conn: &mut SqliteConnection,
    key: &str,
    expires_at_ms: Option<i64>,
) -> Result<(), StoreError> {
    match expires_at_ms {
        Some(expires_at_ms) => sqlx::query(
            "INSERT INTO store_expiry (key, expires_at_ms) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
        )
        .bind(key)
        .bind(expires_at_ms)
        .execute(&mut *conn)
        .await
        .map_err(store_error)?,
        None => sqlx::query("DELETE FROM store_expiry WHERE key = ?")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(store_error)?,
    };
    Ok(())
}

#[async_trait]
impl SharedStore for SqlSharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        if is_expired(&mut conn, key, now).await? {
            return Ok(None);
        }
        ensure_text(&mut conn, key, "get").await?;

        sqlx::query_scalar::<_, String>("SELECT value FROM store_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;

        sqlx::query("DELETE FROM store_zset WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        sqlx::query(
            "INSERT INTO store_kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        write_expiry(&mut tx, key, ttl.map(|ttl| self.expiry_from(ttl))).await?;

        tx.commit().await.map_err(store_error)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_text(&mut tx, key, "compare_and_set").await?;

        let written = match expected {
            Some(expected) => {
                sqlx::query("UPDATE store_kv SET value = ? WHERE key = ? AND value = ?")
                    .bind(value)
                    .bind(key)
                    .bind(expected)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_error)?
            }
            None => sqlx::query(
                "INSERT INTO store_kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?,
        }
        .rows_affected()
            == 1;

        if !written {
            tx.rollback().await.map_err(store_error)?;
            return Ok(false);
        }

        write_expiry(&mut tx, key, ttl.map(|ttl| self.expiry_from(ttl))).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_text(&mut tx, key, "incr").await?;

        let next = sqlx::query_scalar::<_, String>(
            "INSERT INTO store_kv (key, value) VALUES (?, '1')
             ON CONFLICT(key) DO UPDATE
               SET value = CAST(CAST(store_kv.value AS INTEGER) + 1 AS TEXT)
             WHERE CAST(CAST(store_kv.value AS INTEGER) AS TEXT) = store_kv.value
             RETURNING value",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(next) = next else {
            tx.rollback().await.map_err(store_error)?;
            return Err(StoreError::NotAnInteger { key: key.to_owned() });
        };
        let next =
            next.parse::<i64>().map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })?;

        tx.commit().await.map_err(store_error)?;
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;

        let mut removed = 0;
        let statements =
            ["DELETE FROM store_kv WHERE key = ?", "DELETE FROM store_zset WHERE key = ?"];
        for statement in statements {
            removed += sqlx::query(statement)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?
                .rows_affected();
        }
        write_expiry(&mut tx, key, None).await?;

        tx.commit().await.map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;

        if has_text(&mut tx, key).await? || has_sorted(&mut tx, key).await? {
            write_expiry(&mut tx, key, Some(self.expiry_from(ttl))).await?;
        }
        tx.commit().await.map_err(store_error)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_sorted(&mut tx, key, "zadd").await?;

        sqlx::query(
            "INSERT INTO store_zset (key, member, score) VALUES (?, ?, ?)
             ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_sorted(&mut tx, key, "zrem").await?;

        let removed = sqlx::query("DELETE FROM store_zset WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected();

        tx.commit().await.map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let now = self.clock.now_millis();
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        if is_expired(&mut conn, key, now).await? {
            return Ok(None);
        }
        ensure_sorted(&mut conn, key, "zscore").await?;

        sqlx::query_scalar::<_, f64>("SELECT score FROM store_zset WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_error)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.zcount(key, f64::NEG_INFINITY, f64::INFINITY).await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        if is_expired(&mut conn, key, now).await? {
            return Ok(0);
        }
        ensure_sorted(&mut conn, key, "zcount").await?;

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM store_zset WHERE key = ? AND score >= ? AND score <= ?",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_one(&mut *conn)
        .await
        .map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_sorted(&mut tx, key, "zrem_range_by_score").await?;

        let removed =
            sqlx::query("DELETE FROM store_zset WHERE key = ? AND score >= ? AND score <= ?")
                .bind(key)
                .bind(min)
                .bind(max)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?
                .rows_affected();

        tx.commit().await.map_err(store_error)?;
        Ok(removed)
    }

    async fn zpop_min(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        purge_key(&mut tx, key, now).await?;
        ensure_sorted(&mut tx, key, "zpop_min").await?;

        let popped = sqlx::query_as::<_, (String, f64)>(
            "SELECT member, score FROM store_zset WHERE key = ?
             ORDER BY score ASC, member ASC LIMIT ?",
        )
        .bind(key)
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        for (member, _) in &popped {
            sqlx::query("DELETE FROM store_zset WHERE key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }

        tx.commit().await.map_err(store_error)?;
        Ok(popped)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let prefix_len = i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX);

        sqlx::query_scalar::<_, String>(
            "SELECT key FROM (
                 SELECT key FROM store_kv
                 UNION
                 SELECT key FROM store_zset
             )
             WHERE substr(key, 1, ?) = ?
               AND key NOT IN (SELECT key FROM store_expiry WHERE expires_at_ms <= ?)
             ORDER BY key",
        )
        .bind(prefix_len)
        .bind(prefix)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(store_error)?;
        Ok(())
    }
}
