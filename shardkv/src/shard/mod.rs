mod maintenance;
mod pool;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use mobc::{Connection, Pool};
use rusqlite::{params, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use maintenance::{MaintenanceReport, ShardMaintenance};
pub use pool::SqliteManager;

use crate::{
    error::{StoreError, StoreResult},
    ShardId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS storage (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_timestamp ON storage(timestamp);
";

/// Milliseconds since the UNIX epoch. Only used for rows of the durable
/// tier, which must keep their age across restarts.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A row of the durable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub payload: Bytes,
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
}

/// Durable storage of one shard: a SQLite file behind a bounded pool.
///
/// Every operation checks a connection out of the pool, waiting at most the
/// pool timeout, and returns it when the checkout guard drops, on success
/// and error paths alike.
pub struct ShardStore {
    id: ShardId,
    path: PathBuf,
    pool: Pool<SqliteManager>,
    closed: AtomicBool,
    token: CancellationToken,
}

impl ShardStore {
    pub fn db_path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.db"))
    }

    /// Opens (or creates) the shard file in `dir`. `token` stops this
    /// shard's background services.
    pub fn open(
        id: ShardId,
        dir: &Path,
        pool_size: u64,
        pool_timeout: Duration,
        token: CancellationToken,
    ) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::db_path(dir, &id);
        {
            let conn = rusqlite::Connection::open(&path)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.execute_batch(SCHEMA)?;
        }
        let pool = SqliteManager::new(path.clone(), pool_timeout)
            .into_pool(pool_size.max(1), pool_timeout);
        info!("open shard {} at '{}'", id, path.display());
        Ok(Self {
            id,
            path,
            pool,
            closed: AtomicBool::new(false),
            token,
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    async fn conn(&self) -> StoreResult<Connection<SqliteManager>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::PoolClosed(self.id.clone()));
        }
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::from_pool(&self.id, e))
    }

    pub async fn put(&self, key: &str, payload: &[u8]) -> StoreResult<()> {
        let row = StoredRow {
            payload: Bytes::copy_from_slice(payload),
            timestamp: now_millis(),
        };
        self.put_row(key, &row).await
    }

    /// Writes `row` as is, keeping its timestamp.
    pub async fn put_row(&self, key: &str, row: &StoredRow) -> StoreResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT OR REPLACE INTO storage (key, payload, timestamp) VALUES (?1, ?2, ?3)",
            params![key, row.payload.as_ref(), row.timestamp],
        )?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.get_row(key).await?.map(|row| row.payload))
    }

    pub async fn get_row(&self, key: &str) -> StoreResult<Option<StoredRow>> {
        let conn = self.conn().await?;
        let row = conn
            .query_row(
                "SELECT payload, timestamp FROM storage WHERE key = ?1",
                [key],
                |row| {
                    Ok(StoredRow {
                        payload: Bytes::from(row.get::<_, Vec<u8>>(0)?),
                        timestamp: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Returns whether a row was deleted.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn().await?;
        let n = conn.execute("DELETE FROM storage WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let conn = self.conn().await?;
        let n: i64 =
            conn.query_row("SELECT COUNT(*) FROM storage", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn().await?;
        let mut stmt = conn.prepare("SELECT key FROM storage ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Deletes rows written before `cutoff` (epoch ms).
    pub async fn purge_older_than(&self, cutoff: i64) -> StoreResult<usize> {
        let conn = self.conn().await?;
        let n =
            conn.execute("DELETE FROM storage WHERE timestamp < ?1", [cutoff])?;
        if n > 0 {
            debug!("shard {}: purged {} rows older than {}", self.id, n, cutoff);
        }
        Ok(n)
    }

    /// Reclaims space left by deleted rows.
    pub async fn compact(&self) -> StoreResult<()> {
        let conn = self.conn().await?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Copies the live database into `dst` with SQLite's online backup.
    /// Concurrent reads and writes on this shard keep going. `dst` is
    /// replaced only once the copy is complete.
    pub async fn backup_to(&self, dst: &Path) -> StoreResult<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dst.with_extension("db.partial");
        {
            let conn = self.conn().await?;
            conn.backup(rusqlite::DatabaseName::Main, &tmp, None)?;
        }
        fs::rename(&tmp, dst)?;
        Ok(())
    }

    /// Stops the shard's services and refuses further operations.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("close shard {}", self.id);
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir, id: &str) -> ShardStore {
        ShardStore::open(
            id.into(),
            dir.path(),
            2,
            Duration::from_millis(200),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        assert_eq!(shard.get("a").await.unwrap(), None);
        shard.put("a", b"one").await.unwrap();
        shard.put("a", b"two").await.unwrap();
        assert_eq!(shard.get("a").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(shard.count().await.unwrap(), 1);
        assert!(shard.delete("a").await.unwrap());
        assert!(!shard.delete("a").await.unwrap());
        assert_eq!(shard.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let shard = open(&dir, "s1");
            shard.put("k", b"v").await.unwrap();
            shard.close();
        }
        let shard = open(&dir, "s1");
        assert_eq!(shard.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn purge_removes_only_old_rows() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        let old = StoredRow {
            payload: Bytes::from_static(b"old"),
            timestamp: now_millis() - 10_000,
        };
        shard.put_row("old", &old).await.unwrap();
        shard.put("new", b"new").await.unwrap();

        let purged = shard.purge_older_than(now_millis() - 5_000).await.unwrap();
        assert_eq!(purged, 1);
        shard.compact().await.unwrap();
        assert_eq!(shard.keys().await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn pool_exhaustion_times_out() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        let first = shard.conn().await.unwrap();
        let second = shard.conn().await.unwrap();
        let third = shard.conn().await;
        assert!(matches!(third, Err(StoreError::PoolExhausted(_))));
        drop(first);
        drop(second);
        assert!(shard.count().await.is_ok());
    }

    #[tokio::test]
    async fn failed_statement_returns_connection() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        for _ in 0..5 {
            let conn = shard.conn().await.unwrap();
            assert!(conn.execute("INSERT INTO missing VALUES (1)", []).is_err());
        }
        assert!(shard.count().await.is_ok());
    }

    #[tokio::test]
    async fn backup_is_a_full_copy() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        shard.put("a", b"1").await.unwrap();
        shard.put("b", b"2").await.unwrap();
        let dst = dir.path().join("standby").join("s1_backup.db");
        shard.backup_to(&dst).await.unwrap();

        let copy = rusqlite::Connection::open(&dst).unwrap();
        let n: i64 = copy
            .query_row("SELECT COUNT(*) FROM storage", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn closed_shard_refuses_operations() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, "s1");
        shard.close();
        assert!(shard.token().is_cancelled());
        assert!(matches!(
            shard.put("a", b"1").await,
            Err(StoreError::PoolClosed(_))
        ));
    }
}
