use std::{path::PathBuf, time::Duration};

use mobc::{Manager, Pool};
use rusqlite::Connection;
use tracing::debug;

/// Opens SQLite connections to one shard file.
#[derive(Debug)]
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new(path: PathBuf, busy_timeout: Duration) -> Self {
        Self { path, busy_timeout }
    }

    pub fn into_pool(self, size: u64, get_timeout: Duration) -> Pool<Self> {
        Pool::builder()
            .max_open(size)
            .max_idle(size)
            .get_timeout(Some(get_timeout))
            .build(self)
    }
}

#[async_trait::async_trait]
impl Manager for SqliteManager {
    type Connection = Connection;

    type Error = rusqlite::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!("open connection to '{}'", self.path.display());
        Ok(conn)
    }

    async fn check(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, Self::Error> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    }
}
