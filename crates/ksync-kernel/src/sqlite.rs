use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{now_ms, record_write, CacheEntry, CacheStore, StorageError};

pub const DEFAULT_CACHE_FILE: &str = "cache.sqlite";

/// SQLite-backed cache. Each call opens its own connection; blocking work is
/// pushed onto the blocking pool by the async trait methods.
#[derive(Clone, Debug)]
pub struct SqliteCache {
    db_path: PathBuf,
    busy: Duration,
}

impl SqliteCache {
    /// Open (creating if needed) `cache.sqlite` inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        Self::open_path(&dir.join(DEFAULT_CACHE_FILE))
    }

    pub fn open_path(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        // Busy timeout (default 5000ms; override with KSYNC_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("KSYNC_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let cache = Self {
            db_path: db_path.to_path_buf(),
            busy: Duration::from_millis(busy_ms),
        };
        let conn = Connection::open(&cache.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(cache.busy)?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        debug!(path = %cache.db_path.display(), busy_ms, "sqlite cache opened");
        Ok(cache)
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
              id TEXT PRIMARY KEY,
              data TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_ts ON cache_entries(timestamp);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn put_entry(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let data = serde_json::to_string(&entry.data)?;
        conn.execute(
            "INSERT INTO cache_entries(id,data,timestamp,updated) VALUES(?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET data=excluded.data, timestamp=excluded.timestamp, updated=excluded.updated",
            params![entry.id, data, to_sql_ts(entry.timestamp), now],
        )?;
        Ok(())
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<CacheEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id,data,timestamp FROM cache_entries WHERE id=? LIMIT 1")?;
        let row: Option<(String, String, i64)> = stmt
            .query_row([id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;
        row.map(decode_row).transpose()
    }

    pub fn delete_entry(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM cache_entries WHERE id=?", [id])?;
        Ok(n > 0)
    }

    pub fn list_entries(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match prefix {
            Some(p) => {
                // substr comparison avoids LIKE wildcard escaping
                let mut stmt = conn.prepare(
                    "SELECT id,data,timestamp FROM cache_entries WHERE substr(id,1,?)=? ORDER BY id ASC LIMIT ?",
                )?;
                let len = i64::try_from(p.chars().count()).unwrap_or(i64::MAX);
                let mapped = stmt.query_map(params![len, p, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id,data,timestamp FROM cache_entries ORDER BY id ASC LIMIT ?",
                )?;
                let mapped = stmt.query_map(params![limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                mapped.collect::<Result<Vec<_>, _>>()?
            }
        };
        rows.into_iter().map(decode_row).collect()
    }

    /// Most recently stamped entries, newest first.
    pub fn recent_entries(&self, limit: usize) -> Result<Vec<CacheEntry>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,data,timestamp FROM cache_entries ORDER BY timestamp DESC, id ASC LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn recent(&self, limit: usize) -> Result<Vec<CacheEntry>, StorageError> {
        let c = self.clone();
        tokio::task::spawn_blocking(move || c.recent_entries(limit)).await?
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn put(
        &self,
        id: &str,
        data: Value,
        timestamp: Option<u64>,
    ) -> Result<CacheEntry, StorageError> {
        let c = self.clone();
        let entry = CacheEntry::new(id, data, timestamp);
        let res = tokio::task::spawn_blocking(move || c.put_entry(&entry).map(|_| entry)).await?;
        record_write(res.is_ok());
        res
    }

    async fn get(&self, id: &str) -> Result<Option<CacheEntry>, StorageError> {
        let c = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || c.get_entry(&id)).await?
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let c = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || c.delete_entry(&id)).await?
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        let c = self.clone();
        let prefix = prefix.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || c.list_entries(prefix.as_deref(), limit)).await?
    }
}

fn to_sql_ts(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

fn decode_row((id, data, ts): (String, String, i64)) -> Result<CacheEntry, StorageError> {
    Ok(CacheEntry {
        id,
        data: serde_json::from_str(&data)?,
        timestamp: if ts < 0 { now_ms() } else { ts as u64 },
    })
}
