//! SQLite-backed cache store.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheError, CachePolicy, CacheStore, StoredEntry};

/// Cache store persisted in a SQLite database.
///
/// Applies the same policy as the in-memory store: TTL on read, and the
/// least recently accessed rows are deleted once `max_entries` is exceeded.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
    policy: CachePolicy,
}

impl SqliteCacheStore {
    /// Opens (or creates) the database at `path`.
    pub fn new(path: &Path, policy: CachePolicy) -> Result<Self, CacheError> {
        let conn = Connection::open(path).map_err(|e| CacheError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    /// Creates an in-memory database (useful for testing).
    pub fn in_memory(policy: CachePolicy) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS result_cache (
                cache_key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_result_cache_accessed ON result_cache(accessed_at);
            "#,
        )
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(())
    }

    fn next_access(conn: &Connection) -> Result<i64, CacheError> {
        conn.query_row(
            "SELECT COALESCE(MAX(accessed_at), 0) + 1 FROM result_cache",
            [],
            |row| row.get(0),
        )
        .map_err(|e| CacheError::Database(e.to_string()))
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT value, created_at FROM result_cache WHERE cache_key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| CacheError::Database(e.to_string()))?;

        let Some((value, created_at)) = row else {
            return Ok(None);
        };

        // An unparseable timestamp makes the row unusable; report it as expired.
        let created_at = match DateTime::parse_from_rfc3339(&created_at) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                conn.execute("DELETE FROM result_cache WHERE cache_key = ?", params![key])
                    .map_err(|e| CacheError::Database(e.to_string()))?;
                return Ok(None);
            }
        };

        if self.policy.is_expired(created_at, Utc::now()) {
            conn.execute("DELETE FROM result_cache WHERE cache_key = ?", params![key])
                .map_err(|e| CacheError::Database(e.to_string()))?;
            return Ok(None);
        }

        let access = Self::next_access(&conn)?;
        conn.execute(
            "UPDATE result_cache SET accessed_at = ? WHERE cache_key = ?",
            params![access, key],
        )
        .map_err(|e| CacheError::Database(e.to_string()))?;

        Ok(Some(StoredEntry { value, created_at }))
    }

    fn put(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| CacheError::Database(e.to_string()))?;

        let access = Self::next_access(&tx)?;
        tx.execute(
            "INSERT INTO result_cache (cache_key, value, created_at, accessed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                accessed_at = excluded.accessed_at",
            params![key, entry.value, entry.created_at.to_rfc3339(), access],
        )
        .map_err(|e| CacheError::Database(e.to_string()))?;

        tx.execute(
            "DELETE FROM result_cache WHERE cache_key IN (
                SELECT cache_key FROM result_cache
                ORDER BY accessed_at DESC
                LIMIT -1 OFFSET ?
             )",
            params![self.policy.max_entries.max(1) as i64],
        )
        .map_err(|e| CacheError::Database(e.to_string()))?;

        tx.commit().map_err(|e| CacheError::Database(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM result_cache WHERE cache_key = ?", params![key])
            .map_err(|e| CacheError::Database(e.to_string()))?;
        Ok(removed > 0)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM result_cache", [])
            .map_err(|e| CacheError::Database(e.to_string()))?;
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM result_cache", [], |row| row.get(0))
            .map_err(|e| CacheError::Database(e.to_string()))?;
        Ok(count as usize)
    }
}
