//! Cache metadata store mapping cache keys to durable remote references.
//!
//! Backed by SQLite. Expiry is computed at read time from `created_at`
//! against the configured TTL; the store never hides or deletes expired
//! rows on lookup, so callers can distinguish "gone" from "stale".

use crate::RenderError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// One cached render: where the uploaded image lives in the remote store,
/// and when it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub cache_key: String,
    pub remote_entry_id: String,
    pub remote_locator_id: i64,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Pure expiry predicate: `now - created_at > ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age_at(now) > ttl
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(Utc::now(), ttl)
    }
}

/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl CacheStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, RenderError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, ttl)
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory(ttl: Duration) -> Result<Self, RenderError> {
        Self::with_connection(Connection::open_in_memory()?, ttl)
    }

    fn with_connection(conn: Connection, ttl: Duration) -> Result<Self, RenderError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS render_cache (
                cache_key         TEXT PRIMARY KEY,
                remote_entry_id   TEXT NOT NULL,
                remote_locator_id INTEGER NOT NULL,
                created_at        TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RenderError> {
        self.conn
            .lock()
            .map_err(|_| RenderError::CacheIo("cache connection lock poisoned".to_string()))
    }

    /// Point lookup. Returns expired entries too; the caller decides
    /// whether to trust them.
    pub fn lookup(&self, cache_key: &str) -> Result<Option<CacheEntry>, RenderError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT cache_key, remote_entry_id, remote_locator_id, created_at
                 FROM render_cache WHERE cache_key = ?1",
                params![cache_key],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert or replace; always refreshes `created_at` to now.
    pub fn upsert(
        &self,
        cache_key: &str,
        remote_locator_id: i64,
        remote_entry_id: &str,
    ) -> Result<(), RenderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO render_cache (cache_key, remote_entry_id, remote_locator_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                 remote_entry_id = excluded.remote_entry_id,
                 remote_locator_id = excluded.remote_locator_id,
                 created_at = excluded.created_at",
            params![cache_key, remote_entry_id, remote_locator_id, Utc::now()],
        )?;
        Ok(())
    }

    /// Returns whether a row was actually removed.
    pub fn delete_one(&self, cache_key: &str) -> Result<bool, RenderError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM render_cache WHERE cache_key = ?1",
            params![cache_key],
        )?;
        Ok(removed > 0)
    }

    /// Removes every row and returns how many existed.
    pub fn delete_all(&self) -> Result<usize, RenderError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM render_cache", [])?;
        Ok(removed)
    }

    /// All entries, newest first.
    pub fn list_all(&self) -> Result<Vec<CacheEntry>, RenderError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cache_key, remote_entry_id, remote_locator_id, created_at
             FROM render_cache ORDER BY created_at DESC",
        )?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Deletes rows older than the TTL; used by housekeeping, never by reads.
    pub fn purge_expired(&self) -> Result<usize, RenderError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl)
                .map_err(|e| RenderError::CacheIo(e.to_string()))?;
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM render_cache WHERE created_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            debug!("purged {removed} expired cache rows");
        }
        Ok(removed)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        cache_key: row.get(0)?,
        remote_entry_id: row.get(1)?,
        remote_locator_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}
