use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

use super::migrations::MIGRATIONS;

/// Busy wait applied when another process holds the cache database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A cached response, keyed by its request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Opaque fingerprint bytes of the logical request.
    pub fingerprint: Vec<u8>,
    /// Name of the source that produced the value (for stats and purges).
    pub source: String,
    /// Serialized value.
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Summary of the cache table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub expired: u64,
    /// Total size of the stored values, in bytes.
    pub bytes: u64,
}

/// A database connection holding the durable response cache.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at the given path and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        let db = Self { conn };
        db.apply_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.apply_migrations()?;
        Ok(db)
    }

    /// Get a reference to the underlying connection (for advanced queries).
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    fn apply_migrations(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")?;
        let applied: Vec<u32> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for migration in MIGRATIONS {
            if !applied.contains(&migration.version) {
                log::info!(
                    "Applying migration {} ({})",
                    migration.version,
                    migration.name
                );
                self.conn.execute_batch(migration.sql)?;
                self.conn.execute(
                    "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                    rusqlite::params![migration.version, migration.name],
                )?;
            }
        }

        Ok(())
    }
}

fn timestamp(secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))
}

// Cache CRUD
impl Database {
    /// Insert or replace a cache entry.
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        if entry.fingerprint.is_empty() {
            return Err(Error::InvalidData("empty cache fingerprint".to_string()));
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries (fingerprint, source, value, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.fingerprint,
                entry.source,
                entry.value,
                entry.created_at.timestamp(),
                entry.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a cache entry by fingerprint, expired or not.
    pub fn get_cache_entry(&self, fingerprint: &[u8]) -> Result<Option<CacheEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT fingerprint, source, value, created_at, expires_at
                 FROM cache_entries WHERE fingerprint = ?1",
                [fingerprint],
                |row| {
                    Ok(CacheEntry {
                        fingerprint: row.get(0)?,
                        source: row.get(1)?,
                        value: row.get(2)?,
                        created_at: timestamp(row.get(3)?)?,
                        expires_at: timestamp(row.get(4)?)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Remove entries whose expiry is at or before `now`. Returns the count removed.
    pub fn purge_expired_cache_entries(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            [now.timestamp()],
        )?;
        Ok(removed)
    }

    /// Remove every cache entry. Returns the count removed.
    pub fn clear_cache_entries(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM cache_entries", [])?;
        Ok(removed)
    }

    pub fn cache_stats(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(LENGTH(value)), 0)
             FROM cache_entries",
            [now.timestamp()],
            |row| {
                Ok(CacheStats {
                    entries: row.get::<_, i64>(0)?.unsigned_abs(),
                    expired: row.get::<_, i64>(1)?.unsigned_abs(),
                    bytes: row.get::<_, i64>(2)?.unsigned_abs(),
                })
            },
        )?;
        Ok(stats)
    }
}
