//! Database module for persistent storage.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle. Every
//! process (or every independent worker in tests) opens its own handle on
//! the same database file; SQLite's write lock is what makes claims and
//! state advances atomic across them. Within one handle, access is
//! serialized through a `Mutex<Connection>`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

pub mod error;
pub mod event_repo;
pub mod job_repo;
pub mod migrations;
pub mod record_repo;
pub mod run_repo;
pub mod stats_repo;

pub use error::DatabaseError;

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`) and clones share the connection. Open a
/// second handle with [`Database::open`] to get an independent connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction.
    ///
    /// `BEGIN IMMEDIATE` takes the database write lock up front, so every
    /// read inside `f` sees a state no other connection can change until
    /// commit. The transaction is rolled back if `f` returns an error.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }

    /// Runs read-only `f` against one consistent snapshot.
    ///
    /// The transaction is deferred, so under WAL it never takes the write
    /// lock and does not wait on writers.
    pub fn with_snapshot<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(DatabaseError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }
}

/// Returns the canonical database path: `~/.archiver/data/archiver.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".archiver").join("data").join("archiver.db"))
}

/// Formats a timestamp for storage.
///
/// Fixed-width microsecond RFC 3339 with a `Z` suffix, so string order in
/// SQL equals chronological order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidColumn {
            column: "timestamp",
            value: s.to_string(),
        })
}

/// Maps a `DatabaseError` raised while decoding a column into the error
/// type rusqlite row mappers must return.
pub(crate) fn conversion_error(idx: usize, err: DatabaseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Reads a required timestamp column.
pub(crate) fn get_timestamp(
    row: &rusqlite::Row<'_>,
    column: &str,
) -> Result<DateTime<Utc>, rusqlite::Error> {
    let idx = row.as_ref().column_index(column)?;
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

/// Reads an optional timestamp column.
pub(crate) fn get_opt_timestamp(
    row: &rusqlite::Row<'_>,
    column: &str,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let idx = row.as_ref().column_index(column)?;
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_two_handles_share_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = Database::open(&path).unwrap();
        let b = Database::open(&path).unwrap();

        a.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (title, status, created_at, updated_at)
                 VALUES ('r', 'ingesting', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: u32 = b
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DatabaseError> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO records (title, status, created_at, updated_at)
                 VALUES ('r', 'ingesting', 'x', 'x')",
                [],
            )?;
            Err(DatabaseError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path();
        assert!(path.is_some());
        let path = path.unwrap();
        assert!(path.ends_with("archiver.db"));
        assert!(path.to_string_lossy().contains(".archiver"));
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1);
        let a = format_timestamp(early);
        let b = format_timestamp(late);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), early);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(DatabaseError::InvalidColumn { .. })
        ));
    }
}
