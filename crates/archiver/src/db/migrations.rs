//! Schema migrations.
//!
//! Versions applied so far are kept in `_migrations`. Each pending step
//! runs in its own immediate transaction together with its bookkeeping
//! row, so a crash mid-step leaves the version unapplied.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::error::DatabaseError;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
    /// `(table, column)` the step adds; skipped when the column exists.
    adds_column: Option<(&'static str, &'static str)>,
}

impl Migration {
    const fn create(version: u32, name: &'static str, sql: &'static str) -> Self {
        Self {
            version,
            name,
            sql,
            adds_column: None,
        }
    }

    const fn add_column(
        version: u32,
        name: &'static str,
        sql: &'static str,
        table: &'static str,
        column: &'static str,
    ) -> Self {
        Self {
            version,
            name,
            sql,
            adds_column: Some((table, column)),
        }
    }

    fn apply(&self, conn: &Connection) -> Result<(), DatabaseError> {
        let skip = match self.adds_column {
            Some((table, column)) => column_exists(conn, table, column)?,
            None => false,
        };
        if skip {
            log::info!("Migration v{} ({}) already in place", self.version, self.name);
        } else {
            log::info!("Applying migration v{}: {}", self.version, self.name);
            conn.execute_batch(self.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: self.version,
                    reason: e.to_string(),
                })?;
        }
        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![self.version, self.name],
        )?;
        Ok(())
    }
}

const MIGRATIONS: &[Migration] = &[
    Migration::create(
        1,
        "create_records_and_pages",
        include_str!("sql/001_create_records.sql"),
    ),
    Migration::create(2, "create_jobs_table", include_str!("sql/002_create_jobs.sql")),
    Migration::create(
        3,
        "create_pipeline_events_table",
        include_str!("sql/003_create_pipeline_events.sql"),
    ),
    Migration::create(
        4,
        "create_processing_runs_table",
        include_str!("sql/004_create_processing_runs.sql"),
    ),
    Migration::add_column(
        5,
        "add_metadata_lang_to_records",
        include_str!("sql/005_add_metadata_lang.sql"),
        "records",
        "metadata_lang",
    ),
];

/// Brings the schema up to the latest version.
///
/// Safe to call from several processes opening the same file: the
/// version check is repeated inside each step's write lock.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for migration in MIGRATIONS {
        let tx = rusqlite::Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let applied = tx
            .query_row(
                "SELECT 1 FROM _migrations WHERE version = ?1",
                [migration.version],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !applied {
            migration.apply(&tx)?;
        }
        tx.commit()?;
    }

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let found: u32 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |r| r.get(0),
    )?;
    Ok(found > 0)
}
