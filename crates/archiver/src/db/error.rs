//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("Cannot create database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value could not be mapped back onto its Rust type.
    #[error("Invalid value '{value}' in column '{column}'")]
    InvalidColumn { column: &'static str, value: String },

    /// A thread panicked while holding the connection.
    #[error("Connection mutex poisoned")]
    LockPoisoned,
}
