use thiserror::Error;

use super::model::{JobStatus, RecordStatus};
use crate::db::DatabaseError;

/// Errors from the job store, record store and state machine.
///
/// Expected empty conditions (no pending job, a stage without jobs) are
/// never errors; they surface as `None` or as a no-op.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Job {id} is {status}, expected claimed")]
    JobNotClaimed { id: i64, status: JobStatus },

    #[error("Record {0} not found")]
    RecordNotFound(i64),

    #[error("Record {id} is {status}; cannot {action}")]
    InvalidTransition {
        id: i64,
        status: RecordStatus,
        action: &'static str,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Database(DatabaseError::Sqlite(e))
    }
}
