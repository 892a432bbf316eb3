//! Processing run repository: one row per claimed-to-finished execution
//! window of a job.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{format_timestamp, get_opt_timestamp, get_timestamp, DatabaseError};
use crate::pipeline::model::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRun {
    pub id: i64,
    pub job_id: i64,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    /// JSON text written by the worker when the run closes.
    pub metrics: Option<String>,
}

impl ProcessingRun {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            worker_id: row.get("worker_id")?,
            started_at: get_timestamp(row, "started_at")?,
            finished_at: get_opt_timestamp(row, "finished_at")?,
            status: row.get("status")?,
            error: row.get("error")?,
            metrics: row.get("metrics")?,
        })
    }
}

/// Opens a `running` run for a job.
pub fn open(
    conn: &Connection,
    job_id: i64,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<ProcessingRun, DatabaseError> {
    let run = conn.query_row(
        "INSERT INTO processing_runs (job_id, worker_id, started_at, status)
         VALUES (?1, ?2, ?3, 'running')
         RETURNING *",
        params![job_id, worker_id, format_timestamp(now)],
        ProcessingRun::from_row,
    )?;
    Ok(run)
}

/// Closes an open run. A run that already has `finished_at` is left alone
/// and `None` is returned.
pub fn finish(
    conn: &Connection,
    run_id: i64,
    status: RunStatus,
    error: Option<&str>,
    metrics: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<ProcessingRun>, DatabaseError> {
    let run = conn
        .query_row(
            "UPDATE processing_runs SET status = ?2, error = ?3, metrics = ?4, finished_at = ?5
             WHERE id = ?1 AND finished_at IS NULL
             RETURNING *",
            params![run_id, status, error, metrics, format_timestamp(now)],
            ProcessingRun::from_row,
        )
        .optional()?;
    Ok(run)
}

/// Closes every open run of a job as `abandoned`. Returns how many were
/// closed.
pub fn abandon_open_for_job(
    conn: &Connection,
    job_id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_runs SET status = 'abandoned', error = ?2, finished_at = ?3
         WHERE job_id = ?1 AND finished_at IS NULL",
        params![job_id, reason, format_timestamp(now)],
    )?;
    Ok(changed)
}

pub fn find_for_job(conn: &Connection, job_id: i64) -> Result<Vec<ProcessingRun>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT * FROM processing_runs WHERE job_id = ?1 ORDER BY started_at ASC, id ASC")?;
    let rows = stmt.query_map(params![job_id], ProcessingRun::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
