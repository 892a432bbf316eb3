//! Job repository: queries and conditional updates on the `jobs` table.
//!
//! Functions take a `&Connection` so callers can compose them inside one
//! transaction (`Transaction` derefs to `Connection`). Every state change
//! is a conditional `UPDATE ... WHERE status = <expected>` so a row that
//! moved underneath the caller is simply not touched.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{format_timestamp, get_opt_timestamp, get_timestamp, DatabaseError};
use crate::pipeline::model::{JobKind, JobStatus};

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub record_id: i64,
    pub page_id: Option<i64>,
    /// Opaque stage parameters, stored and returned verbatim.
    pub payload: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            record_id: row.get("record_id")?,
            page_id: row.get("page_id")?,
            payload: row.get("payload")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            error: row.get("error")?,
            created_at: get_timestamp(row, "created_at")?,
            started_at: get_opt_timestamp(row, "started_at")?,
            finished_at: get_opt_timestamp(row, "finished_at")?,
        })
    }

    /// Parses the payload as JSON.
    pub fn payload_json(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.payload.as_deref().map(serde_json::from_str).transpose()
    }
}

/// Parameters for a new pending job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub record_id: i64,
    pub page_id: Option<i64>,
    pub payload: Option<String>,
}

impl NewJob {
    pub fn new(kind: JobKind, record_id: i64) -> Self {
        Self {
            kind,
            record_id,
            page_id: None,
            payload: None,
        }
    }

    pub fn for_page(mut self, page_id: i64) -> Self {
        self.page_id = Some(page_id);
        self
    }

    pub fn with_payload(mut self, payload: &serde_json::Value) -> Self {
        self.payload = Some(payload.to_string());
        self
    }
}

/// Aggregated job counts for one `(kind, status)` pair of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub kind: JobKind,
    pub status: JobStatus,
    pub count: u32,
    pub first_created: DateTime<Utc>,
    pub first_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
}

/// Inserts a pending job and returns the stored row.
pub fn insert(conn: &Connection, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
    let row = conn.query_row(
        "INSERT INTO jobs (kind, record_id, page_id, payload, status, attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
         RETURNING *",
        params![
            job.kind,
            job.record_id,
            job.page_id,
            job.payload,
            format_timestamp(now),
        ],
        Job::from_row,
    )?;
    Ok(row)
}

/// Claims the oldest pending job of `kind`.
///
/// The subquery picks the FIFO head (creation time, then id); the outer
/// `AND status = 'pending'` makes the update a no-op if another
/// connection already took that row. Run it inside an immediate
/// transaction so the pick and the update see the same snapshot.
pub fn claim_next(
    conn: &Connection,
    kind: JobKind,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row(
            "UPDATE jobs
             SET status = 'claimed', attempts = attempts + 1, started_at = ?2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE kind = ?1 AND status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING *",
            params![kind, format_timestamp(now)],
            Job::from_row,
        )
        .optional()?;
    Ok(job)
}

/// Moves a claimed job to `completed`. Returns `None` if the job is not
/// currently claimed.
pub fn mark_completed(
    conn: &Connection,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row(
            "UPDATE jobs SET status = 'completed', finished_at = ?2
             WHERE id = ?1 AND status = 'claimed'
             RETURNING *",
            params![id, format_timestamp(now)],
            Job::from_row,
        )
        .optional()?;
    Ok(job)
}

/// Moves a claimed job to `failed`. Returns `None` if the job is not
/// currently claimed.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row(
            "UPDATE jobs SET status = 'failed', error = ?2, finished_at = ?3
             WHERE id = ?1 AND status = 'claimed'
             RETURNING *",
            params![id, error, format_timestamp(now)],
            Job::from_row,
        )
        .optional()?;
    Ok(job)
}

/// Resets a claim older than `cutoff` back to `pending`.
///
/// `attempts` is left alone. Returns whether the row was reset.
pub fn reset_stale_claim(
    conn: &Connection,
    id: i64,
    cutoff: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'pending', started_at = NULL
         WHERE id = ?1 AND status = 'claimed' AND started_at < ?2",
        params![id, format_timestamp(cutoff)],
    )?;
    Ok(changed == 1)
}

/// Resets a failed job with attempts left back to `pending`.
pub fn reset_failed(conn: &Connection, id: i64, max_retries: u32) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'pending', error = NULL, finished_at = NULL, started_at = NULL
         WHERE id = ?1 AND status = 'failed' AND attempts < ?2",
        params![id, max_retries],
    )?;
    Ok(changed == 1)
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Job>, DatabaseError> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], Job::from_row)
        .optional()?;
    Ok(job)
}

/// All jobs of a record, oldest first.
pub fn find_for_record(conn: &Connection, record_id: i64) -> Result<Vec<Job>, DatabaseError> {
    query_jobs(
        conn,
        "SELECT * FROM jobs WHERE record_id = ?1 ORDER BY created_at ASC, id ASC",
        params![record_id],
    )
}

pub fn find_for_record_and_kind_and_status(
    conn: &Connection,
    record_id: i64,
    kind: JobKind,
    status: JobStatus,
) -> Result<Vec<Job>, DatabaseError> {
    query_jobs(
        conn,
        "SELECT * FROM jobs WHERE record_id = ?1 AND kind = ?2 AND status = ?3
         ORDER BY created_at ASC, id ASC",
        params![record_id, kind, status],
    )
}

/// Claimed jobs whose claim started strictly before `cutoff`.
pub fn find_stale_claims(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Job>, DatabaseError> {
    query_jobs(
        conn,
        "SELECT * FROM jobs WHERE status = 'claimed' AND started_at < ?1
         ORDER BY started_at ASC, id ASC",
        params![format_timestamp(cutoff)],
    )
}

pub fn find_by_status(conn: &Connection, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
    query_jobs(
        conn,
        "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC",
        params![status],
    )
}

/// Number of jobs (any status) attached to a record.
pub fn count_for_record(conn: &Connection, record_id: i64) -> Result<u32, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE record_id = ?1",
        params![record_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Per-record job summary grouped by `(kind, status)`.
pub fn summary_for_record(
    conn: &Connection,
    record_id: i64,
) -> Result<Vec<JobSummary>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT kind, status, COUNT(*) AS count,
                MIN(created_at) AS first_created,
                MIN(started_at) AS first_started,
                MAX(finished_at) AS last_finished
         FROM jobs WHERE record_id = ?1
         GROUP BY kind, status
         ORDER BY kind, status",
    )?;
    let rows = stmt.query_map(params![record_id], |row| {
        Ok(JobSummary {
            kind: row.get("kind")?,
            status: row.get("status")?,
            count: row.get("count")?,
            first_created: get_timestamp(row, "first_created")?,
            first_started: get_opt_timestamp(row, "first_started")?,
            last_finished: get_opt_timestamp(row, "last_finished")?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Job counts across all records, grouped by `(kind, status)`.
pub fn counts_by_kind_and_status(
    conn: &Connection,
) -> Result<Vec<(JobKind, JobStatus, u64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT kind, status, COUNT(*) FROM jobs GROUP BY kind, status ORDER BY kind, status",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, Job::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (id, title, status, created_at, updated_at)
                 VALUES (1, 'r', 'ocr_pending', ?1, ?1)",
                params![format_timestamp(t0())],
            )?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_insert_returns_pending_row() {
        let db = setup();
        let payload = serde_json::json!({"lang": "de"});
        let job = db
            .with_conn(|conn| {
                insert(
                    conn,
                    &NewJob::new(JobKind::OcrPage, 1).with_payload(&payload),
                    t0(),
                )
            })
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, t0());
        assert!(job.started_at.is_none());
        assert_eq!(job.payload_json().unwrap(), Some(payload));
    }

    #[test]
    fn test_payload_is_returned_verbatim() {
        let db = setup();
        let raw = r#"{ "z": 1,   "a": [3, 2] }"#.to_string();
        let job = db
            .with_conn(|conn| {
                let mut new = NewJob::new(JobKind::TranslateRecord, 1);
                new.payload = Some(raw.clone());
                insert(conn, &new, t0())
            })
            .unwrap();
        let found = db.with_conn(|conn| find_by_id(conn, job.id)).unwrap().unwrap();
        assert_eq!(found.payload.as_deref(), Some(raw.as_str()));
    }

    #[test]
    fn test_claim_next_takes_oldest_of_kind() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0() + Duration::seconds(5))?;
            insert(conn, &NewJob::new(JobKind::EmbedRecord, 1), t0())?;
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            Ok(())
        })
        .unwrap();

        let claimed = db
            .with_conn(|conn| claim_next(conn, JobKind::OcrPage, t0() + Duration::minutes(1)))
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, 3);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started_at, Some(t0() + Duration::minutes(1)));
    }

    #[test]
    fn test_claim_next_empty_is_none() {
        let db = setup();
        let claimed = db
            .with_conn(|conn| claim_next(conn, JobKind::OcrPage, t0()))
            .unwrap();
        assert!(claimed.is_none());
    }

    #[test]
    fn test_mark_completed_requires_claim() {
        let db = setup();
        let job = db
            .with_conn(|conn| insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0()))
            .unwrap();

        let not_claimed = db.with_conn(|conn| mark_completed(conn, job.id, t0())).unwrap();
        assert!(not_claimed.is_none());

        db.with_conn(|conn| claim_next(conn, JobKind::OcrPage, t0()))
            .unwrap();
        let done = db
            .with_conn(|conn| mark_completed(conn, job.id, t0()))
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.finished_at, Some(t0()));
    }

    #[test]
    fn test_mark_failed_records_error() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            claim_next(conn, JobKind::OcrPage, t0())?;
            Ok(())
        })
        .unwrap();

        let failed = db
            .with_conn(|conn| mark_failed(conn, 1, "tesseract exited 1", t0()))
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("tesseract exited 1"));

        let again = db.with_conn(|conn| mark_failed(conn, 1, "x", t0())).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_reset_stale_claim_is_strict() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            claim_next(conn, JobKind::OcrPage, t0())?;
            Ok(())
        })
        .unwrap();

        // started_at == cutoff is not older than the cutoff.
        assert!(!db.with_conn(|conn| reset_stale_claim(conn, 1, t0())).unwrap());
        assert!(db
            .with_conn(|conn| reset_stale_claim(conn, 1, t0() + Duration::microseconds(1)))
            .unwrap());

        let job = db.with_conn(|conn| find_by_id(conn, 1)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_reset_failed_respects_max_retries() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            claim_next(conn, JobKind::OcrPage, t0())?;
            mark_failed(conn, 1, "boom", t0())?;
            Ok(())
        })
        .unwrap();

        assert!(!db.with_conn(|conn| reset_failed(conn, 1, 1)).unwrap());
        assert!(db.with_conn(|conn| reset_failed(conn, 1, 2)).unwrap());

        let job = db.with_conn(|conn| find_by_id(conn, 1)).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_summary_groups_by_kind_and_status() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0() + Duration::seconds(1))?;
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0() + Duration::seconds(2))?;
            claim_next(conn, JobKind::OcrPage, t0() + Duration::seconds(10))?;
            mark_completed(conn, 1, t0() + Duration::seconds(20))?;
            Ok(())
        })
        .unwrap();

        let summary = db.with_conn(|conn| summary_for_record(conn, 1)).unwrap();
        assert_eq!(summary.len(), 2);

        let completed = summary
            .iter()
            .find(|s| s.status == JobStatus::Completed)
            .unwrap();
        assert_eq!(completed.count, 1);
        assert_eq!(completed.first_started, Some(t0() + Duration::seconds(10)));
        assert_eq!(completed.last_finished, Some(t0() + Duration::seconds(20)));

        let pending = summary
            .iter()
            .find(|s| s.status == JobStatus::Pending)
            .unwrap();
        assert_eq!(pending.count, 2);
        assert_eq!(pending.first_created, t0() + Duration::seconds(1));
        assert!(pending.first_started.is_none());
    }

    #[test]
    fn test_find_for_record_and_kind_and_status() {
        let db = setup();
        db.with_conn(|conn| {
            insert(conn, &NewJob::new(JobKind::OcrPage, 1), t0())?;
            insert(conn, &NewJob::new(JobKind::TranslatePage, 1), t0())?;
            Ok(())
        })
        .unwrap();

        let found = db
            .with_conn(|conn| {
                find_for_record_and_kind_and_status(conn, 1, JobKind::OcrPage, JobStatus::Pending)
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, JobKind::OcrPage);
        assert_eq!(db.with_conn(|conn| count_for_record(conn, 1)).unwrap(), 2);
    }
}
