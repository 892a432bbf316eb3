//! Pipeline statistics: aggregate counts for the admin view.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::event_repo::{self, PipelineEvent};
use super::{format_timestamp, job_repo, record_repo, DatabaseError};
use crate::pipeline::model::{JobKind, JobStatus, RecordStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: RecordStatus,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCount {
    pub kind: JobKind,
    pub status: JobStatus,
    pub count: u64,
}

/// Snapshot of pipeline health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub records_by_status: Vec<StatusCount>,
    pub jobs_by_kind_and_status: Vec<JobCount>,
    pub stale_claims: u64,
    pub retriable_failures: u64,
    pub exhausted_failures: u64,
    pub stuck_ingesting: u64,
    pub ocr_done_without_post_ocr: u64,
    pub recent_events: Vec<PipelineEvent>,
}

/// Thresholds the stats query needs to classify anomalies.
#[derive(Debug, Clone, Copy)]
pub struct StatsQuery {
    pub stale_cutoff: DateTime<Utc>,
    pub ingest_cutoff: DateTime<Utc>,
    pub max_retries: u32,
    pub recent_limit: u32,
}

pub fn collect(conn: &Connection, query: &StatsQuery) -> Result<PipelineStats, DatabaseError> {
    let records_by_status = record_repo::counts_by_status(conn)?
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect();
    let jobs_by_kind_and_status = job_repo::counts_by_kind_and_status(conn)?
        .into_iter()
        .map(|(kind, status, count)| JobCount {
            kind,
            status,
            count,
        })
        .collect();

    let stale_claims = count(
        conn,
        "SELECT COUNT(*) FROM jobs WHERE status = 'claimed' AND started_at < ?1",
        params![format_timestamp(query.stale_cutoff)],
    )?;
    let retriable_failures = count(
        conn,
        "SELECT COUNT(*) FROM jobs WHERE status = 'failed' AND attempts < ?1",
        params![query.max_retries],
    )?;
    let exhausted_failures = count(
        conn,
        "SELECT COUNT(*) FROM jobs WHERE status = 'failed' AND attempts >= ?1",
        params![query.max_retries],
    )?;
    let stuck_ingesting = record_repo::find_stuck_ingesting(conn, query.ingest_cutoff)?.len() as u64;
    let ocr_done_without_post_ocr =
        record_repo::find_ocr_done_without_post_ocr_jobs(conn)?.len() as u64;
    let recent_events = event_repo::recent(conn, query.recent_limit)?;

    Ok(PipelineStats {
        records_by_status,
        jobs_by_kind_and_status,
        stale_claims,
        retriable_failures,
        exhausted_failures,
        stuck_ingesting,
        ocr_done_without_post_ocr,
        recent_events,
    })
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<u64, DatabaseError> {
    Ok(conn.query_row(sql, params, |r| r.get(0))?)
}
