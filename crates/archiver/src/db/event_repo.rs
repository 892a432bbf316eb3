//! Pipeline event repository for the append-only `pipeline_events` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{format_timestamp, get_timestamp, DatabaseError};
use crate::pipeline::model::{EventKind, Stage};

/// One stage event of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub id: i64,
    pub record_id: i64,
    pub stage: Stage,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineEvent {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            stage: row.get("stage")?,
            event: row.get("event")?,
            detail: row.get("detail")?,
            created_at: get_timestamp(row, "created_at")?,
        })
    }
}

/// Appends an event. No deduplication happens here.
pub fn append(
    conn: &Connection,
    record_id: i64,
    stage: Stage,
    event: EventKind,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PipelineEvent, DatabaseError> {
    let row = conn.query_row(
        "INSERT INTO pipeline_events (record_id, stage, event, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING *",
        params![record_id, stage, event, detail, format_timestamp(now)],
        PipelineEvent::from_row,
    )?;
    Ok(row)
}

pub fn has_event(
    conn: &Connection,
    record_id: i64,
    stage: Stage,
    event: EventKind,
) -> Result<bool, DatabaseError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pipeline_events
         WHERE record_id = ?1 AND stage = ?2 AND event = ?3)",
        params![record_id, stage, event],
        |r| r.get(0),
    )?;
    Ok(exists)
}

/// Events of a record in chronological order (id breaks ties).
pub fn for_record(conn: &Connection, record_id: i64) -> Result<Vec<PipelineEvent>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM pipeline_events WHERE record_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![record_id], PipelineEvent::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Most recent events across all records, newest first.
pub fn recent(conn: &Connection, limit: u32) -> Result<Vec<PipelineEvent>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT * FROM pipeline_events ORDER BY created_at DESC, id DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit], PipelineEvent::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
