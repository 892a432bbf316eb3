//! Record repository for the `records` and `pages` tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{format_timestamp, get_timestamp, DatabaseError};
use crate::pipeline::model::RecordStatus;

/// An archival record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: i64,
    pub archive_id: Option<i64>,
    pub collection_id: Option<i64>,
    pub title: String,
    pub lang: Option<String>,
    pub metadata_lang: Option<String>,
    pub status: RecordStatus,
    pub page_count: u32,
    pub attachment_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            archive_id: row.get("archive_id")?,
            collection_id: row.get("collection_id")?,
            title: row.get("title")?,
            lang: row.get("lang")?,
            metadata_lang: row.get("metadata_lang")?,
            status: row.get("status")?,
            page_count: row.get("page_count")?,
            attachment_count: row.get("attachment_count")?,
            created_at: get_timestamp(row, "created_at")?,
            updated_at: get_timestamp(row, "updated_at")?,
        })
    }
}

/// Fields supplied by ingestion when a record is created.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewRecord {
    pub archive_id: Option<i64>,
    pub collection_id: Option<i64>,
    pub title: String,
    /// Language of the page text.
    pub lang: Option<String>,
    /// Language of the descriptive metadata.
    pub metadata_lang: Option<String>,
    pub attachment_count: u32,
}

/// A page of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: i64,
    pub record_id: i64,
    pub seq: u32,
    pub created_at: DateTime<Utc>,
}

impl Page {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            record_id: row.get("record_id")?,
            seq: row.get("seq")?,
            created_at: get_timestamp(row, "created_at")?,
        })
    }
}

/// Inserts a record in `ingesting` status.
pub fn insert(
    conn: &Connection,
    record: &NewRecord,
    now: DateTime<Utc>,
) -> Result<Record, DatabaseError> {
    let ts = format_timestamp(now);
    let row = conn.query_row(
        "INSERT INTO records (archive_id, collection_id, title, lang, metadata_lang, status,
         page_count, attachment_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)
         RETURNING *",
        params![
            record.archive_id,
            record.collection_id,
            record.title,
            record.lang,
            record.metadata_lang,
            RecordStatus::Ingesting,
            record.attachment_count,
            ts,
        ],
        Record::from_row,
    )?;
    Ok(row)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Record>, DatabaseError> {
    let record = conn
        .query_row(
            "SELECT * FROM records WHERE id = ?1",
            params![id],
            Record::from_row,
        )
        .optional()?;
    Ok(record)
}

/// Moves a record from `from` to `to`. Returns `false` if the stored
/// status was no longer `from`.
pub fn update_status(
    conn: &Connection,
    id: i64,
    from: RecordStatus,
    to: RecordStatus,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE records SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, from, to, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Deletes a record; pages, jobs, events and runs cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

/// Adds a page and bumps the record's `page_count`.
pub fn insert_page(
    conn: &Connection,
    record_id: i64,
    seq: u32,
    now: DateTime<Utc>,
) -> Result<Page, DatabaseError> {
    let ts = format_timestamp(now);
    let page = conn.query_row(
        "INSERT INTO pages (record_id, seq, created_at) VALUES (?1, ?2, ?3) RETURNING *",
        params![record_id, seq, ts],
        Page::from_row,
    )?;
    conn.execute(
        "UPDATE records SET page_count = page_count + 1, updated_at = ?2 WHERE id = ?1",
        params![record_id, ts],
    )?;
    Ok(page)
}

/// Pages of a record in sequence order.
pub fn pages_for_record(conn: &Connection, record_id: i64) -> Result<Vec<Page>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM pages WHERE record_id = ?1 ORDER BY seq ASC, id ASC")?;
    let rows = stmt.query_map(params![record_id], Page::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn find_by_status(
    conn: &Connection,
    status: RecordStatus,
) -> Result<Vec<Record>, DatabaseError> {
    query_records(
        conn,
        "SELECT * FROM records WHERE status = ?1 ORDER BY id ASC",
        params![status],
    )
}

/// Records still `ingesting`, without any job, untouched since before
/// `cutoff`.
pub fn find_stuck_ingesting(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Record>, DatabaseError> {
    query_records(
        conn,
        "SELECT * FROM records r
         WHERE r.status = 'ingesting' AND r.updated_at < ?1
           AND NOT EXISTS (SELECT 1 FROM jobs j WHERE j.record_id = r.id)
         ORDER BY r.id ASC",
        params![format_timestamp(cutoff)],
    )
}

/// `ocr_done` records that have no job of any post-OCR stage.
pub fn find_ocr_done_without_post_ocr_jobs(
    conn: &Connection,
) -> Result<Vec<Record>, DatabaseError> {
    query_records(
        conn,
        "SELECT * FROM records r
         WHERE r.status = 'ocr_done'
           AND NOT EXISTS (
               SELECT 1 FROM jobs j
               WHERE j.record_id = r.id
                 AND j.kind NOT IN ('ocr_page', 'generate_thumbs')
           )
         ORDER BY r.id ASC",
        [],
    )
}

/// Records past ingestion that have not reached a terminal status.
pub fn find_in_flight(conn: &Connection) -> Result<Vec<Record>, DatabaseError> {
    query_records(
        conn,
        "SELECT * FROM records
         WHERE status NOT IN ('ingesting', 'complete', 'error')
         ORDER BY id ASC",
        [],
    )
}

pub fn counts_by_status(conn: &Connection) -> Result<Vec<(RecordStatus, u64)>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM records GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Record>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, Record::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
