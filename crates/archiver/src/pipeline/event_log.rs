//! Append-only pipeline event log and record timelines.

use serde::Serialize;

use super::error::PipelineError;
use super::model::{EventKind, Stage};
use crate::clock::SharedClock;
use crate::db::event_repo::{self, PipelineEvent};
use crate::db::job_repo::{self, JobSummary};
use crate::db::Database;

/// Everything the record detail view needs to show progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub record_id: i64,
    pub events: Vec<PipelineEvent>,
    pub jobs: Vec<JobSummary>,
}

#[derive(Clone)]
pub struct EventLog {
    db: Database,
    clock: SharedClock,
}

impl EventLog {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Appends one event. Does not deduplicate.
    pub fn record_event(
        &self,
        record_id: i64,
        stage: Stage,
        event: EventKind,
        detail: Option<&str>,
    ) -> Result<PipelineEvent, PipelineError> {
        let now = self.clock.now();
        Ok(self.db.with_conn(|conn| {
            event_repo::append(conn, record_id, stage, event, detail, now)
        })?)
    }

    pub fn has_event(
        &self,
        record_id: i64,
        stage: Stage,
        event: EventKind,
    ) -> Result<bool, PipelineError> {
        Ok(self
            .db
            .with_conn(|conn| event_repo::has_event(conn, record_id, stage, event))?)
    }

    /// Events in chronological order plus job counts per `(kind, status)`.
    ///
    /// Both halves come from one read snapshot.
    pub fn timeline(&self, record_id: i64) -> Result<Timeline, PipelineError> {
        self.db.with_snapshot(|tx| -> Result<Timeline, PipelineError> {
            Ok(Timeline {
                record_id,
                events: event_repo::for_record(tx, record_id)?,
                jobs: job_repo::summary_for_record(tx, record_id)?,
            })
        })
    }

    /// Most recent events across all records, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<PipelineEvent>, PipelineError> {
        Ok(self.db.with_conn(|conn| event_repo::recent(conn, limit))?)
    }
}
