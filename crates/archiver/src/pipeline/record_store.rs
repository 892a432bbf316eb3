//! Ingestion-facing record operations.

use super::error::PipelineError;
use super::model::{EventKind, RecordStatus, Stage};
use super::state_machine::{Advance, StateMachine};
use crate::broadcast::RecordChange;
use crate::db::event_repo;
use crate::db::record_repo::{self, NewRecord, Page, Record};
use crate::db::Database;

/// Creates records, attaches pages and hands finished ingests to the
/// state machine.
#[derive(Clone)]
pub struct RecordStore {
    db: Database,
    state: StateMachine,
}

impl RecordStore {
    pub fn new(db: Database, state: StateMachine) -> Self {
        Self { db, state }
    }

    /// Creates a record in `ingesting` and writes `ingest started`.
    pub fn create(&self, new: NewRecord) -> Result<Record, PipelineError> {
        let now = self.state.clock().now();
        let record = self
            .db
            .with_transaction(|tx| -> Result<Record, PipelineError> {
                let record = record_repo::insert(tx, &new, now)?;
                event_repo::append(tx, record.id, Stage::Ingest, EventKind::Started, None, now)?;
                Ok(record)
            })?;
        log::info!("Created record {} '{}'", record.id, record.title);
        self.state.record_changes().notify(RecordChange {
            record_id: record.id,
            from: None,
            to: record.status,
            at: now,
        });
        Ok(record)
    }

    /// Attaches page `seq` to a record that is still ingesting.
    pub fn add_page(&self, record_id: i64, seq: u32) -> Result<Page, PipelineError> {
        let now = self.state.clock().now();
        self.db.with_transaction(|tx| -> Result<Page, PipelineError> {
            let record = record_repo::find_by_id(tx, record_id)?
                .ok_or(PipelineError::RecordNotFound(record_id))?;
            if record.status != RecordStatus::Ingesting {
                return Err(PipelineError::InvalidTransition {
                    id: record_id,
                    status: record.status,
                    action: "add a page",
                });
            }
            Ok(record_repo::insert_page(tx, record_id, seq, now)?)
        })
    }

    /// Finishes ingestion: `ingesting -> ingested`, `ingest completed`,
    /// then advances, which plans OCR (or cascades through vacuous stages
    /// for a record without pages).
    pub fn complete_ingest(&self, record_id: i64) -> Result<Vec<RecordChange>, PipelineError> {
        let now = self.state.clock().now();
        let outcome = self
            .db
            .with_transaction(|tx| -> Result<Advance, PipelineError> {
                let record = record_repo::find_by_id(tx, record_id)?
                    .ok_or(PipelineError::RecordNotFound(record_id))?;
                if record.status != RecordStatus::Ingesting {
                    return Err(PipelineError::InvalidTransition {
                        id: record_id,
                        status: record.status,
                        action: "complete ingest",
                    });
                }

                let mut outcome = Advance::default();
                record_repo::update_status(
                    tx,
                    record_id,
                    RecordStatus::Ingesting,
                    RecordStatus::Ingested,
                    now,
                )?;
                let detail = format!("{} page(s)", record.page_count);
                event_repo::append(
                    tx,
                    record_id,
                    Stage::Ingest,
                    EventKind::Completed,
                    Some(&detail),
                    now,
                )?;
                outcome.changes.push(RecordChange {
                    record_id,
                    from: Some(RecordStatus::Ingesting),
                    to: RecordStatus::Ingested,
                    at: now,
                });
                self.state.advance_in(tx, record_id, &mut outcome)?;
                Ok(outcome)
            })?;
        self.state.publish(&outcome);
        Ok(outcome.changes)
    }

    pub fn find_by_id(&self, record_id: i64) -> Result<Option<Record>, PipelineError> {
        Ok(self
            .db
            .with_conn(|conn| record_repo::find_by_id(conn, record_id))?)
    }

    pub fn pages(&self, record_id: i64) -> Result<Vec<Page>, PipelineError> {
        Ok(self
            .db
            .with_conn(|conn| record_repo::pages_for_record(conn, record_id))?)
    }

    /// Deletes a record with its pages, jobs, events and runs.
    pub fn delete(&self, record_id: i64) -> Result<bool, PipelineError> {
        let deleted = self
            .db
            .with_transaction(|tx| -> Result<bool, PipelineError> {
                Ok(record_repo::delete(tx, record_id)?)
            })?;
        if deleted {
            log::info!("Deleted record {}", record_id);
        }
        Ok(deleted)
    }
}
