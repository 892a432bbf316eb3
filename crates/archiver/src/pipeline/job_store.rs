//! Durable job queue with at-most-one active claim per job.

use tracing::instrument;

use super::error::PipelineError;
use super::model::{JobKind, JobStatus, RunStatus};
use super::state_machine::{Advance, StateMachine};
use crate::clock::SharedClock;
use crate::db::job_repo::{self, Job, NewJob};
use crate::db::run_repo::{self, ProcessingRun};
use crate::db::Database;

/// Owns the job rows: enqueue, claim, complete and fail.
///
/// Claims are a single conditional `UPDATE ... RETURNING` inside an
/// immediate transaction, so any number of handles (threads or
/// processes, each with its own connection) can poll the same file.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    state: StateMachine,
}

impl JobStore {
    pub fn new(db: Database, state: StateMachine) -> Self {
        Self { db, state }
    }

    fn clock(&self) -> &SharedClock {
        self.state.clock()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    /// Inserts a pending job and wakes workers polling its kind.
    pub fn enqueue(&self, job: NewJob) -> Result<Job, PipelineError> {
        let now = self.clock().now();
        let job = self
            .db
            .with_transaction(|tx| -> Result<Job, PipelineError> {
                Ok(job_repo::insert(tx, &job, now)?)
            })?;
        log::debug!(
            "Enqueued job {} ({}) for record {}",
            job.id,
            job.kind,
            job.record_id
        );
        self.state.job_events().enqueued(job.kind, job.id);
        Ok(job)
    }

    /// Claims the oldest pending job of `kind`, or `None` if there is none.
    pub fn claim_next(&self, kind: JobKind) -> Result<Option<Job>, PipelineError> {
        let now = self.clock().now();
        let claimed = self
            .db
            .with_transaction(|tx| -> Result<Option<Job>, PipelineError> {
                Ok(job_repo::claim_next(tx, kind, now)?)
            })?;
        if let Some(job) = &claimed {
            log::debug!("Claimed job {} ({}), attempt {}", job.id, job.kind, job.attempts);
        }
        Ok(claimed)
    }

    /// Marks a claimed job completed and, in the same transaction,
    /// re-derives its record's status.
    #[instrument(skip(self))]
    pub fn complete(&self, job_id: i64) -> Result<Job, PipelineError> {
        let now = self.clock().now();
        let (job, outcome) = self
            .db
            .with_transaction(|tx| -> Result<(Job, Advance), PipelineError> {
                let job = match job_repo::mark_completed(tx, job_id, now)? {
                    Some(job) => job,
                    None => return Err(not_claimed(tx, job_id)?),
                };
                let mut outcome = Advance::default();
                self.state.on_job_completed(tx, &job, &mut outcome)?;
                Ok((job, outcome))
            })?;
        self.state.publish(&outcome);
        log::debug!("Completed job {} ({})", job.id, job.kind);
        Ok(job)
    }

    /// Marks a claimed job failed. Never retries; re-queueing is the
    /// auditor's call.
    pub fn fail(&self, job_id: i64, error: &str) -> Result<Job, PipelineError> {
        let now = self.clock().now();
        let job = self
            .db
            .with_transaction(|tx| -> Result<Job, PipelineError> {
                match job_repo::mark_failed(tx, job_id, error, now)? {
                    Some(job) => Ok(job),
                    None => Err(not_claimed(tx, job_id)?),
                }
            })?;
        log::warn!(
            "Job {} ({}) failed on attempt {}: {}",
            job.id,
            job.kind,
            job.attempts,
            error
        );
        Ok(job)
    }

    /// Opens a processing run for a job the caller has just claimed.
    pub fn open_run(&self, job_id: i64, worker_id: &str) -> Result<ProcessingRun, PipelineError> {
        let now = self.clock().now();
        Ok(self
            .db
            .with_conn(|conn| run_repo::open(conn, job_id, worker_id, now))?)
    }

    /// Closes a run. `None` if it was already closed (for example
    /// abandoned by the auditor).
    pub fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
        metrics: Option<&serde_json::Value>,
    ) -> Result<Option<ProcessingRun>, PipelineError> {
        let now = self.clock().now();
        let metrics = metrics.map(|m| m.to_string());
        Ok(self.db.with_conn(|conn| {
            run_repo::finish(conn, run_id, status, error, metrics.as_deref(), now)
        })?)
    }

    pub fn runs_for_job(&self, job_id: i64) -> Result<Vec<ProcessingRun>, PipelineError> {
        Ok(self.db.with_conn(|conn| run_repo::find_for_job(conn, job_id))?)
    }

    pub fn find_by_id(&self, job_id: i64) -> Result<Option<Job>, PipelineError> {
        Ok(self.db.with_conn(|conn| job_repo::find_by_id(conn, job_id))?)
    }

    pub fn find_for_record(&self, record_id: i64) -> Result<Vec<Job>, PipelineError> {
        Ok(self
            .db
            .with_conn(|conn| job_repo::find_for_record(conn, record_id))?)
    }

    pub fn find_for_record_and_kind_and_status(
        &self,
        record_id: i64,
        kind: JobKind,
        status: JobStatus,
    ) -> Result<Vec<Job>, PipelineError> {
        Ok(self.db.with_conn(|conn| {
            job_repo::find_for_record_and_kind_and_status(conn, record_id, kind, status)
        })?)
    }
}

/// Builds the error for a complete/fail on a job that isn't claimed.
fn not_claimed(conn: &rusqlite::Connection, job_id: i64) -> Result<PipelineError, PipelineError> {
    Ok(match job_repo::find_by_id(conn, job_id)? {
        Some(job) => PipelineError::JobNotClaimed {
            id: job_id,
            status: job.status,
        },
        None => PipelineError::JobNotFound(job_id),
    })
}
