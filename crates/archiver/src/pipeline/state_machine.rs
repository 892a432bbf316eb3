//! Record status state machine.
//!
//! The stored status is both the record's progress and the planning
//! cursor: a stage's jobs are inserted when the record leaves the previous
//! stage's done status, so a stage with no jobs at all is known to be
//! vacuous rather than "not scheduled yet".
//!
//! Every trigger re-derives the next status from the full job history of
//! the record. A stage is satisfied when every job of that stage and of
//! every earlier stage is `completed`; insertion order is never trusted.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

use super::error::PipelineError;
use super::model::{EventKind, JobKind, JobStatus, RecordStatus, Stage};
use crate::broadcast::{JobEventNotifier, RecordChange, RecordChangeNotifier};
use crate::clock::SharedClock;
use crate::db::event_repo;
use crate::db::job_repo::{self, Job, NewJob};
use crate::db::record_repo::{self, Page, Record};
use crate::db::Database;

/// Side effects of one transaction, published after it commits.
#[derive(Debug, Default)]
pub struct Advance {
    pub changes: Vec<RecordChange>,
    pub planned: Vec<Job>,
}

impl Advance {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.planned.is_empty()
    }
}

/// One due transition.
#[derive(Debug, PartialEq)]
struct Step {
    to: RecordStatus,
    completes: Option<Stage>,
    plans: &'static [Stage],
}

impl Step {
    fn to(to: RecordStatus) -> Self {
        Self {
            to,
            completes: None,
            plans: &[],
        }
    }

    fn completes(mut self, stage: Stage) -> Self {
        self.completes = Some(stage);
        self
    }

    fn plans(mut self, stages: &'static [Stage]) -> Self {
        self.plans = stages;
        self
    }
}

/// Whether every job of `stage` and of all earlier stages is completed.
/// Vacuously true when there are none.
pub fn stage_satisfied(stage: Stage, jobs: &[Job]) -> bool {
    jobs.iter()
        .filter(|j| j.kind.stage() <= stage)
        .all(|j| j.status == JobStatus::Completed)
}

/// The transition due for `record` given its jobs, if any.
fn next_step(record: &Record, jobs: &[Job]) -> Option<Step> {
    use RecordStatus::*;

    match record.status {
        Ingesting | Complete | Error => None,
        Ingested => Some(Step::to(OcrPending).plans(&[Stage::Ocr])),
        OcrPending | OcrInProgress => {
            if stage_satisfied(Stage::Ocr, jobs) {
                Some(Step::to(OcrDone).completes(Stage::Ocr))
            } else if record.status == OcrPending
                && jobs
                    .iter()
                    .any(|j| j.kind.stage() == Stage::Ocr && j.status == JobStatus::Completed)
            {
                Some(Step::to(OcrInProgress))
            } else {
                None
            }
        }
        OcrDone => Some(Step::to(PdfPending).plans(&[Stage::PdfBuild, Stage::Translation])),
        PdfPending => stage_satisfied(Stage::PdfBuild, jobs)
            .then(|| Step::to(PdfDone).completes(Stage::PdfBuild)),
        PdfDone => Some(Step::to(Translating)),
        Translating => stage_satisfied(Stage::Translation, jobs).then(|| {
            Step::to(Embedding)
                .completes(Stage::Translation)
                .plans(&[Stage::Embedding])
        }),
        Embedding => stage_satisfied(Stage::Embedding, jobs).then(|| {
            Step::to(EntitiesPending)
                .completes(Stage::Embedding)
                .plans(&[Stage::Entities])
        }),
        EntitiesPending => stage_satisfied(Stage::Entities, jobs)
            .then(|| Step::to(EntitiesDone).completes(Stage::Entities)),
        EntitiesDone => Some(Step::to(Complete)),
    }
}

/// Jobs a stage needs for `record` that do not exist yet.
fn plan_stage(stage: Stage, record: &Record, pages: &[Page], jobs: &[Job]) -> Vec<NewJob> {
    let has_kind = |kind: JobKind| jobs.iter().any(|j| j.kind == kind);
    let per_page = |kind: JobKind, payload: Option<serde_json::Value>| {
        pages
            .iter()
            .filter(|p| !jobs.iter().any(|j| j.kind == kind && j.page_id == Some(p.id)))
            .map(|p| {
                let job = NewJob::new(kind, record.id).for_page(p.id);
                match &payload {
                    Some(payload) => job.with_payload(payload),
                    None => job,
                }
            })
            .collect::<Vec<_>>()
    };

    let mut planned = Vec::new();
    match stage {
        Stage::Ingest => {}
        Stage::Ocr => {
            planned.extend(per_page(JobKind::OcrPage, Some(json!({ "lang": record.lang }))));
        }
        Stage::PdfBuild => {
            if !pages.is_empty() && !has_kind(JobKind::BuildSearchablePdf) {
                planned.push(NewJob::new(JobKind::BuildSearchablePdf, record.id));
            }
        }
        Stage::Translation => {
            if record.metadata_lang.as_deref() != Some("en") && !has_kind(JobKind::TranslateRecord) {
                let job = NewJob::new(JobKind::TranslateRecord, record.id);
                planned.push(match &record.metadata_lang {
                    Some(lang) => job.with_payload(&json!({ "lang": lang })),
                    None => job,
                });
            }
            if record.lang.as_deref() != Some("en") {
                planned.extend(per_page(JobKind::TranslatePage, None));
            }
        }
        Stage::Embedding => {
            if !has_kind(JobKind::EmbedRecord) {
                planned.push(NewJob::new(JobKind::EmbedRecord, record.id));
            }
        }
        Stage::Entities => {
            if !has_kind(JobKind::ExtractEntities) {
                planned.push(NewJob::new(JobKind::ExtractEntities, record.id));
            }
        }
    }
    planned
}

/// Writes a `started` or `completed` event unless one already exists.
fn record_once(
    conn: &Connection,
    record_id: i64,
    stage: Stage,
    event: EventKind,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, PipelineError> {
    if event_repo::has_event(conn, record_id, stage, event)? {
        return Ok(false);
    }
    event_repo::append(conn, record_id, stage, event, detail, now)?;
    Ok(true)
}

/// Drives record status from job history. The only writer of
/// `records.status` after creation.
#[derive(Clone)]
pub struct StateMachine {
    db: Database,
    clock: SharedClock,
    record_changes: RecordChangeNotifier,
    job_events: JobEventNotifier,
}

impl StateMachine {
    pub fn new(
        db: Database,
        clock: SharedClock,
        record_changes: RecordChangeNotifier,
        job_events: JobEventNotifier,
    ) -> Self {
        Self {
            db,
            clock,
            record_changes,
            job_events,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn record_changes(&self) -> &RecordChangeNotifier {
        &self.record_changes
    }

    pub fn job_events(&self) -> &JobEventNotifier {
        &self.job_events
    }

    /// Applies every transition currently due for a record.
    ///
    /// Returns the transitions in order; empty when the record is already
    /// where its job history says it should be.
    pub fn advance(&self, record_id: i64) -> Result<Vec<RecordChange>, PipelineError> {
        let outcome = self
            .db
            .with_transaction(|tx| -> Result<Advance, PipelineError> {
                let mut outcome = Advance::default();
                self.advance_in(tx, record_id, &mut outcome)?;
                Ok(outcome)
            })?;
        self.publish(&outcome);
        Ok(outcome.changes)
    }

    /// The status the record would reach if [`advance`](Self::advance)
    /// ran now, without planning or writing anything.
    ///
    /// Stops at the first status that needs jobs planned, since what comes
    /// after depends on jobs that do not exist yet.
    pub fn derive_status(&self, record_id: i64) -> Result<RecordStatus, PipelineError> {
        self.db.with_conn(|conn| {
            let record = record_repo::find_by_id(conn, record_id)?;
            let jobs = job_repo::find_for_record(conn, record_id)?;
            Ok((record, jobs))
        })
        .map_err(PipelineError::from)
        .and_then(|(record, jobs)| {
            let mut record = record.ok_or(PipelineError::RecordNotFound(record_id))?;
            while let Some(step) = next_step(&record, &jobs) {
                record.status = step.to;
                if !step.plans.is_empty() {
                    break;
                }
            }
            Ok(record.status)
        })
    }

    /// Moves a non-terminal record to `error` and writes a `failed` event.
    ///
    /// `stage` names where it failed; `None` uses the record's current
    /// stage. Returns `false` if the record was already terminal.
    pub fn mark_error(
        &self,
        record_id: i64,
        stage: Option<Stage>,
        reason: &str,
    ) -> Result<bool, PipelineError> {
        let outcome = self
            .db
            .with_transaction(|tx| -> Result<Advance, PipelineError> {
                let mut outcome = Advance::default();
                self.mark_error_in(tx, record_id, stage, reason, &mut outcome)?;
                Ok(outcome)
            })?;
        self.publish(&outcome);
        Ok(!outcome.changes.is_empty())
    }

    /// Hook for a job that just completed, run in the completing
    /// transaction: seeds the stage's `started` event if missing, then
    /// advances the record.
    pub(crate) fn on_job_completed(
        &self,
        conn: &Connection,
        job: &Job,
        outcome: &mut Advance,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now();
        let stage = job.kind.stage();
        if record_once(conn, job.record_id, stage, EventKind::Started, None, now)? {
            log::debug!(
                "Seeded {} started event for record {} from job {}",
                stage,
                job.record_id,
                job.id
            );
        }
        self.advance_in(conn, job.record_id, outcome)
    }

    /// Transaction-scoped body of [`advance`](Self::advance).
    pub(crate) fn advance_in(
        &self,
        conn: &Connection,
        record_id: i64,
        outcome: &mut Advance,
    ) -> Result<(), PipelineError> {
        loop {
            let record = record_repo::find_by_id(conn, record_id)?
                .ok_or(PipelineError::RecordNotFound(record_id))?;
            let jobs = job_repo::find_for_record(conn, record_id)?;
            let Some(step) = next_step(&record, &jobs) else {
                return Ok(());
            };

            let now = self.clock.now();
            if let Some(stage) = step.completes {
                record_once(conn, record_id, stage, EventKind::Completed, None, now)?;
            }

            if !step.plans.is_empty() {
                let pages = record_repo::pages_for_record(conn, record_id)?;
                for &stage in step.plans {
                    let new_jobs = plan_stage(stage, &record, &pages, &jobs);
                    let detail = format!("{} job(s) planned", new_jobs.len());
                    for new_job in &new_jobs {
                        outcome.planned.push(job_repo::insert(conn, new_job, now)?);
                    }
                    record_once(conn, record_id, stage, EventKind::Started, Some(&detail), now)?;
                }
            }

            if !record_repo::update_status(conn, record_id, record.status, step.to, now)? {
                return Ok(());
            }
            log::info!("Record {} {} -> {}", record_id, record.status, step.to);
            outcome.changes.push(RecordChange {
                record_id,
                from: Some(record.status),
                to: step.to,
                at: now,
            });
        }
    }

    pub(crate) fn mark_error_in(
        &self,
        conn: &Connection,
        record_id: i64,
        stage: Option<Stage>,
        reason: &str,
        outcome: &mut Advance,
    ) -> Result<(), PipelineError> {
        let record = record_repo::find_by_id(conn, record_id)?
            .ok_or(PipelineError::RecordNotFound(record_id))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let stage = stage
            .or_else(|| record.status.current_stage())
            .unwrap_or(Stage::Ingest);

        let now = self.clock.now();
        if !record_repo::update_status(conn, record_id, record.status, RecordStatus::Error, now)? {
            return Ok(());
        }
        event_repo::append(conn, record_id, stage, EventKind::Failed, Some(reason), now)?;
        log::warn!(
            "Record {} moved to error during {}: {}",
            record_id,
            stage,
            reason
        );
        outcome.changes.push(RecordChange {
            record_id,
            from: Some(record.status),
            to: RecordStatus::Error,
            at: now,
        });
        Ok(())
    }

    /// Announces committed transitions and planned jobs.
    pub(crate) fn publish(&self, outcome: &Advance) {
        for change in &outcome.changes {
            self.record_changes.notify(change.clone());
        }
        for job in &outcome.planned {
            self.job_events.enqueued(job.kind, job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(status: RecordStatus) -> Record {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Record {
            id: 1,
            archive_id: None,
            collection_id: None,
            title: "r".into(),
            lang: Some("de".into()),
            metadata_lang: None,
            status,
            page_count: 2,
            attachment_count: 0,
            created_at: t,
            updated_at: t,
        }
    }

    fn job(id: i64, kind: JobKind, status: JobStatus) -> Job {
        Job {
            id,
            kind,
            record_id: 1,
            page_id: None,
            payload: None,
            status,
            attempts: 0,
            error: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            started_at: None,
            finished_at: None,
        }
    }

    fn pages() -> Vec<Page> {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        (1..=2)
            .map(|seq| Page {
                id: seq as i64 + 10,
                record_id: 1,
                seq,
                created_at: t,
            })
            .collect()
    }

    #[test]
    fn test_stage_without_jobs_is_satisfied() {
        assert!(stage_satisfied(Stage::Translation, &[]));
        let jobs = vec![job(1, JobKind::OcrPage, JobStatus::Completed)];
        assert!(stage_satisfied(Stage::PdfBuild, &jobs));
    }

    #[test]
    fn test_earlier_stage_blocks_later_one() {
        let jobs = vec![
            job(1, JobKind::OcrPage, JobStatus::Claimed),
            job(2, JobKind::BuildSearchablePdf, JobStatus::Completed),
        ];
        assert!(!stage_satisfied(Stage::PdfBuild, &jobs));
        // Later-stage jobs don't matter for an earlier stage.
        let jobs = vec![
            job(1, JobKind::OcrPage, JobStatus::Completed),
            job(2, JobKind::TranslatePage, JobStatus::Pending),
        ];
        assert!(stage_satisfied(Stage::PdfBuild, &jobs));
    }

    #[test]
    fn test_partial_ocr_moves_to_in_progress() {
        let jobs = vec![
            job(1, JobKind::OcrPage, JobStatus::Completed),
            job(2, JobKind::OcrPage, JobStatus::Pending),
        ];
        let step = next_step(&record(RecordStatus::OcrPending), &jobs).unwrap();
        assert_eq!(step.to, RecordStatus::OcrInProgress);
        assert!(next_step(&record(RecordStatus::OcrInProgress), &jobs).is_none());
    }

    #[test]
    fn test_no_ocr_progress_no_step() {
        let jobs = vec![job(1, JobKind::OcrPage, JobStatus::Pending)];
        assert!(next_step(&record(RecordStatus::OcrPending), &jobs).is_none());
    }

    #[test]
    fn test_terminal_and_ingesting_never_step() {
        for status in [RecordStatus::Ingesting, RecordStatus::Complete, RecordStatus::Error] {
            assert!(next_step(&record(status), &[]).is_none());
        }
    }

    #[test]
    fn test_failed_job_blocks_stage() {
        let jobs = vec![job(1, JobKind::BuildSearchablePdf, JobStatus::Failed)];
        assert!(next_step(&record(RecordStatus::PdfPending), &jobs).is_none());
    }

    #[test]
    fn test_plan_ocr_one_job_per_page_with_lang() {
        let planned = plan_stage(Stage::Ocr, &record(RecordStatus::Ingested), &pages(), &[]);
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|j| j.kind == JobKind::OcrPage));
        assert_eq!(planned[0].page_id, Some(11));
        assert_eq!(planned[0].payload.as_deref(), Some(r#"{"lang":"de"}"#));
    }

    #[test]
    fn test_plan_skips_pages_already_covered() {
        let mut existing = job(1, JobKind::OcrPage, JobStatus::Completed);
        existing.page_id = Some(11);
        let planned = plan_stage(
            Stage::Ocr,
            &record(RecordStatus::Ingested),
            &pages(),
            &[existing],
        );
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].page_id, Some(12));
    }

    #[test]
    fn test_plan_translation_respects_languages() {
        let mut rec = record(RecordStatus::OcrDone);
        rec.lang = Some("en".into());
        rec.metadata_lang = Some("de".into());
        let planned = plan_stage(Stage::Translation, &rec, &pages(), &[]);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].kind, JobKind::TranslateRecord);
        assert_eq!(planned[0].payload.as_deref(), Some(r#"{"lang":"de"}"#));

        rec.metadata_lang = Some("en".into());
        assert!(plan_stage(Stage::Translation, &rec, &pages(), &[]).is_empty());
    }

    #[test]
    fn test_plan_pdf_needs_pages() {
        let rec = record(RecordStatus::OcrDone);
        assert!(plan_stage(Stage::PdfBuild, &rec, &[], &[]).is_empty());
        assert_eq!(plan_stage(Stage::PdfBuild, &rec, &pages(), &[]).len(), 1);
    }
}
