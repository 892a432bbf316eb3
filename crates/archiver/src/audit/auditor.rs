//! Self-healing sweep over job and record state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::db::job_repo::{self, Job};
use crate::db::{record_repo, run_repo, stats_repo, Database};
use crate::pipeline::{JobStatus, JobStore, PipelineError, StateMachine};

/// Auditor heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditorConfig {
    /// A claim whose `started_at` is strictly older than this is treated
    /// as abandoned.
    pub stale_claim_threshold: Duration,
    /// Failed jobs with fewer attempts than this are re-queued; at or
    /// above it the record is moved to `error`.
    pub max_retries: u32,
    /// How long an `ingesting` record without jobs may sit untouched
    /// before it is reported.
    pub stuck_ingest_threshold: Duration,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            stale_claim_threshold: Duration::from_secs(60 * 60),
            max_retries: 3,
            stuck_ingest_threshold: Duration::from_secs(10 * 60),
        }
    }
}

/// What one audit pass found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Jobs whose stale claim was reset to pending.
    pub stale_claims_reset: Vec<i64>,
    /// Failed jobs with retries left, re-queued.
    pub failed_jobs_requeued: Vec<i64>,
    /// Records moved to `error` because a job ran out of retries.
    pub records_errored: Vec<i64>,
    /// Records stuck in `ingesting`. Reported, never repaired.
    pub stuck_ingesting: Vec<i64>,
    /// `ocr_done` records whose post-OCR jobs were (re)planned.
    pub ocr_done_replanned: Vec<i64>,
    /// Records whose status lagged their job history.
    pub records_advanced: Vec<i64>,
}

impl AuditReport {
    /// Number of anomalies repaired. Stuck ingests don't count.
    pub fn fixed(&self) -> usize {
        self.stale_claims_reset.len()
            + self.failed_jobs_requeued.len()
            + self.records_errored.len()
            + self.ocr_done_replanned.len()
            + self.records_advanced.len()
    }
}

/// Detects drift between jobs and record status and repairs the safe
/// cases.
///
/// Every repair is a conditional update in its own transaction, so audits
/// can overlap with worker traffic and with each other; a row that moved
/// since it was read is left alone.
#[derive(Clone)]
pub struct Auditor {
    jobs: JobStore,
    state: StateMachine,
    config: AuditorConfig,
    clock: SharedClock,
}

impl Auditor {
    pub fn new(
        jobs: JobStore,
        state: StateMachine,
        config: AuditorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            jobs,
            state,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &AuditorConfig {
        &self.config
    }

    fn db(&self) -> &Database {
        self.state.database()
    }

    /// Runs every pass and returns how many anomalies were fixed.
    pub fn run_audit(&self) -> Result<usize, PipelineError> {
        Ok(self.audit()?.fixed())
    }

    /// Runs every pass and returns the full report.
    pub fn audit(&self) -> Result<AuditReport, PipelineError> {
        let span = tracing::info_span!("audit");
        let _enter = span.enter();

        let now = self.clock.now();
        let mut report = AuditReport::default();

        self.reset_stale_claims(now, &mut report)?;
        self.requeue_failed(&mut report)?;
        self.report_stuck_ingests(now, &mut report)?;
        self.replan_ocr_done(&mut report)?;
        self.advance_stalled(&mut report)?;

        if report.fixed() > 0 || !report.stuck_ingesting.is_empty() {
            log::info!(
                "Audit fixed {} anomalies (stale={}, requeued={}, errored={}, replanned={}, advanced={}, stuck_ingest={})",
                report.fixed(),
                report.stale_claims_reset.len(),
                report.failed_jobs_requeued.len(),
                report.records_errored.len(),
                report.ocr_done_replanned.len(),
                report.records_advanced.len(),
                report.stuck_ingesting.len(),
            );
        } else {
            log::debug!("Audit found nothing to fix");
        }
        Ok(report)
    }

    /// Cutoffs and limits for [`stats_repo::collect`] under this config.
    pub fn stats_query(&self, recent_limit: u32) -> stats_repo::StatsQuery {
        let now = self.clock.now();
        stats_repo::StatsQuery {
            stale_cutoff: cutoff(now, self.config.stale_claim_threshold),
            ingest_cutoff: cutoff(now, self.config.stuck_ingest_threshold),
            max_retries: self.config.max_retries,
            recent_limit,
        }
    }

    /// Claimed jobs older than the staleness threshold go back to pending
    /// with `attempts` untouched; their open runs are closed as abandoned.
    fn reset_stale_claims(
        &self,
        now: DateTime<Utc>,
        report: &mut AuditReport,
    ) -> Result<(), PipelineError> {
        let _span = tracing::debug_span!("stale_claims").entered();
        let cutoff = cutoff(now, self.config.stale_claim_threshold);
        let candidates = self
            .db()
            .with_conn(|conn| job_repo::find_stale_claims(conn, cutoff))?;

        for job in candidates {
            let reset = self
                .db()
                .with_transaction(|tx| -> Result<bool, PipelineError> {
                    if !job_repo::reset_stale_claim(tx, job.id, cutoff)? {
                        return Ok(false);
                    }
                    run_repo::abandon_open_for_job(tx, job.id, "claim went stale", now)?;
                    Ok(true)
                })?;
            if reset {
                log::warn!(
                    "Reset stale claim on job {} ({}), claimed at {:?}",
                    job.id,
                    job.kind,
                    job.started_at
                );
                self.state.job_events().enqueued(job.kind, job.id);
                report.stale_claims_reset.push(job.id);
            }
        }
        Ok(())
    }

    /// Re-queues failed jobs that have retries left; records owning an
    /// exhausted job go to `error`.
    fn requeue_failed(&self, report: &mut AuditReport) -> Result<(), PipelineError> {
        let _span = tracing::debug_span!("failed_jobs").entered();
        let max_retries = self.config.max_retries;
        let failed = self
            .db()
            .with_conn(|conn| job_repo::find_by_status(conn, JobStatus::Failed))?;

        for job in failed {
            if job.attempts < max_retries {
                let requeued = self
                    .db()
                    .with_transaction(|tx| -> Result<bool, PipelineError> {
                        Ok(job_repo::reset_failed(tx, job.id, max_retries)?)
                    })?;
                if requeued {
                    log::info!(
                        "Re-queued failed job {} ({}), attempt {}/{}",
                        job.id,
                        job.kind,
                        job.attempts,
                        max_retries
                    );
                    self.state.job_events().enqueued(job.kind, job.id);
                    report.failed_jobs_requeued.push(job.id);
                }
            } else if self
                .state
                .mark_error(job.record_id, Some(job.kind.stage()), &exhausted_reason(&job))?
            {
                report.records_errored.push(job.record_id);
            }
        }
        Ok(())
    }

    fn report_stuck_ingests(
        &self,
        now: DateTime<Utc>,
        report: &mut AuditReport,
    ) -> Result<(), PipelineError> {
        let cutoff = cutoff(now, self.config.stuck_ingest_threshold);
        let stuck = self
            .db()
            .with_conn(|conn| record_repo::find_stuck_ingesting(conn, cutoff))?;
        for record in stuck {
            log::warn!(
                "Record {} has been ingesting since {} with no jobs",
                record.id,
                record.updated_at
            );
            report.stuck_ingesting.push(record.id);
        }
        Ok(())
    }

    fn replan_ocr_done(&self, report: &mut AuditReport) -> Result<(), PipelineError> {
        let records = self
            .db()
            .with_conn(record_repo::find_ocr_done_without_post_ocr_jobs)?;
        for record in records {
            if !self.state.advance(record.id)?.is_empty() {
                log::info!("Re-planned post-OCR jobs for record {}", record.id);
                report.ocr_done_replanned.push(record.id);
            }
        }
        Ok(())
    }

    /// Advances in-flight records whose status is behind their jobs, such
    /// as after a completion was written by something other than
    /// [`JobStore::complete`].
    fn advance_stalled(&self, report: &mut AuditReport) -> Result<(), PipelineError> {
        let records = self.db().with_conn(record_repo::find_in_flight)?;
        for record in records {
            let changes = self.state.advance(record.id)?;
            if let Some(last) = changes.last() {
                log::info!(
                    "Advanced stalled record {} {} -> {}",
                    record.id,
                    record.status,
                    last.to
                );
                report.records_advanced.push(record.id);
            }
        }
        Ok(())
    }

    /// Pipeline health snapshot classified with this auditor's thresholds.
    pub fn stats(&self, recent_limit: u32) -> Result<stats_repo::PipelineStats, PipelineError> {
        let query = self.stats_query(recent_limit);
        Ok(self
            .db()
            .with_conn(|conn| stats_repo::collect(conn, &query))?)
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }
}

fn exhausted_reason(job: &Job) -> String {
    format!(
        "job {} ({}) failed after {} attempts: {}",
        job.id,
        job.kind,
        job.attempts,
        job.error.as_deref().unwrap_or("unknown error")
    )
}

/// `now - threshold`, saturating at the earliest representable instant.
fn cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config() {
        let config = AuditorConfig::default();
        assert_eq!(config.stale_claim_threshold, Duration::from_secs(3600));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stuck_ingest_threshold, Duration::from_secs(600));
    }

    #[test]
    fn test_report_fixed_excludes_stuck_ingests() {
        let report = AuditReport {
            stale_claims_reset: vec![1, 2],
            records_errored: vec![9],
            stuck_ingesting: vec![4, 5, 6],
            ..Default::default()
        };
        assert_eq!(report.fixed(), 3);
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            cutoff(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
