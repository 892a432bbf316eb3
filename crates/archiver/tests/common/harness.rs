//! Test harness for isolated pipeline execution.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use archiver::broadcast::RecordChange;
use archiver::db::job_repo::Job;
use archiver::db::record_repo::NewRecord;
use archiver::{
    Auditor, AuditorConfig, Database, JobKind, JobStatus, ManualClock, Pipeline, RecordStatus,
    SharedClock,
};
use tokio::sync::broadcast;

pub const NOTIFIER_CAPACITY: usize = 1024;

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// A pipeline over a temporary SQLite file with a manual clock.
pub struct TestPipeline {
    /// Keeps the database file alive.
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub clock: ManualClock,
    pub pipeline: Pipeline,
    pub auditor: Auditor,
    auditor_config: AuditorConfig,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_auditor_config(AuditorConfig::default())
    }

    pub fn with_auditor_config(config: AuditorConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("archiver.db");
        let clock = ManualClock::new(epoch());
        let shared: SharedClock = Arc::new(clock.clone());

        let db = Database::open(&db_path).expect("Failed to open database");
        let pipeline = Pipeline::with_clock(db, Arc::clone(&shared), NOTIFIER_CAPACITY);
        let auditor = Auditor::new(
            pipeline.jobs().clone(),
            pipeline.state_machine().clone(),
            config,
            shared,
        );

        Self {
            temp_dir,
            db_path,
            clock,
            pipeline,
            auditor,
            auditor_config: config,
        }
    }

    /// A second pipeline on the same file with its own connection and the
    /// same clock, standing in for another process.
    pub fn second_handle(&self) -> Pipeline {
        let db = Database::open(&self.db_path).expect("Failed to open second handle");
        Pipeline::with_clock(db, Arc::new(self.clock.clone()), NOTIFIER_CAPACITY)
    }

    /// An auditor with the same config running on its own connection.
    pub fn second_auditor(&self) -> Auditor {
        let pipeline = self.second_handle();
        Auditor::new(
            pipeline.jobs().clone(),
            pipeline.state_machine().clone(),
            self.auditor_config,
            Arc::new(self.clock.clone()),
        )
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.pipeline.record_changes().subscribe()
    }

    /// Creates a record with `pages` pages in `lang` and completes ingest.
    pub fn ingest(&self, title: &str, lang: &str, pages: u32) -> i64 {
        let record = self
            .pipeline
            .records()
            .create(NewRecord {
                title: title.to_string(),
                lang: Some(lang.to_string()),
                ..Default::default()
            })
            .expect("create record");
        for seq in 1..=pages {
            self.pipeline
                .records()
                .add_page(record.id, seq)
                .expect("add page");
        }
        self.pipeline
            .records()
            .complete_ingest(record.id)
            .expect("complete ingest");
        record.id
    }

    pub fn status(&self, record_id: i64) -> RecordStatus {
        self.pipeline
            .records()
            .find_by_id(record_id)
            .expect("find record")
            .expect("record exists")
            .status
    }

    pub fn job(&self, job_id: i64) -> Job {
        self.pipeline
            .jobs()
            .find_by_id(job_id)
            .expect("find job")
            .expect("job exists")
    }

    pub fn jobs_of(&self, record_id: i64, kind: JobKind) -> Vec<Job> {
        self.pipeline
            .jobs()
            .find_for_record(record_id)
            .expect("find jobs")
            .into_iter()
            .filter(|j| j.kind == kind)
            .collect()
    }

    /// Claims and completes every pending job of `kind`. Returns the ids
    /// in the order they were completed.
    pub fn drain(&self, kind: JobKind) -> Vec<i64> {
        let mut done = Vec::new();
        while let Some(job) = self.pipeline.jobs().claim_next(kind).expect("claim") {
            self.pipeline.jobs().complete(job.id).expect("complete");
            done.push(job.id);
        }
        done
    }

    /// Drains every kind in pipeline order until nothing is pending.
    pub fn drain_all(&self) {
        loop {
            let mut progressed = false;
            for kind in JobKind::ALL {
                progressed |= !self.drain(kind).is_empty();
            }
            if !progressed {
                break;
            }
        }
    }

    /// Claims the next job of `kind` and fails it.
    pub fn claim_and_fail(&self, kind: JobKind, error: &str) -> Job {
        let job = self
            .pipeline
            .jobs()
            .claim_next(kind)
            .expect("claim")
            .expect("a pending job");
        self.pipeline.jobs().fail(job.id, error).expect("fail")
    }

    pub fn count_jobs(&self, record_id: i64, status: JobStatus) -> usize {
        self.pipeline
            .jobs()
            .find_for_record(record_id)
            .expect("find jobs")
            .iter()
            .filter(|j| j.status == status)
            .count()
    }
}

/// Everything currently buffered on a change subscription.
pub fn drain_changes(rx: &mut broadcast::Receiver<RecordChange>) -> Vec<RecordChange> {
    let mut changes = Vec::new();
    while let Ok(change) = rx.try_recv() {
        changes.push(change);
    }
    changes
}
