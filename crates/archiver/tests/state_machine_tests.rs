//! Record status derivation through whole pipeline runs.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use archiver::pipeline::{EventKind, Stage};
use archiver::{JobKind, JobStatus, RecordStatus};
use common::harness::drain_changes;
use common::TestPipeline;
use serial_test::serial;

fn count_events(harness: &TestPipeline, record_id: i64, stage: Stage, event: EventKind) -> usize {
    harness
        .pipeline
        .events()
        .timeline(record_id)
        .unwrap()
        .events
        .iter()
        .filter(|e| e.stage == stage && e.event == event)
        .count()
}

#[test]
fn test_three_page_ocr_scenario() {
    let harness = TestPipeline::new();
    let mut changes = harness.subscribe_changes();
    let record_id = harness.ingest("Zivilstandsregister", "de", 3);

    assert_eq!(harness.status(record_id), RecordStatus::OcrPending);
    let ocr_jobs = harness.jobs_of(record_id, JobKind::OcrPage);
    assert_eq!(ocr_jobs.len(), 3);
    assert!(ocr_jobs.iter().all(|j| j.status == JobStatus::Pending));
    drain_changes(&mut changes);

    let jobs = harness.pipeline.jobs();
    let first = jobs.claim_next(JobKind::OcrPage).unwrap().unwrap();
    jobs.complete(first.id).unwrap();
    assert_eq!(harness.status(record_id), RecordStatus::OcrInProgress);

    let second = jobs.claim_next(JobKind::OcrPage).unwrap().unwrap();
    jobs.complete(second.id).unwrap();
    assert_eq!(harness.status(record_id), RecordStatus::OcrInProgress);
    assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Completed), 0);

    let third = jobs.claim_next(JobKind::OcrPage).unwrap().unwrap();
    jobs.complete(third.id).unwrap();

    // ocr_done is reached and immediately left: post-OCR work is planned
    // in the same transaction.
    let observed: Vec<_> = drain_changes(&mut changes)
        .into_iter()
        .map(|c| (c.from, c.to))
        .collect();
    assert_eq!(
        observed,
        vec![
            (Some(RecordStatus::OcrPending), RecordStatus::OcrInProgress),
            (Some(RecordStatus::OcrInProgress), RecordStatus::OcrDone),
            (Some(RecordStatus::OcrDone), RecordStatus::PdfPending),
        ]
    );
    assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Completed), 1);
    assert_eq!(harness.jobs_of(record_id, JobKind::BuildSearchablePdf).len(), 1);
    assert_eq!(harness.jobs_of(record_id, JobKind::TranslatePage).len(), 3);
    assert_eq!(harness.jobs_of(record_id, JobKind::TranslateRecord).len(), 1);

    // Auditing afterwards must not duplicate anything.
    assert_eq!(harness.auditor.run_audit().unwrap(), 0);
    assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Completed), 1);
    assert_eq!(harness.jobs_of(record_id, JobKind::BuildSearchablePdf).len(), 1);
}

#[test]
#[serial]
fn test_last_ocr_jobs_completed_concurrently_advance_once() {
    // Repeated to give the two commits a chance to interleave differently.
    for round in 0..8 {
        let harness = TestPipeline::new();
        let record_id = harness.ingest(&format!("Amtsbuch {}", round), "de", 2);

        let left = harness.second_handle();
        let right = harness.second_handle();
        let left_job = left.jobs().claim_next(JobKind::OcrPage).unwrap().unwrap();
        let right_job = right.jobs().claim_next(JobKind::OcrPage).unwrap().unwrap();
        assert_ne!(left_job.id, right_job.id);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [(left, left_job.id), (right, right_job.id)]
            .into_iter()
            .map(|(pipeline, job_id)| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pipeline.jobs().complete(job_id).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(harness.status(record_id), RecordStatus::PdfPending);
        assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Started), 1);
        assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Completed), 1);
        assert_eq!(
            count_events(&harness, record_id, Stage::PdfBuild, EventKind::Started),
            1
        );
        assert_eq!(harness.jobs_of(record_id, JobKind::BuildSearchablePdf).len(), 1);
        assert_eq!(harness.jobs_of(record_id, JobKind::TranslatePage).len(), 2);
        assert_eq!(harness.count_jobs(record_id, JobStatus::Completed), 2);
    }
}

#[test]
fn test_metadata_only_record_skips_vacuous_stages() {
    let harness = TestPipeline::new();
    let record_id = harness.ingest("Findbuch ohne Scans", "de", 0);

    // OCR and PDF build have no jobs, so they complete on the spot; the
    // record waits on its metadata translation.
    assert_eq!(harness.status(record_id), RecordStatus::Translating);
    assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Completed), 1);
    assert_eq!(
        count_events(&harness, record_id, Stage::PdfBuild, EventKind::Completed),
        1
    );
    assert!(harness.jobs_of(record_id, JobKind::OcrPage).is_empty());
    assert!(harness.jobs_of(record_id, JobKind::BuildSearchablePdf).is_empty());
    assert_eq!(harness.jobs_of(record_id, JobKind::TranslateRecord).len(), 1);

    harness.drain_all();
    assert_eq!(harness.status(record_id), RecordStatus::Complete);
    for stage in [
        Stage::Ocr,
        Stage::PdfBuild,
        Stage::Translation,
        Stage::Embedding,
        Stage::Entities,
    ] {
        assert_eq!(
            count_events(&harness, record_id, stage, EventKind::Completed),
            1,
            "{} completed",
            stage
        );
    }
}

#[test]
fn test_later_stage_jobs_do_not_satisfy_earlier_stage() {
    let harness = TestPipeline::new();
    let record_id = harness.ingest("Steuerbuch", "de", 2);

    // Translation jobs exist from pdf_pending on; finishing them first must
    // not let the record past the pending PDF build.
    let ocr = harness.drain(JobKind::OcrPage);
    assert_eq!(ocr.len(), 2);
    assert_eq!(harness.status(record_id), RecordStatus::PdfPending);

    harness.drain(JobKind::TranslatePage);
    harness.drain(JobKind::TranslateRecord);
    assert_eq!(harness.status(record_id), RecordStatus::PdfPending);

    harness.drain(JobKind::BuildSearchablePdf);
    // pdf_done -> translating -> embedding in one go, since translation is
    // already satisfied.
    assert_eq!(harness.status(record_id), RecordStatus::Embedding);
    assert_eq!(harness.jobs_of(record_id, JobKind::EmbedRecord).len(), 1);
}

#[test]
fn test_status_never_regresses_during_a_run() {
    let harness = TestPipeline::new();
    let mut changes = harness.subscribe_changes();
    let records: Vec<_> = [("a", "de", 2), ("b", "en", 1), ("c", "fr", 0), ("d", "de", 3)]
        .into_iter()
        .map(|(title, lang, pages)| harness.ingest(title, lang, pages))
        .collect();

    // Interleave kinds in reverse pipeline order to stress the derivation.
    loop {
        let mut progressed = false;
        for kind in JobKind::ALL.into_iter().rev() {
            if let Some(job) = harness.pipeline.jobs().claim_next(kind).unwrap() {
                harness.pipeline.jobs().complete(job.id).unwrap();
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    for record_id in &records {
        assert_eq!(harness.status(*record_id), RecordStatus::Complete);
    }
    for change in drain_changes(&mut changes) {
        if let Some(from) = change.from {
            assert!(
                change.to.rank() > from.rank(),
                "record {} regressed {} -> {}",
                change.record_id,
                from,
                change.to
            );
        }
    }
}

#[test]
fn test_error_is_absorbing() {
    let harness = TestPipeline::new();
    let record_id = harness.ingest("Brandakten", "de", 1);
    let job = harness
        .pipeline
        .jobs()
        .claim_next(JobKind::OcrPage)
        .unwrap()
        .unwrap();

    assert!(harness
        .pipeline
        .state_machine()
        .mark_error(record_id, None, "scanner quarantine")
        .unwrap());

    // A worker finishing afterwards records its job but leaves the record.
    harness.pipeline.jobs().complete(job.id).unwrap();
    assert_eq!(harness.status(record_id), RecordStatus::Error);
    assert!(harness
        .pipeline
        .state_machine()
        .advance(record_id)
        .unwrap()
        .is_empty());
    assert_eq!(count_events(&harness, record_id, Stage::Ocr, EventKind::Failed), 1);
}

#[test]
fn test_derive_status_matches_advance() {
    let harness = TestPipeline::new();
    let record_id = harness.ingest("Pfarrchronik", "de", 1);
    let state = harness.pipeline.state_machine();

    assert_eq!(state.derive_status(record_id).unwrap(), RecordStatus::OcrPending);
    harness.drain(JobKind::OcrPage);
    assert_eq!(state.derive_status(record_id).unwrap(), RecordStatus::PdfPending);
    assert_eq!(harness.status(record_id), RecordStatus::PdfPending);
}
