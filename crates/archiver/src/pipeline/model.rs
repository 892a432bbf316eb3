//! Closed vocabularies of the pipeline: job kinds, job statuses, stages,
//! record statuses and event kinds.
//!
//! Every enum persists as its snake_case name.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Error returned when parsing an unknown name into one of the enums here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: '{value}'")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

/// Wires an enum with `as_str` / `FromStr` into rusqlite.
macro_rules! sql_text_enum {
    ($ty:ty, $column:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|_| {
                    FromSqlError::Other(Box::new(DatabaseError::InvalidColumn {
                        column: $column,
                        value: s.to_string(),
                    }))
                })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ─── JobKind ────────────────────────────────────────────────────────────────

/// Kind of work a job represents. Workers poll per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    OcrPage,
    GenerateThumbs,
    BuildSearchablePdf,
    TranslatePage,
    TranslateRecord,
    EmbedRecord,
    ExtractEntities,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::OcrPage,
        JobKind::GenerateThumbs,
        JobKind::BuildSearchablePdf,
        JobKind::TranslatePage,
        JobKind::TranslateRecord,
        JobKind::EmbedRecord,
        JobKind::ExtractEntities,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OcrPage => "ocr_page",
            JobKind::GenerateThumbs => "generate_thumbs",
            JobKind::BuildSearchablePdf => "build_searchable_pdf",
            JobKind::TranslatePage => "translate_page",
            JobKind::TranslateRecord => "translate_record",
            JobKind::EmbedRecord => "embed_record",
            JobKind::ExtractEntities => "extract_entities",
        }
    }

    /// The pipeline stage whose completion this kind contributes to.
    pub fn stage(&self) -> Stage {
        match self {
            JobKind::OcrPage | JobKind::GenerateThumbs => Stage::Ocr,
            JobKind::BuildSearchablePdf => Stage::PdfBuild,
            JobKind::TranslatePage | JobKind::TranslateRecord => Stage::Translation,
            JobKind::EmbedRecord => Stage::Embedding,
            JobKind::ExtractEntities => Stage::Entities,
        }
    }
}

impl FromStr for JobKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "job kind",
                value: s.to_string(),
            })
    }
}

sql_text_enum!(JobKind, "kind");

// ─── JobStatus ──────────────────────────────────────────────────────────────

/// Lifecycle of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant {
                what: "job status",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(JobStatus, "status");

// ─── Stage ──────────────────────────────────────────────────────────────────

/// A phase of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Ocr,
    PdfBuild,
    Translation,
    Embedding,
    Entities,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Ingest,
        Stage::Ocr,
        Stage::PdfBuild,
        Stage::Translation,
        Stage::Embedding,
        Stage::Entities,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Ocr => "ocr",
            Stage::PdfBuild => "pdf_build",
            Stage::Translation => "translation",
            Stage::Embedding => "embedding",
            Stage::Entities => "entities",
        }
    }

    /// Job kinds that belong to this stage. Ingest has none; it is driven
    /// by the ingestion collaborator.
    pub fn kinds(&self) -> &'static [JobKind] {
        match self {
            Stage::Ingest => &[],
            Stage::Ocr => &[JobKind::OcrPage, JobKind::GenerateThumbs],
            Stage::PdfBuild => &[JobKind::BuildSearchablePdf],
            Stage::Translation => &[JobKind::TranslatePage, JobKind::TranslateRecord],
            Stage::Embedding => &[JobKind::EmbedRecord],
            Stage::Entities => &[JobKind::ExtractEntities],
        }
    }
}

impl FromStr for Stage {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "stage",
                value: s.to_string(),
            })
    }
}

sql_text_enum!(Stage, "stage");

// ─── RecordStatus ───────────────────────────────────────────────────────────

/// Where a record is in the pipeline.
///
/// Declaration order is pipeline order; `Error` sits outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ingesting,
    Ingested,
    OcrPending,
    OcrInProgress,
    OcrDone,
    PdfPending,
    PdfDone,
    Translating,
    Embedding,
    EntitiesPending,
    EntitiesDone,
    Complete,
    Error,
}

/// What a record status means for the stage cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPosition {
    /// Jobs of this stage are planned and may still be running.
    Active(Stage),
    /// This stage is satisfied; the next stage has not been planned yet.
    Done(Stage),
    /// Nothing left to do (`complete` or `error`).
    Terminal,
}

impl RecordStatus {
    const ORDERED: [RecordStatus; 12] = [
        RecordStatus::Ingesting,
        RecordStatus::Ingested,
        RecordStatus::OcrPending,
        RecordStatus::OcrInProgress,
        RecordStatus::OcrDone,
        RecordStatus::PdfPending,
        RecordStatus::PdfDone,
        RecordStatus::Translating,
        RecordStatus::Embedding,
        RecordStatus::EntitiesPending,
        RecordStatus::EntitiesDone,
        RecordStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ingesting => "ingesting",
            RecordStatus::Ingested => "ingested",
            RecordStatus::OcrPending => "ocr_pending",
            RecordStatus::OcrInProgress => "ocr_in_progress",
            RecordStatus::OcrDone => "ocr_done",
            RecordStatus::PdfPending => "pdf_pending",
            RecordStatus::PdfDone => "pdf_done",
            RecordStatus::Translating => "translating",
            RecordStatus::Embedding => "embedding",
            RecordStatus::EntitiesPending => "entities_pending",
            RecordStatus::EntitiesDone => "entities_done",
            RecordStatus::Complete => "complete",
            RecordStatus::Error => "error",
        }
    }

    /// Position in the pipeline order; `None` for `Error`.
    pub fn rank(&self) -> Option<usize> {
        Self::ORDERED.iter().position(|s| s == self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Complete | RecordStatus::Error)
    }

    pub fn position(&self) -> StatusPosition {
        match self {
            RecordStatus::Ingesting => StatusPosition::Active(Stage::Ingest),
            RecordStatus::Ingested => StatusPosition::Done(Stage::Ingest),
            RecordStatus::OcrPending | RecordStatus::OcrInProgress => {
                StatusPosition::Active(Stage::Ocr)
            }
            RecordStatus::OcrDone => StatusPosition::Done(Stage::Ocr),
            RecordStatus::PdfPending => StatusPosition::Active(Stage::PdfBuild),
            RecordStatus::PdfDone => StatusPosition::Done(Stage::PdfBuild),
            RecordStatus::Translating => StatusPosition::Active(Stage::Translation),
            RecordStatus::Embedding => StatusPosition::Active(Stage::Embedding),
            RecordStatus::EntitiesPending => StatusPosition::Active(Stage::Entities),
            RecordStatus::EntitiesDone => StatusPosition::Done(Stage::Entities),
            RecordStatus::Complete | RecordStatus::Error => StatusPosition::Terminal,
        }
    }

    /// The stage a failure at this status is attributed to.
    pub fn current_stage(&self) -> Option<Stage> {
        match self.position() {
            StatusPosition::Active(stage) => Some(stage),
            StatusPosition::Done(stage) => Some(stage),
            StatusPosition::Terminal => None,
        }
    }
}

impl FromStr for RecordStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "error" {
            return Ok(RecordStatus::Error);
        }
        RecordStatus::ORDERED
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "record status",
                value: s.to_string(),
            })
    }
}

sql_text_enum!(RecordStatus, "status");

// ─── EventKind ──────────────────────────────────────────────────────────────

/// What happened to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }
}

impl FromStr for EventKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(EventKind::Started),
            "completed" => Ok(EventKind::Completed),
            "failed" => Ok(EventKind::Failed),
            other => Err(UnknownVariant {
                what: "event kind",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(EventKind, "event");

// ─── RunStatus ──────────────────────────────────────────────────────────────

/// Outcome of one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Closed by the auditor after the claim went stale.
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Abandoned => "abandoned",
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "abandoned" => Ok(RunStatus::Abandoned),
            other => Err(UnknownVariant {
                what: "run status",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(RunStatus, "status");
