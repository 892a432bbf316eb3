pub mod audit;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use audit::{AuditReport, AuditScheduler, Auditor, AuditorConfig};
pub use broadcast::{JobEvent, JobEventNotifier, RecordChange, RecordChangeNotifier};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_config, Config, LogFormat};
pub use db::{Database, DatabaseError};
pub use error::{ArchiverError, ConfigError, Result, WorkerError};
pub use pipeline::{
    EventLog, JobKind, JobStatus, JobStore, Pipeline, PipelineError, RecordStatus, RecordStore,
    Stage, StateMachine,
};
pub use worker::{CommandHandler, JobOutcome, StageHandler, WorkerConfig, WorkerPool};
