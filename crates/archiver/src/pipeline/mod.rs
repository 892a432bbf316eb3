pub mod error;
pub mod event_log;
pub mod job_store;
pub mod model;
pub mod record_store;
pub mod state_machine;

use std::sync::Arc;

pub use error::PipelineError;
pub use event_log::{EventLog, Timeline};
pub use job_store::JobStore;
pub use model::{EventKind, JobKind, JobStatus, RecordStatus, RunStatus, Stage};
pub use record_store::RecordStore;
pub use state_machine::StateMachine;

use crate::broadcast::{JobEventNotifier, RecordChangeNotifier};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::db::Database;

/// The pipeline core wired onto one database handle.
///
/// Every component shares the same clock and notifiers.
#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    state: StateMachine,
    jobs: JobStore,
    records: RecordStore,
    events: EventLog,
}

impl Pipeline {
    /// Wires the core with the system clock and fresh notifiers.
    pub fn new(db: Database, notifier_capacity: usize) -> Self {
        Self::with_clock(db, Arc::new(SystemClock), notifier_capacity)
    }

    pub fn with_clock(db: Database, clock: SharedClock, notifier_capacity: usize) -> Self {
        Self::with_notifiers(
            db,
            clock,
            RecordChangeNotifier::new(notifier_capacity),
            JobEventNotifier::new(notifier_capacity),
        )
    }

    pub fn with_notifiers(
        db: Database,
        clock: SharedClock,
        record_changes: RecordChangeNotifier,
        job_events: JobEventNotifier,
    ) -> Self {
        let state = StateMachine::new(db.clone(), Arc::clone(&clock), record_changes, job_events);
        Self {
            jobs: JobStore::new(db.clone(), state.clone()),
            records: RecordStore::new(db.clone(), state.clone()),
            events: EventLog::new(db.clone(), clock),
            state,
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn clock(&self) -> &dyn Clock {
        self.state.clock().as_ref()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn record_changes(&self) -> &RecordChangeNotifier {
        self.state.record_changes()
    }

    pub fn job_events(&self) -> &JobEventNotifier {
        self.state.job_events()
    }
}
