//! Broadcasting modules for real-time event streaming.
//!
//! Both channels are side effects only; nothing in the pipeline reads them
//! to make a correctness decision.

pub mod job_events;
pub mod record_changes;

pub use job_events::{JobEvent, JobEventNotifier};
pub use record_changes::{RecordChange, RecordChangeNotifier};
