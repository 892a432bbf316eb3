//! Pipeline auditor and its scheduler.

pub mod auditor;
pub mod scheduler;

pub use auditor::{AuditReport, Auditor, AuditorConfig};
pub use scheduler::AuditScheduler;
