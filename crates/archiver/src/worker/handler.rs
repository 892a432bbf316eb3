use serde_json::Value;

use crate::db::job_repo::Job;
use crate::pipeline::JobKind;

/// The stage-specific work a worker performs inside its claim window.
///
/// Handlers must tolerate seeing the same job twice: a slow handler can
/// have its claim reset by the auditor and the job handed to another
/// worker.
pub trait StageHandler: Send + Sync {
    /// Short name used in worker ids and logs.
    fn name(&self) -> &str;

    /// Job kinds this handler processes, polled in this order.
    fn kinds(&self) -> &[JobKind];

    /// Runs the job. `Ok` carries optional result metrics stored on the
    /// processing run; `Err` carries the failure message stored on the job.
    fn handle(&self, job: &Job) -> Result<Option<Value>, String>;
}
