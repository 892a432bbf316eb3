//! Stage handler that delegates each job to an external program.

use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;

use crate::config::HandlerConfig;
use crate::db::job_repo::Job;
use crate::pipeline::JobKind;
use crate::worker::handler::StageHandler;

/// Runs `program args...` once per job.
///
/// The job is written to stdin as JSON. A zero exit status completes the
/// job; non-empty stdout must then be a JSON document and is kept as the
/// run's metrics. Any other exit fails the job with the trimmed stderr.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    name: String,
    kinds: Vec<JobKind>,
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(
        name: impl Into<String>,
        kinds: Vec<JobKind>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kinds,
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &HandlerConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.kinds.clone(),
            config.program.clone(),
            config.args.clone(),
        )
    }
}

impl StageHandler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> &[JobKind] {
        &self.kinds
    }

    fn handle(&self, job: &Job) -> Result<Option<Value>, String> {
        let input = serde_json::to_vec(job).map_err(|e| format!("Failed to encode job: {}", e))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("ARCHIVER_JOB_ID", job.id.to_string())
            .env("ARCHIVER_JOB_KIND", job.kind.as_str())
            .env("ARCHIVER_RECORD_ID", job.record_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to run {}: {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&input) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(format!("Failed to write job to {}: {}", self.program, e));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| format!("Failed to wait for {}: {}", self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                format!("{} exited with {}: {}", self.program, output.status, stderr)
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(stdout)
            .map(Some)
            .map_err(|e| format!("{} printed invalid JSON: {}", self.program, e))
    }
}
