use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::AuditorConfig;
use crate::pipeline::JobKind;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file. Defaults to `~/.archiver/data/archiver.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// The configured path, or the default one when a home directory
    /// can be found.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_claim_threshold")]
    pub stale_claim_threshold_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stuck_ingest_threshold")]
    pub stuck_ingest_threshold_secs: u64,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_audit_interval() -> u64 {
    1800
}

fn default_stale_claim_threshold() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_stuck_ingest_threshold() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_audit_interval(),
            stale_claim_threshold_secs: default_stale_claim_threshold(),
            max_retries: default_max_retries(),
            stuck_ingest_threshold_secs: default_stuck_ingest_threshold(),
            run_on_startup: true,
        }
    }
}

impl AuditConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn auditor_config(&self) -> AuditorConfig {
        AuditorConfig {
            stale_claim_threshold: Duration::from_secs(self.stale_claim_threshold_secs),
            max_retries: self.max_retries,
            stuck_ingest_threshold: Duration::from_secs(self.stuck_ingest_threshold_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Buffered messages per subscriber before it starts lagging.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    256
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// External programs run by `archiver-daemon run`, one pool each.
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// One external stage program and the job kinds it takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,
    pub kinds: Vec<JobKind>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_poll_interval() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval(),
            max_backoff_ms: default_max_backoff(),
            handlers: Vec::new(),
        }
    }
}

impl WorkersConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
