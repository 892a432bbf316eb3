use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

use crate::broadcast::JobEvent;
use crate::db::job_repo::Job;
use crate::error::WorkerError;
use crate::pipeline::{JobKind, JobStore, PipelineError, RunStatus};
use crate::worker::handler::StageHandler;

/// Polling behaviour of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Wait after the first empty poll.
    pub poll_interval: Duration,
    /// Ceiling for the doubling idle wait.
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub worker_id: String,
    pub job_id: i64,
    pub record_id: i64,
    pub kind: JobKind,
    pub status: RunStatus,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Threads that claim and execute jobs for one [`StageHandler`].
pub struct WorkerPool {
    outcome_receiver: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads, each with its own worker id.
    pub fn start(
        store: JobStore,
        handler: Arc<dyn StageHandler>,
        config: WorkerConfig,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        if handler.kinds().is_empty() {
            return Err(WorkerError::NoKinds(handler.name().to_string()));
        }

        let (outcome_sender, outcome_receiver) = bounded::<JobOutcome>(worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_ids = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let worker_id = format!("{}-{}", handler.name(), Uuid::new_v4());
            let worker = Worker {
                id: worker_id.clone(),
                store: store.clone(),
                handler: Arc::clone(&handler),
                config,
                outcomes: outcome_sender.clone(),
                shutdown: Arc::clone(&shutdown),
            };

            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker.run())
                .map_err(|e| {
                    shutdown.store(true, Ordering::Relaxed);
                    WorkerError::SpawnFailed(e.to_string())
                })?;

            workers.push(handle);
            worker_ids.push(worker_id);
        }

        info!(
            "Started {} '{}' workers for {:?}",
            worker_count,
            handler.name(),
            handler.kinds()
        );

        Ok(Self {
            outcome_receiver,
            workers,
            worker_ids,
            shutdown,
        })
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    pub fn try_recv_outcome(&self) -> Option<JobOutcome> {
        self.outcome_receiver.try_recv().ok()
    }

    pub fn recv_outcome_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        self.outcome_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins every worker. Call [`shutdown`](Self::shutdown) first.
    pub fn wait(self) {
        for (id, worker) in self.worker_ids.iter().zip(self.workers) {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", id, e);
            } else {
                debug!("Worker {} finished", id);
            }
        }

        info!("All workers have stopped");
    }
}

struct Worker {
    id: String,
    store: JobStore,
    handler: Arc<dyn StageHandler>,
    config: WorkerConfig,
    outcomes: Sender<JobOutcome>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);
        let mut events = self.store.state_machine().job_events().subscribe();
        let mut backoff = self.config.poll_interval;

        while !self.is_shutdown() {
            if self.drain() > 0 {
                backoff = self.config.poll_interval;
                continue;
            }
            self.idle(&mut events, backoff);
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        debug!("Worker {} stopped", self.id);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Claims and executes jobs of every handled kind until none is left.
    fn drain(&self) -> usize {
        let mut processed = 0;
        for &kind in self.handler.kinds() {
            while !self.is_shutdown() {
                match self.store.claim_next(kind) {
                    Ok(Some(job)) => {
                        self.execute(job);
                        processed += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Worker {} failed to claim {}: {}", self.id, kind, e);
                        break;
                    }
                }
            }
        }
        processed
    }

    /// Sleeps up to `wait`, returning early on shutdown or when a job of
    /// one of our kinds is enqueued.
    fn idle(&self, events: &mut broadcast::Receiver<JobEvent>, wait: Duration) {
        const SLICE: Duration = Duration::from_millis(25);
        let deadline = Instant::now() + wait;

        while !self.is_shutdown() {
            loop {
                match events.try_recv() {
                    Ok(event) if self.handler.kinds().contains(&event.kind()) => return,
                    Ok(_) => continue,
                    // Missed events may include ours.
                    Err(TryRecvError::Lagged(_)) => return,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }

    fn execute(&self, job: Job) {
        let span = tracing::info_span!(
            "job",
            id = job.id,
            kind = %job.kind,
            record = job.record_id,
            worker = %self.id
        );
        let _enter = span.enter();

        let run = match self.store.open_run(job.id, &self.id) {
            Ok(run) => Some(run),
            Err(e) => {
                warn!("Worker {} could not open run for job {}: {}", self.id, job.id, e);
                None
            }
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&job)))
            .unwrap_or_else(|_| Err(format!("handler '{}' panicked", self.handler.name())));
        let duration = started.elapsed();

        let (status, error, result_value) = match result {
            Ok(value) => match self.store.complete(job.id) {
                Ok(_) => (RunStatus::Completed, None, value),
                Err(e) => (RunStatus::Failed, Some(self.report_lost(&job, e)), value),
            },
            Err(message) => match self.store.fail(job.id, &message) {
                Ok(_) => (RunStatus::Failed, Some(message), None),
                Err(e) => {
                    self.report_lost(&job, e);
                    (RunStatus::Failed, Some(message), None)
                }
            },
        };

        if let Some(run) = run {
            let metrics = json!({
                "durationMs": duration.as_millis() as u64,
                "attempt": job.attempts,
                "result": result_value,
            });
            if let Err(e) =
                self.store
                    .finish_run(run.id, status, error.as_deref(), Some(&metrics))
            {
                warn!("Worker {} could not close run {}: {}", self.id, run.id, e);
            }
        }

        let outcome = JobOutcome {
            worker_id: self.id.clone(),
            job_id: job.id,
            record_id: job.record_id,
            kind: job.kind,
            status,
            error,
            duration,
        };
        match self.outcomes.try_send(outcome) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("Worker {} outcome channel closed", self.id)
            }
        }
    }

    /// Logs a complete/fail that could not be written, typically because
    /// the claim was reset while the handler ran.
    fn report_lost(&self, job: &Job, e: PipelineError) -> String {
        warn!(
            "Worker {} lost job {} ({}) before finishing: {}",
            self.id, job.id, job.kind, e
        );
        e.to_string()
    }
}
