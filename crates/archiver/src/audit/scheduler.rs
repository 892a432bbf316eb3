//! Periodic audit scheduler.
//!
//! Runs the auditor on a fixed interval in a background thread and also
//! on demand via a broadcast trigger channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use super::auditor::{AuditReport, Auditor};

/// Periodic audit scheduler.
pub struct AuditScheduler {
    auditor: Arc<Auditor>,
    interval: Duration,
    run_on_startup: bool,
    shutdown: Arc<AtomicBool>,
    reports: broadcast::Sender<AuditReport>,
}

impl AuditScheduler {
    pub fn new(auditor: Arc<Auditor>, interval: Duration, run_on_startup: bool) -> Self {
        let (reports, _) = broadcast::channel(16);
        Self {
            auditor,
            interval,
            run_on_startup,
            shutdown: Arc::new(AtomicBool::new(false)),
            reports,
        }
    }

    /// Reports of every audit this scheduler runs.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<AuditReport> {
        self.reports.subscribe()
    }

    /// Start the audit loop in a background thread.
    /// Accepts a trigger receiver for on-demand audits.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let auditor = Arc::clone(&self.auditor);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let run_on_startup = self.run_on_startup;
        let reports = self.reports.clone();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to start audit scheduler runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                if run_on_startup && !shutdown.load(Ordering::Acquire) {
                    log::info!("Running startup audit");
                    run_once(&auditor, &reports);
                }

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual audit triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    run_once(&auditor, &reports);
                }
            });
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn run_once(auditor: &Auditor, reports: &broadcast::Sender<AuditReport>) {
    match auditor.audit() {
        Ok(report) => {
            let _ = reports.send(report);
        }
        Err(e) => log::error!("Audit failed: {}", e),
    }
}
