mod args;
mod logging;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use archiver::config::{self, Config};
use archiver::{AuditScheduler, Auditor, CommandHandler, Database, Pipeline, WorkerPool};
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::args::{Cli, Command};

const RECENT_EVENTS: u32 = 20;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&config, cli.subcommand()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config, command: Command) -> archiver::Result<()> {
    let path = config
        .database_path()
        .ok_or_else(|| archiver::ConfigError::Validation {
            message: "no database_path configured and no home directory found".to_string(),
        })?;
    let db = Database::open(&path)?;
    let pipeline = Pipeline::new(db, config.notifier.capacity);
    let auditor = Auditor::new(
        pipeline.jobs().clone(),
        pipeline.state_machine().clone(),
        config.audit.auditor_config(),
        Arc::clone(pipeline.state_machine().clock()),
    );

    match command {
        Command::Run => {
            info!(
                "Starting archiver daemon v{} on {:?}",
                env!("CARGO_PKG_VERSION"),
                path
            );
            run_daemon(config, &pipeline, auditor)?;
        }
        Command::Audit => print_json(&auditor.audit()?),
        Command::Stats => print_json(&auditor.stats(RECENT_EVENTS)?),
        Command::Timeline { record_id } => print_json(&pipeline.events().timeline(record_id)?),
    }
    Ok(())
}

fn run_daemon(config: &Config, pipeline: &Pipeline, auditor: Auditor) -> archiver::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            warn!("Could not install Ctrl-C handler: {}", e);
        }
    }

    // Log every status transition.
    let mut changes = pipeline.record_changes().subscribe();
    let spawned = thread::Builder::new()
        .name("record-changes".into())
        .spawn(move || loop {
            match changes.blocking_recv() {
                Ok(change) => info!(
                    "Record {}: {} -> {}",
                    change.record_id,
                    change
                        .from
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    change.to
                ),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} record changes", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        });
    if let Err(e) = spawned {
        warn!("Could not start change logger: {}", e);
    }

    let (trigger_tx, trigger_rx) = broadcast::channel(4);
    let scheduler = AuditScheduler::new(
        Arc::new(auditor),
        config.audit.interval(),
        config.audit.run_on_startup,
    );
    let handle = scheduler.start(trigger_rx);
    info!(
        "Audit scheduler running every {}s",
        config.audit.interval_secs
    );

    let mut pools = Vec::with_capacity(config.workers.handlers.len());
    for handler in &config.workers.handlers {
        let pool = WorkerPool::start(
            pipeline.jobs().clone(),
            Arc::new(CommandHandler::from_config(handler)),
            config.workers.worker_config(),
            config.workers.count,
        );
        match pool {
            Ok(pool) => pools.push(pool),
            Err(e) => {
                for pool in &pools {
                    pool.shutdown();
                }
                for pool in pools {
                    pool.wait();
                }
                scheduler.stop();
                let _ = trigger_tx.send(());
                let _ = handle.join();
                return Err(e.into());
            }
        }
    }
    if pools.is_empty() {
        info!("No worker handlers configured; running audit only");
    }

    while running.load(Ordering::SeqCst) {
        for pool in &pools {
            while let Some(outcome) = pool.try_recv_outcome() {
                match &outcome.error {
                    None => debug!(
                        "{} finished {} job {} for record {} in {:?}",
                        outcome.worker_id,
                        outcome.kind,
                        outcome.job_id,
                        outcome.record_id,
                        outcome.duration
                    ),
                    Some(error) => warn!(
                        "{} failed {} job {} for record {}: {}",
                        outcome.worker_id, outcome.kind, outcome.job_id, outcome.record_id, error
                    ),
                }
            }
        }
        thread::sleep(Duration::from_millis(200));
    }

    info!("Shutting down...");
    for pool in &pools {
        pool.shutdown();
    }
    for pool in pools {
        pool.wait();
    }
    scheduler.stop();
    // Wake the scheduler so it sees the stop flag.
    let _ = trigger_tx.send(());
    if handle.join().is_err() {
        error!("Audit scheduler thread panicked");
    }
    info!("Archiver daemon stopped");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}
