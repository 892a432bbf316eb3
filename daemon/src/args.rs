use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Archiver daemon - audit scheduler and admin tools for the archive pipeline
#[derive(Parser, Debug)]
#[command(name = "archiver-daemon")]
#[command(version)]
#[command(about = "Runs the archive pipeline auditor and stage workers", long_about = None)]
pub struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the audit scheduler and configured workers until Ctrl-C (default)
    Run,
    /// Run one audit and print the report
    Audit,
    /// Print pipeline statistics
    Stats,
    /// Print a record's events and job summary
    Timeline {
        /// Record id
        record_id: i64,
    },
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
