//! CLI parse: clap types for Stagehand. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stagehand CLI - resumable generation worker
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Resumable multi-stage generation worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off, except for `worker`)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the orchestrator and serve generation jobs until interrupted
    Worker {
        /// Orchestrator WebSocket URL (overrides session.url)
        #[arg(long)]
        url: Option<String>,
        /// Worker identifier (overrides session.worker_id)
        #[arg(long)]
        worker_id: Option<String>,
        /// Health endpoint listen address (overrides http.listen)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Watch checkpointed progress of one run or every active run
    Monitor {
        /// Run to watch; every resumable run when omitted
        run_id: Option<String>,
        /// Print one snapshot and exit
        #[arg(long)]
        once: bool,
        /// Poll interval in seconds (overrides monitor.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List persisted runs
    Runs {
        /// Only runs for this target
        #[arg(long)]
        target: Option<String>,
        /// Only runs that can still be resumed
        #[arg(long)]
        resumable: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration
    Config {
        /// Validate only; print the problems found
        #[arg(long)]
        validate: bool,
    },
}

impl Commands {
    /// Commands that log by default.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Commands::Worker { .. })
    }
}
