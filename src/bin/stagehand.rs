//! Stagehand CLI Binary
//!
//! Command-line entry point for the resumable generation worker.

use std::process;

use anyhow::{anyhow, Context};
use clap::Parser;
use stagehand::cli::{map_error, Cli, RunContext};
use stagehand::logging::{init_logging, LoggingConfig};
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!(error = %e, "Command failed");
        eprintln!("{:#}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .map_err(|e| anyhow!(map_error(&e)))
        .with_context(|| format!("Failed to load configuration for {}", cli.workspace.display()))?;

    let logging_config = build_logging_config(cli, &context.config().logging)?;
    init_logging(Some(&logging_config))
        .map_err(|e| anyhow!(map_error(&e)))
        .context("Failed to initialize logging")?;

    info!(workspace = %cli.workspace.display(), "Stagehand CLI starting");
    let output = context
        .execute(&cli.command)
        .map_err(|e| anyhow!(map_error(&e)))?;
    info!("Command completed successfully");
    println!("{}", output.trim_end());
    Ok(())
}

/// Build logging configuration from CLI args and the config file
fn build_logging_config(cli: &Cli, configured: &LoggingConfig) -> anyhow::Result<LoggingConfig> {
    // Short commands print their result to stdout; keep logs out of it unless asked.
    if !cli.verbose && !cli.command.is_long_running() {
        return Ok(LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        });
    }

    let mut config = configured.clone();
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.parse().map_err(|e| anyhow!(map_error(&e)))?;
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.parse().map_err(|e| anyhow!(map_error(&e)))?;
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    } else if config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }
    Ok(config)
}
