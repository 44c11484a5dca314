//! Command Line and Logging
//!
//! Command-line interface and tracing setup for the replink daemon. Logs go to
//! stderr so REPL output on stdout stays clean.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// replink daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "replink-daemon")]
#[command(about = "Line channel to a REPL app on an Android device", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub timestamps: bool,

    /// Reinstall and restart the app before the first send
    #[arg(long)]
    pub force_restart: bool,

    /// Subcommand (interactive session when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// One-shot commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List devices known to adb
    Devices,

    /// Print the effective configuration
    DumpConfig,

    /// Send one message and print replies
    Send {
        /// Message to send (a newline is appended)
        message: String,

        /// Seconds to keep printing replies after the send
        #[arg(short, long, default_value = "2")]
        settle: u64,
    },
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}
