//! Backup Runner - Main entry point
//!
//! Invoked by an external scheduler. Exit code 0 means every step succeeded.

use anyhow::Result;
use backup_runner::daemon::shutdown::ShutdownCoordinator;
use backup_runner::daemon::trigger::{IntervalTrigger, OnceTrigger, Trigger};
use backup_runner::{run_backup, utils, BackupError, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Exit code when a backup step failed
const EXIT_STEP_FAILED: u8 = 1;
/// Exit code when the run never started (bad config, lock held)
const EXIT_NOT_STARTED: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup now (default)
    Run,

    /// Run repeatedly from this process until SIGINT/SIGTERM
    Schedule {
        /// Seconds between run starts
        #[arg(long, value_name = "SECS")]
        every_secs: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("backup-runner: {e}");
            return Ok(ExitCode::from(EXIT_NOT_STARTED));
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting backup-runner v{} (root: {}, retention: {} days)",
        env!("CARGO_PKG_VERSION"),
        config.backup_root_path.display(),
        config.retention_days
    );

    let code = match args.command.unwrap_or(Command::Run) {
        Command::Run => drive(&config, OnceTrigger::new()).await,
        Command::Schedule { every_secs } => {
            if every_secs == 0 {
                tracing::error!("--every-secs must be positive");
                return Ok(ExitCode::from(EXIT_NOT_STARTED));
            }
            let coordinator = ShutdownCoordinator::new();
            let trigger =
                IntervalTrigger::new(Duration::from_secs(every_secs), coordinator.token());
            let signals = coordinator.clone();
            tokio::spawn(async move { signals.wait_for_signal().await });
            drive(&config, trigger).await
        }
    };

    Ok(ExitCode::from(code))
}

/// Run once per trigger firing; the exit code reflects the last run.
async fn drive<T: Trigger>(config: &Config, mut trigger: T) -> u8 {
    let mut code = 0;
    while trigger.fire().await {
        code = match run_backup(config).await {
            Ok(report) if report.is_success() => 0,
            Ok(_) => EXIT_STEP_FAILED,
            Err(e @ BackupError::Locked(_)) => {
                tracing::error!("[SKIP] {}", e);
                EXIT_NOT_STARTED
            }
            Err(e) => {
                tracing::error!("[ABORT] backup run could not start: {}", e);
                EXIT_NOT_STARTED
            }
        };
    }
    code
}
