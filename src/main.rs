//! vidrelay - crash-isolated video transcoding
//!
//! Runs one scan or encode in a supervised worker process and prints its
//! progress.
//!
//! ## Usage
//!
//! ```bash
//! # Scan a source
//! vidrelay scan /movies/feature.mkv
//!
//! # Encode a job description (JSON encode request)
//! vidrelay encode job.json
//!
//! # Run the engine inside this process instead of a worker
//! vidrelay --local scan /movies/feature.mkv
//!
//! # With verbose logging and a custom config
//! vidrelay -v --config ./vidrelay.yaml encode job.json
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use vidrelay_core::{LogGuard, LogSeverity, RelayConfig, init_logging};
use vidrelay_worker::{Operation, OperationEvent, create_executor};

/// vidrelay transcoding host
///
/// Drives an encoding engine in an isolated worker process, recovering
/// from engine crashes and hangs.
#[derive(Parser, Debug)]
#[command(name = "vidrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.vidrelay/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Configuration file (defaults to ~/.vidrelay/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run the engine in this process (debugging only)
    #[arg(long, global = true)]
    local: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a source and print its titles as JSON
    Scan {
        /// Source file or disc folder
        path: String,
    },
    /// Encode the job described in a JSON file
    Encode {
        /// Encode request JSON
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("vidrelay error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> vidrelay_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load()?,
    };
    if cli.local {
        config.worker.process_isolation = false;
    }
    if cli.verbose > 0 {
        config.logging.verbose = true;
    }
    if let Some(dir) = &cli.log_dir {
        config.logging.log_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Run one operation to completion. Returns whether it succeeded.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = load_config(&cli)?;

    let operation = match &cli.command {
        Command::Scan { path } => Operation::Scan { path: path.clone() },
        Command::Encode { job } => {
            let payload = std::fs::read_to_string(job)
                .with_context(|| format!("reading {}", job.display()))?;
            Operation::EncodePayload(payload)
        }
    };

    let (executor, mut events) = create_executor(&config, None)?;
    info!(executor = executor.name(), operation = operation.name(), "starting");
    executor.start(operation).await?;

    let mut succeeded = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(outcome) = print_event(event) {
                    succeeded = outcome;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping");
                eprintln!();
                eprintln!("Stopping...");
                executor.stop_and_wait().await?;
            }
        }
    }
    Ok(succeeded)
}

/// Print one event. Returns the outcome for the completion event.
fn print_event(event: OperationEvent) -> Option<bool> {
    match event {
        OperationEvent::StateChanged(state) => info!(%state, "state changed"),
        OperationEvent::Started => eprintln!("Started"),
        OperationEvent::Progress(progress) => {
            let eta = progress
                .estimated_seconds_left
                .map(|secs| format!(" eta {:.0}s", secs))
                .unwrap_or_default();
            let rate = progress
                .current_rate
                .map(|fps| format!(" {:.1} fps", fps))
                .unwrap_or_default();
            eprint!("\r{:>3}%{}{}   ", progress.percent(), rate, eta);
            let _ = std::io::stderr().flush();
        }
        OperationEvent::Log(entry) => match entry.severity {
            LogSeverity::Message => {
                for line in entry.text.lines() {
                    eprintln!("[{}] {}", entry.source, line);
                }
            }
            LogSeverity::Error => eprintln!("[{}] ERROR {}", entry.source, entry.text),
        },
        OperationEvent::ScanCompleted { scan_json } => println!("{}", scan_json),
        OperationEvent::Failed(error) => {
            eprintln!();
            eprintln!("Error: {}", error);
            if let Some(guidance) = error.guidance() {
                eprintln!("Hint: {}", guidance);
            }
        }
        OperationEvent::Completed(result) => {
            eprintln!();
            match &result.detail {
                Some(detail) => eprintln!("Finished: {} ({})", result.code, detail),
                None => eprintln!("Finished: {}", result.code),
            }
            return Some(result.is_success());
        }
    }
    None
}
