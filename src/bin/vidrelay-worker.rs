//! vidrelay worker process
//!
//! Launched by the host, never by hand:
//!
//! ```bash
//! vidrelay-worker <parent_pid> <pipe_name>
//! ```
//!
//! Stdout carries only the ready line. Logs go to stderr and to
//! `~/.vidrelay/logs/vidrelay-worker.log`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use vidrelay_core::init_worker_logging;
use vidrelay_worker::{
    CrashLogStore, WorkerServer, create_engine_from_env, flush_interval_from_env,
    install_panic_hook,
};

/// vidrelay encoding worker
#[derive(Parser, Debug)]
#[command(name = "vidrelay-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Process id of the host that launched this worker
    parent_pid: u32,

    /// Pipe name to listen on
    pipe_name: String,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.vidrelay/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let crash_logs = CrashLogStore::from_env();
    install_panic_hook(crash_logs.clone());

    let _guard = match init_worker_logging(cli.log_dir.clone(), cli.verbose > 0) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = crash_logs.append(std::process::id(), &format!("runtime: {e}"));
            return ExitCode::from(1);
        }
    };

    info!(parent_pid = cli.parent_pid, pipe_name = %cli.pipe_name, "worker starting");
    match runtime.block_on(run(&cli, crash_logs.clone())) {
        Ok(()) => {
            info!("worker exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("worker failed: {:#}", e);
            let _ = crash_logs.append(std::process::id(), &format!("{e:#}"));
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, crash_logs: CrashLogStore) -> anyhow::Result<()> {
    let engine = create_engine_from_env().context("selecting engine")?;
    WorkerServer::new(engine, crash_logs)
        .with_flush_interval(flush_interval_from_env())
        .run(&cli.pipe_name, cli.parent_pid, tokio::io::stdout())
        .await
        .context("serving host")?;
    Ok(())
}
