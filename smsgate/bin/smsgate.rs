#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use smsgate::{Gateway, RunOutcome, Worker, find_config_file};
use smsgate_common::{SystemClock, internal, logging};

/// SMS gateway queue worker
#[derive(Parser, Debug)]
#[command(name = "smsgate", version, about, long_about = None)]
struct Cli {
    /// Configuration file (overrides SMSGATE_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Run a single queue cycle and exit (for cron)
    Once,
    /// Keep running cycles until SIGINT or SIGTERM
    Serve,
}

async fn run(cli: Cli) -> anyhow::Result<RunOutcome> {
    let path = find_config_file(cli.config.as_deref())?;
    let gateway = Gateway::load(&path)?;
    internal!(level = DEBUG, config = %path.display(), "Configuration loaded");

    let worker = Worker::assemble(gateway, Arc::new(SystemClock)).await?;
    match cli.mode {
        Mode::Once => worker.run_once().await,
        Mode::Serve => worker.serve().await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    match run(cli).await {
        Ok(RunOutcome::Stopped {
            abandoned: true, ..
        }) => {
            eprintln!("smsgate: an in-flight cycle was abandoned at shutdown");
            ExitCode::FAILURE
        }
        Ok(outcome) => {
            internal!(level = DEBUG, ?outcome, "Exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            internal!(level = ERROR, "{e:#}");
            eprintln!("smsgate: {e:#}");
            ExitCode::FAILURE
        }
    }
}
