//! hpcrun Command-Line Interface
//!
//! Submit and track batch jobs on whatever scheduler the host runs.
//!
//! ```text
//! hpcrun run --cpu 8 --mem 16G -- python train.py
//! hpcrun run --array 1-100:10%5 --wait -- ./task.sh
//! hpcrun status 12345
//! hpcrun cancel 12345
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::common::Context;
use commands::{cancel, detect, run, status, wait};

/// hpcrun - uniform job submission for SLURM, Grid Engine, PBS and local runs
#[derive(Parser)]
#[command(name = "hpcrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML configuration file
    #[arg(short, long, global = true, env = "HPCRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Scheduler to use (slurm, sge, pbs, local, auto)
    #[arg(short, long, global = true)]
    scheduler: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a command as a batch job
    Run(run::RunArgs),

    /// Show the status of a job, or list jobs
    Status {
        /// Job ID
        job_id: Option<String>,

        /// List queued and running jobs
        #[arg(short, long)]
        all: bool,

        /// Include finished jobs from accounting
        #[arg(long)]
        history: bool,

        /// Only jobs of this user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Cancel one or more jobs
    Cancel {
        /// Job IDs
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// Wait for a job to finish
    Wait {
        /// Job ID
        job_id: String,

        /// Timeout in seconds
        #[arg(short, long, default_value = "86400")]
        timeout: u64,

        /// Polling interval in seconds
        #[arg(long)]
        poll: Option<u64>,
    },

    /// Show which scheduler would be used
    Detect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let result = match Context::load(cli.config.as_deref(), cli.scheduler.as_deref()) {
        Ok(ctx) => match cli.command {
            Commands::Run(args) => run::execute(&ctx, args).await,
            Commands::Status {
                job_id,
                all,
                history,
                user,
            } => status::execute(&ctx, job_id.as_deref(), all, history, user.as_deref()).await,
            Commands::Cancel { job_ids } => cancel::execute(&ctx, &job_ids).await,
            Commands::Wait {
                job_id,
                timeout,
                poll,
            } => wait::execute(&ctx, &job_id, timeout, poll).await,
            Commands::Detect => detect::execute(&ctx).await,
        },
        Err(e) => Err(e),
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
