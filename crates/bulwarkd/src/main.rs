//! bulwarkd — the Bulwark daemon.
//!
//! Single binary that assembles every Bulwark component from one TOML file:
//! - Worker pool (+ job results drain)
//! - Circuit breakers and their monitors
//! - Rate limiter (+ idle window sweeper)
//! - Chaos fault injector
//! - Auto-scaler, fed with pool load
//! - Metrics collector
//!
//! # Usage
//!
//! ```text
//! bulwarkd check --config bulwark.toml
//! bulwarkd run --config bulwark.toml [--log-json]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use bulwark_autoscale::LoggingExecutor;
use bulwark_core::system_clock;
use bulwark_pool::{job_fn, Job};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use bulwarkd::{BulwarkConfig, Daemon};

const DEFAULT_FILTER: &str = "info,bulwark=debug";

#[derive(Parser)]
#[command(name = "bulwarkd", about = "Bulwark resilience daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config file and print it fully resolved, as JSON.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run every component until Ctrl-C.
    Run {
        #[arg(long)]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => {
            let config = BulwarkConfig::load(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run { config, log_json } => {
            init_tracing(log_json)?;
            run(config).await
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = BulwarkConfig::load(&path)?;
    info!(path = %path.display(), "bulwark daemon starting");

    let handler = job_fn(|_ctx, job: Job| async move {
        debug!(job_id = %job.id, kind = %job.kind, "handling job");
        Ok(job.payload)
    });
    let daemon = Daemon::build(config, system_clock(), handler, Arc::new(LoggingExecutor))
        .await
        .context("assemble components")?;

    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(err) => warn!(error = %err, "failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        })
    };

    let outcome = daemon.run(shutdown.clone()).await;
    shutdown.cancel();
    signal.abort();
    outcome
}
