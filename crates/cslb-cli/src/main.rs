use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cslb_core::RunStatus;
use cslb_sync::{CollectOptions, CollectorConfig, SnapshotChoice};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cslb-cli")]
#[command(about = "Collects California contractor licenses into the business database")]
struct Cli {
    /// YAML file layered over the environment. Falls back to `CSLB_CONFIG`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, resolve, stage and merge one master file.
    Collect {
        /// Process a saved snapshot instead of calling the service.
        #[arg(long, conflicts_with = "latest_snapshot")]
        snapshot: Option<PathBuf>,

        /// Process the most recent saved snapshot.
        #[arg(long)]
        latest_snapshot: bool,

        /// Stage and merge in memory; the database is left alone.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the staging and permanent tables.
    Migrate,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Collect {
            snapshot: None,
            latest_snapshot: false,
            dry_run: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let config = CollectorConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or_default() {
        Commands::Collect {
            snapshot,
            latest_snapshot,
            dry_run,
        } => {
            let snapshot = match (snapshot, latest_snapshot) {
                (Some(path), _) => SnapshotChoice::Path(path),
                (None, true) => SnapshotChoice::Latest,
                (None, false) => SnapshotChoice::Remote,
            };

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current batch");
                    on_interrupt.cancel();
                }
            });

            let options = CollectOptions { snapshot, dry_run };
            match cslb_sync::run_collect(config, options, cancel).await {
                Ok(summary) => {
                    println!(
                        "collect {}: run_id={} rows={} valid={} skipped={} staged={} failed={} merged={}",
                        summary.status.as_str(),
                        summary.run_id,
                        summary.rows_seen,
                        summary.valid_records,
                        summary.skipped.total(),
                        summary.staged,
                        summary.failed_records,
                        summary.merged
                    );
                    Ok(match summary.status {
                        RunStatus::Completed => ExitCode::SUCCESS,
                        RunStatus::PartiallyCompleted => ExitCode::from(2),
                        RunStatus::Cancelled => ExitCode::from(130),
                    })
                }
                Err(err) => {
                    eprintln!("collect failed: {:#}", anyhow::Error::from(err));
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Migrate => {
            cslb_sync::run_migrations(&config).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}
