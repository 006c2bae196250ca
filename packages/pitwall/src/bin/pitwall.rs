//! Pitwall CLI
//!
//! Trigger surface for the collector: one-off runs, the long-running
//! scheduler, and run history.
//!
//! Exit codes: 0 when every run succeeded or was partial, 1 when a manual run
//! failed, 2 on configuration errors.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pitwall::{
    ConfigError, EntityFamily, HttpFetcher, Orchestrator, PitwallConfig, Repository, RunRecord,
    Scheduler, SqliteRepository, Trigger,
};

#[derive(Parser)]
#[command(name = "pitwall")]
#[command(about = "Collect motorsport competitors, teams, events and results")]
#[command(version)]
struct Cli {
    /// Debug logging for pitwall (ignored when RUST_LOG is set)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every family once, in dependency order, ignoring cadence
    RunAll {
        #[arg(long)]
        season: Option<i32>,
    },

    /// Run one family once (teams, competitors, events, results)
    RunFamily {
        family: EntityFamily,
        #[arg(long)]
        season: Option<i32>,
    },

    /// Start the scheduler and block until Ctrl-C
    Serve,

    /// List recent runs
    History {
        #[arg(long)]
        family: Option<EntityFamily>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl Commands {
    /// Only the long-running scheduler owns unfinished run rows. Any other
    /// command may be sharing the database with a live `serve`.
    fn finalizes_interrupted_runs(&self) -> bool {
        matches!(self, Commands::Serve)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "pitwall failed");
            eprintln!("error: {:#}", e);
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,pitwall=debug,sqlx=warn"
    } else {
        "info,sqlx=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = PitwallConfig::from_env()?;
    if let Commands::RunAll { season: Some(season) } | Commands::RunFamily { season: Some(season), .. } =
        &cli.command
    {
        config.season = Some(*season);
    }
    config.prepare_storage()?;

    let repo = Arc::new(
        SqliteRepository::new(&config.database_path)
            .await
            .map_err(ConfigError::from)?,
    );

    if let Commands::History { family, limit } = cli.command {
        let runs = repo
            .run_history(family, limit)
            .await
            .context("Failed to load run history")?;
        print_history(&runs);
        return Ok(ExitCode::SUCCESS);
    }

    if cli.command.finalizes_interrupted_runs() {
        let interrupted = repo
            .finalize_interrupted_runs()
            .await
            .context("Failed to finalize interrupted runs")?;
        if interrupted > 0 {
            tracing::warn!(runs = interrupted, "Finalized runs left over by a previous process");
        }
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let orchestrator = Arc::new(Orchestrator::new(config, fetcher, repo));

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    match cli.command {
        Commands::RunAll { .. } => {
            let records = orchestrator.run_all(Trigger::Manual, &cancel).await;
            Ok(exit_code(&records))
        }
        Commands::RunFamily { family, .. } => {
            let record = orchestrator.run_family(family, Trigger::Manual, &cancel).await;
            Ok(exit_code(&[record]))
        }
        Commands::Serve => {
            tracing::info!(season = orchestrator.config().season(), "Starting scheduler");
            Scheduler::new(orchestrator).serve(cancel).await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received; shutting down");
                cancel.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Could not listen for Ctrl-C"),
        }
    });
}

fn exit_code(records: &[RunRecord]) -> ExitCode {
    if records.iter().any(|r| r.outcome.is_failed()) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_history(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }

    println!(
        "{:<25} {:<12} {:<8} {:<20} {:>7} {:>9} {:>10} {:>9} {:>7} {:>9}",
        "STARTED", "FAMILY", "TRIGGER", "OUTCOME", "FETCHED", "EXTRACTED", "NORMALIZED", "PERSISTED", "ERRORS", "DURATION"
    );
    for run in runs {
        let duration = run
            .duration()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<25} {:<12} {:<8} {:<20} {:>7} {:>9} {:>10} {:>9} {:>7} {:>9}",
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            run.family.as_str(),
            run.trigger.as_str(),
            run.outcome.to_string(),
            run.counts.fetched,
            run.counts.extracted,
            run.counts.normalized,
            run.counts.persisted,
            run.counts.errored,
            duration,
        );
    }
}
