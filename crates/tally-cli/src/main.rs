mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tally_adapters::SOURCE_IDS;
use tally_storage::TimeDb;
use tally_sync::{
    maybe_build_scheduler, run_sync, SourceOutcome, SyncConfig, SyncError, SyncOptions,
    SyncPipeline, SyncRunSummary,
};
use tally_web::{load_teams, AppState, TeamConfig};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "tally-cli")]
#[command(about = "Pull issues and time entries into one effort ledger and report on it")]
struct Cli {
    /// More log output (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write JSON logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the last N days from every enabled source into the store.
    Fetch(FetchArgs),
    /// Create or upgrade the store schema.
    Migrate,
    /// Save one source's raw response for the last N days.
    Raw(RawArgs),
    /// Run the reporting server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Fetch on a cron schedule until interrupted.
    Schedule {
        /// Overrides TALLY_SYNC_CRON.
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Days of history ending tonight; defaults to TALLY_HISTORY_DAYS.
    #[arg(long, allow_negative_numbers = true)]
    days: Option<i64>,
    #[arg(long)]
    no_jira: bool,
    #[arg(long)]
    no_tmetric: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RawArgs {
    #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(SOURCE_IDS))]
    source: String,
    #[arg(long, allow_negative_numbers = true)]
    days: Option<i64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::FAILURE;
    }

    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Fetch(FetchArgs {
        days: None,
        no_jira: false,
        no_tmetric: false,
        json: false,
    }));

    let result = match command {
        Commands::Fetch(args) => fetch(config, args).await,
        Commands::Migrate => migrate(config).await.map(|()| ExitCode::SUCCESS),
        Commands::Raw(args) => raw(config, args).await.map(|()| ExitCode::SUCCESS),
        Commands::Serve { port } => serve(config, port).await.map(|()| ExitCode::SUCCESS),
        Commands::Schedule { cron, days } => schedule(config, cron, days)
            .await
            .map(|()| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn fetch(config: SyncConfig, args: FetchArgs) -> Result<ExitCode> {
    let days = args.days.unwrap_or(config.history_days);
    if days <= 0 {
        println!("nothing to fetch: --days must be positive (got {days})");
        return Ok(ExitCode::SUCCESS);
    }
    let options = SyncOptions {
        history_days: days,
        jira: !args.no_jira,
        tmetric: !args.no_tmetric,
    };

    match run_sync(config, &options).await {
        Ok(summary) => {
            print_summary(&summary, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(SyncError::Source {
            source_id,
            summary,
            error,
        }) => {
            print_summary(&summary, args.json)?;
            error!(source_id = %source_id, error = %error, "fetch failed");
            eprintln!("error: {source_id}: {error}");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("run {}", summary.run_id);
    if let Some(window) = &summary.window {
        println!("window {} .. {}", window.start, window.end);
    }
    for run in &summary.sources {
        let line = match &run.outcome {
            SourceOutcome::Completed { stats } => format!(
                "{} records in {} batches: {} inserted, {} updated, {} new users, {} anonymous tickets",
                stats.records,
                stats.batches,
                stats.inserted,
                stats.updated,
                stats.users_created,
                stats.anonymous_tickets_created
            ),
            SourceOutcome::Failed { error } => format!("failed: {error}"),
            SourceOutcome::Disabled => "disabled".to_string(),
            SourceOutcome::Skipped => "skipped after an earlier failure".to_string(),
        };
        println!("  {:<8} {line}", run.display_name);
    }
    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<TimeDb> {
    TimeDb::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))
}

async fn migrate(config: SyncConfig) -> Result<()> {
    let db = connect(&config).await?;
    db.migrate().await.context("running migrations")?;
    db.close().await;
    println!("schema up to date at {}", config.database_url);
    Ok(())
}

async fn raw(config: SyncConfig, args: RawArgs) -> Result<()> {
    let days = args.days.unwrap_or(config.history_days);
    let db = connect(&config).await?;
    let mut pipeline = SyncPipeline::new(config, db)?;
    match pipeline
        .capture_raw(&args.source, days, Local::now().fixed_offset())
        .await?
    {
        Some(stored) => println!("{}", stored.absolute_path.display()),
        None => println!("nothing to fetch: --days must be positive (got {days})"),
    }
    Ok(())
}

fn teams_or_empty(config: &SyncConfig) -> Vec<TeamConfig> {
    let path = config.config_dir.join("teams.yaml");
    if !path.exists() {
        warn!(path = %path.display(), "no teams file, only per-user reports available");
        return Vec::new();
    }
    match load_teams(&path) {
        Ok(teams) => teams,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "ignoring unreadable teams file");
            Vec::new()
        }
    }
}

async fn serve(config: SyncConfig, port: Option<u16>) -> Result<()> {
    let db = connect(&config).await?;
    let teams = teams_or_empty(&config);
    let port = port.unwrap_or(config.web_port);
    tally_web::serve(AppState::new(db, teams), port).await
}

async fn schedule(mut config: SyncConfig, cron: Option<String>, days: Option<i64>) -> Result<()> {
    config.scheduler_enabled = true;
    if let Some(cron) = cron {
        config.sync_cron = cron;
    }
    let options = SyncOptions::all_sources(days.unwrap_or(config.history_days));
    let cron = config.sync_cron.clone();
    let db = connect(&config).await?;
    let pipeline = Arc::new(Mutex::new(SyncPipeline::new(config, db)?));

    let Some(mut scheduler) = maybe_build_scheduler(pipeline, options).await? else {
        return Ok(());
    };
    scheduler.start().await.context("starting scheduler")?;
    info!(cron, "scheduler running, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("stopping scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
