use std::io;
use std::sync::Arc;

use adspend_core::{CanonicalCategory, DateWindow};
use adspend_storage::{PeriodStore, PgPeriodStore, ResetScope};
use adspend_sync::{
    dashboard_records, maybe_build_scheduler, open_store, report, report_momentum_markdown,
    run_sync_once_from_env, window, DashboardFilter, SyncConfig, SyncOptions, SyncPipeline,
    SyncRunSummary,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "adspend-cli")]
#[command(about = "Ad-spend ingestion and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile and store every enabled platform.
    Sync(SyncArgs),
    /// Re-fetch the page ranges a previous run recorded as failed.
    Resume { run_id: Uuid },
    /// Print the momentum dashboard, or recent runs with `--runs`.
    Report(ReportArgs),
    /// Delete stored periods.
    Reset(ResetArgs),
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    since: Option<NaiveDate>,
    #[arg(long)]
    until: Option<NaiveDate>,
    /// Limit the run to these platform ids.
    #[arg(long = "platform")]
    platforms: Vec<String>,
    #[arg(long)]
    page_size: Option<usize>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long)]
    ad: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    since: Option<NaiveDate>,
    #[arg(long)]
    until: Option<NaiveDate>,
    /// List the N most recent sync runs instead of the dashboard.
    #[arg(long)]
    runs: Option<usize>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ResetArgs {
    #[arg(long)]
    all: bool,
    #[arg(long)]
    ad: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn optional_window(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Result<Option<DateWindow>> {
    match (since, until) {
        (Some(since), Some(until)) => Ok(Some(window::explicit_window(since, until)?)),
        (None, None) => Ok(None),
        _ => bail!("--since and --until must be given together"),
    }
}

fn print_summary(summary: &SyncRunSummary) {
    let totals = summary.totals();
    println!(
        "sync complete: run_id={} platforms={} rows={} inserted={} updated={} duplicates={} gaps={} failed_ranges={} reports={}",
        summary.run_id,
        summary.platforms.len(),
        summary.rows_fetched(),
        totals.inserted,
        totals.updated,
        totals.duplicates_dropped,
        summary.gaps().len(),
        summary.failed_ranges().len(),
        summary.reports_dir
    );
    if !summary.failed_ranges().is_empty() {
        println!("resume with: adspend-cli resume {}", summary.run_id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let options = SyncOptions {
                window: optional_window(args.since, args.until)?,
                platforms: args.platforms,
                page_size: args.page_size,
            };
            let summary = run_sync_once_from_env(options).await?;
            print_summary(&summary);
        }
        Commands::Resume { run_id } => {
            let store = open_store(&config).await?;
            let summary = SyncPipeline::new(config, store)?
                .resume_failed_ranges(run_id)
                .await?;
            print_summary(&summary);
        }
        Commands::Report(args) => {
            if let Some(runs) = args.runs {
                println!("{}", report::report_runs_markdown(runs, &config.reports_dir)?);
                return Ok(());
            }
            let category = args
                .category
                .as_deref()
                .map(|name| {
                    CanonicalCategory::from_name(name)
                        .ok_or_else(|| anyhow!("unknown category {name:?}"))
                })
                .transpose()?;
            let filter = DashboardFilter {
                ad_id: args.ad,
                window: optional_window(args.since, args.until)?,
                category,
            };
            let today = window::local_date(Utc::now(), config.reporting_tz);
            let store = open_store(&config).await?;
            let records = dashboard_records(store.as_ref(), &filter, today).await?;
            println!("{}", report_momentum_markdown(&records));
        }
        Commands::Reset(args) => {
            let scope = match (args.all, args.ad) {
                (true, _) => ResetScope::All,
                (false, Some(ad_id)) => ResetScope::Ad(ad_id),
                (false, None) => bail!("pass --all or --ad <AD_ID>"),
            };
            let store = open_store(&config).await?;
            let removed = store.reset(&scope).await?;
            println!("reset complete: removed={removed}");
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgPeriodStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set ADSPEND_SCHEDULER_ENABLED=true");
            }
            let store = open_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let Some(sched) = maybe_build_scheduler(pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
