use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use coa_core::OpportunityStatus;
use coa_storage::{ListOrder, ListQuery, OpportunityStore, PgOpportunityStore, StatusPolicy};
use coa_sync::{pipeline_from_env, report_recent_runs, AnalysisConfig, RunOverrides};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "coa-cli")]
#[command(about = "Content opportunity analysis command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one analysis pass and persist the scored opportunities.
    Analyze(AnalyzeArgs),
    /// List stored opportunities.
    List(ListArgs),
    /// Move an opportunity to another workflow status.
    SetStatus { keyword: String, status: OpportunityStatus },
    Migrate,
    Serve,
    /// Run the cron refresher until interrupted.
    Schedule,
    /// Print a digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args, Default)]
struct AnalyzeArgs {
    #[arg(long)]
    days: Option<u32>,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    min_impressions: Option<u64>,
    #[arg(long)]
    max_position: Option<f64>,
    /// Last day of the window (defaults to today, UTC).
    #[arg(long)]
    end_date: Option<NaiveDate>,
    /// Analyze without writing to the database.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    status: Option<OpportunityStatus>,
    #[arg(long, default_value_t = coa_storage::DEFAULT_LIST_LIMIT)]
    limit: usize,
    #[arg(long, default_value_t = ListOrder::Recent)]
    sort: ListOrder,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("COA_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn store_from_env() -> Result<PgOpportunityStore> {
    let config = AnalysisConfig::from_env();
    let Some(url) = config.database_url else {
        bail!("DATABASE_URL must be set for this command");
    };
    PgOpportunityStore::connect(&url, StatusPolicy::default())
        .await
        .context("connecting to opportunity store")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Analyze(AnalyzeArgs::default())) {
        Commands::Analyze(args) => {
            let pipeline = pipeline_from_env(args.dry_run).await?;
            let overrides = RunOverrides {
                window_days: args.days,
                country: args.country,
                min_impressions: args.min_impressions,
                max_position: args.max_position,
                end_date: args.end_date,
            };
            let summary = pipeline.run_once(&overrides).await?;
            println!(
                "analysis complete: run_id={} clusters_found={} opportunities_written={} failed={} reports={}",
                summary.run_id,
                summary.clusters_found,
                summary.opportunities_written,
                summary.failed_writes.len(),
                summary.reports_dir
            );
            for err in &summary.report_errors {
                eprintln!("warning: {err}");
            }
        }
        Commands::List(args) => {
            let store = store_from_env().await?;
            let rows = store
                .list(&ListQuery {
                    status: args.status,
                    limit: args.limit,
                    order: args.sort,
                })
                .await?;
            for row in &rows {
                println!(
                    "{:>6.1}  {:<12} {:>8}  {:>5.1}  {}  {}",
                    row.opportunity_score,
                    row.status,
                    row.impressions_30d,
                    row.current_position,
                    row.keyword,
                    row.related_product_id.as_deref().unwrap_or("-")
                );
            }
            if rows.is_empty() {
                eprintln!("no opportunities matched");
            }
        }
        Commands::SetStatus { keyword, status } => {
            let store = store_from_env().await?;
            let row = store.set_status(&keyword, status).await?;
            println!("{} -> {}", row.keyword, row.status);
        }
        Commands::Migrate => {
            let store = store_from_env().await?;
            coa_storage::run_migrations(store.pool()).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            coa_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_env(false).await?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set COA_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::Report { runs } => {
            let config = AnalysisConfig::from_env();
            println!("{}", report_recent_runs(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
