mod builder;
mod catalog;
mod config;
mod db;
mod deleter;
mod errors;
mod fleet;
mod models;
mod pipeline;
mod planner;
mod readers;
mod rollup;
mod s3;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::models::ArchiveType;

#[derive(Parser)]
#[command(name = "archiver", about = "Archives messages and flow runs to S3, then purges them from the database")]
struct Cli {
    /// Only purge rows for archives already flagged for deletion, then exit
    #[arg(long)]
    delete_archived: bool,

    /// Like --delete-archived but restricted to one org
    #[arg(long, value_name = "ORG_ID")]
    delete_from_org: Option<i32>,

    /// Archive kind for the delete subcommands (run or message)
    #[arg(long, default_value = "run")]
    delete_archive_type: ArchiveType,

    /// Archive one calendar month for --org-id as a single monthly archive, then exit
    #[arg(long)]
    archive_single_month: bool,

    /// Rebuild one month's rollup for --org-id from its daily archives, then exit
    #[arg(long)]
    archive_rollup_single_month: bool,

    /// Purge one already-archived month for --org-id, then exit
    #[arg(long)]
    delete_from_org_single_month: bool,

    #[arg(long)]
    org_id: Option<i32>,

    /// Year for the single-month subcommands, e.g. 2022
    #[arg(long)]
    year: Option<i32>,

    /// Month for the single-month subcommands, 1-12
    #[arg(long)]
    month: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first; invalid or conflicting settings are fatal
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.log_level))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting archiver v{}", env!("CARGO_PKG_VERSION"));
    if config.sentry_dsn.is_some() {
        info!("error-sink DSN configured");
    }

    // Initialize PostgreSQL
    let pool = db::create_pool(&config.db).await?;

    // Initialize S3 / MinIO
    let s3_client = s3::build_client(&config).await;
    info!("S3 client initialized (bucket: {})", config.s3_bucket);

    // Ensure we can actually write scratch files
    builder::ensure_temp_dir(Path::new(&config.temp_dir)).context("cannot write to temp directory")?;

    // One-shot subcommands run their slice of the pipeline and exit
    if cli.delete_archived {
        return fleet::execute_delete_archived(&pool, &config, cli.delete_archive_type).await;
    }
    if let Some(org_id) = cli.delete_from_org {
        return fleet::execute_delete_archived_for_org(&pool, &config, cli.delete_archive_type, org_id).await;
    }
    if cli.archive_single_month || cli.archive_rollup_single_month || cli.delete_from_org_single_month {
        let org_id = cli.org_id.context("--org-id is required for single-month subcommands")?;
        let year = cli.year.context("--year is required for single-month subcommands")?;
        let month = cli.month.context("--month is required for single-month subcommands")?;

        if cli.archive_single_month {
            return fleet::execute_archive_single_month(&pool, &s3_client, &config, org_id, year, month).await;
        }
        if cli.archive_rollup_single_month {
            return fleet::execute_rollup_single_month(&pool, &s3_client, &config, org_id, year, month).await;
        }
        return fleet::execute_delete_single_month(&pool, &config, cli.delete_archive_type, org_id, year, month)
            .await;
    }

    let shutdown = fleet::shutdown_token()?;
    fleet::run(config, pool, s3_client, shutdown).await
}
