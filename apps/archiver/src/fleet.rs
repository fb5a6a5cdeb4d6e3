//! Fleet coordination: iterates active orgs and runs their pipelines
//! concurrently under a bounded slot pool, then sleeps until the next
//! configured sweep time. Also hosts the one-shot subcommand entry points.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::PgPool;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::models::{ArchiveType, Org};
use crate::pipeline;

/// No single org may hold a slot longer than this.
const ORG_TIMEOUT: Duration = Duration::from_secs(12 * 3600);
/// Backoff after a failed org listing before reconnecting and retrying.
const ORG_LIST_RETRY: Duration = Duration::from_secs(5 * 60);
const ORG_LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// Returns a token cancelled on SIGINT, SIGTERM or SIGQUIT.
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();

    let mut interrupt = signal(SignalKind::interrupt()).context("error installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("error installing SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("error installing SIGQUIT handler")?;

    let listener = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
        info!("shutdown signal received");
        listener.cancel();
    });

    Ok(token)
}

fn enabled_kinds(config: &Config) -> Vec<ArchiveType> {
    let mut kinds = Vec::new();
    if config.archive_messages {
        kinds.push(ArchiveType::Message);
    }
    if config.archive_runs {
        kinds.push(ArchiveType::Run);
    }
    kinds
}

/// The next sweep time: today's occurrence of `at`, pushed a day forward if
/// that has already gone by when this sweep began.
fn next_sweep_time(sweep_start: DateTime<Utc>, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let mut next = now.date_naive().and_time(at).and_utc();
    if next < sweep_start {
        next = next + chrono::Duration::days(1);
    }
    next
}

/// Daemon loop: sweep all active orgs, then sleep until the configured start
/// time of the next day and repeat. With `exit_on_completion` set, a single
/// sweep is performed.
pub async fn run(
    config: Config,
    mut pool: PgPool,
    s3_client: S3Client,
    shutdown: CancellationToken,
) -> Result<()> {
    let start_time = config.sweep_start_time()?;
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_archivation));
    let config = Arc::new(config);

    loop {
        let sweep_start = Utc::now();

        let orgs = match timeout(ORG_LIST_TIMEOUT, catalog::get_active_orgs(&pool, &config)).await {
            Ok(Ok(orgs)) => orgs,
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "error getting active orgs");
                tokio::select! {
                    _ = sleep(ORG_LIST_RETRY) => {}
                    _ = shutdown.cancelled() => break,
                }
                // the old pool may be wedged on a broken connection; start fresh
                pool = db::create_pool(&config.db).await?;
                continue;
            }
            Err(_) => {
                error!("timed out getting active orgs");
                tokio::select! {
                    _ = sleep(ORG_LIST_RETRY) => {}
                    _ = shutdown.cancelled() => break,
                }
                pool = db::create_pool(&config.db).await?;
                continue;
            }
        };

        let mut tasks = JoinSet::new();
        for org in orgs {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.context("semaphore closed")?,
                _ = shutdown.cancelled() => break,
            };

            let pool = pool.clone();
            let s3_client = s3_client.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                archive_org_task(&pool, &s3_client, &config, &org, &shutdown).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        if shutdown.is_cancelled() {
            info!("shutdown requested, stopping");
            break;
        }
        if config.exit_on_completion {
            info!("archival sweep complete, exiting");
            break;
        }

        let now = Utc::now();
        let next = next_sweep_time(sweep_start, now, start_time);
        let nap = (next - now).to_std().unwrap_or(Duration::ZERO);
        if nap > Duration::ZERO {
            info!(next_start = %next, nap = ?nap, "sleeping until next sweep");
            tokio::select! {
                _ = sleep(nap) => {}
                _ = shutdown.cancelled() => break,
            }
        } else {
            info!(next_start = %next, "rebuilding immediately without sleep");
        }
    }

    Ok(())
}

/// Archives every enabled kind for one org under the 12-hour cap,
/// abandoning the org's remaining work on shutdown.
async fn archive_org_task(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    shutdown: &CancellationToken,
) {
    let work = async {
        for archive_type in enabled_kinds(config) {
            if shutdown.is_cancelled() {
                return;
            }
            let result = pipeline::archive_org(pool, s3_client, config, org, archive_type, Utc::now()).await;
            if let Err(err) = result {
                error!(
                    org = %org.name,
                    org_id = org.id,
                    archive_type = %archive_type,
                    error = %format!("{err:#}"),
                    "error archiving org"
                );
            }
        }
    };

    let capped = timeout(ORG_TIMEOUT, async {
        tokio::select! {
            _ = work => {}
            _ = shutdown.cancelled() => {
                warn!(org_id = org.id, "shutdown requested, abandoning org");
            }
        }
    });

    if capped.await.is_err() {
        error!(org = %org.name, org_id = org.id, "org archival timed out");
    }
}

async fn require_org(pool: &PgPool, config: &Config, org_id: i32) -> Result<Org> {
    catalog::get_org(pool, config, org_id)
        .await?
        .with_context(|| format!("no org with id {org_id}"))
}

/// One-shot: purge archived rows for all active orgs.
pub async fn execute_delete_archived(
    pool: &PgPool,
    config: &Config,
    archive_type: ArchiveType,
) -> Result<()> {
    let orgs = catalog::get_active_orgs(pool, config).await.context("error fetching active orgs")?;
    let now = Utc::now();

    for org in orgs {
        let result = timeout(
            ORG_TIMEOUT,
            pipeline::delete_archived_org_records(pool, &org, archive_type, now),
        )
        .await;

        match result {
            Ok(Ok(deleted)) => {
                info!(org = %org.name, org_id = org.id, archive_type = %archive_type, count = deleted.len(), "archives deleted");
            }
            Ok(Err(err)) => {
                error!(org_id = org.id, archive_type = %archive_type, error = %format!("{err:#}"), "error deleting archived records");
            }
            Err(_) => {
                error!(org_id = org.id, archive_type = %archive_type, "timed out deleting archived records");
            }
        }
    }
    Ok(())
}

/// One-shot: purge archived rows for a single org.
pub async fn execute_delete_archived_for_org(
    pool: &PgPool,
    config: &Config,
    archive_type: ArchiveType,
    org_id: i32,
) -> Result<()> {
    let org = require_org(pool, config, org_id).await?;
    let deleted = timeout(
        ORG_TIMEOUT,
        pipeline::delete_archived_org_records(pool, &org, archive_type, Utc::now()),
    )
    .await
    .context("timed out deleting archived records")??;

    info!(org = %org.name, org_id = org.id, archive_type = %archive_type, count = deleted.len(), "archives deleted");
    Ok(())
}

/// One-shot: archive one calendar month for one org as a single monthly
/// archive per enabled kind.
pub async fn execute_archive_single_month(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org_id: i32,
    year: i32,
    month: u32,
) -> Result<()> {
    let org = require_org(pool, config, org_id).await?;
    for archive_type in enabled_kinds(config) {
        let created =
            pipeline::archive_org_single_month(pool, s3_client, config, &org, archive_type, year, month).await?;
        info!(org_id = org.id, archive_type = %archive_type, count = created.len(), "single month archived");
    }
    Ok(())
}

/// One-shot: rebuild one calendar month's rollup for one org from its daily
/// archives, creating any missing dailies first.
pub async fn execute_rollup_single_month(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org_id: i32,
    year: i32,
    month: u32,
) -> Result<()> {
    let org = require_org(pool, config, org_id).await?;
    for archive_type in enabled_kinds(config) {
        let created =
            pipeline::rollup_org_single_month(pool, s3_client, config, &org, archive_type, year, month).await?;
        info!(org_id = org.id, archive_type = %archive_type, count = created.len(), "single month rolled up");
    }
    Ok(())
}

/// One-shot: purge one already-archived calendar month for one org.
pub async fn execute_delete_single_month(
    pool: &PgPool,
    config: &Config,
    archive_type: ArchiveType,
    org_id: i32,
    year: i32,
    month: u32,
) -> Result<()> {
    let org = require_org(pool, config, org_id).await?;
    pipeline::delete_archived_org_month(pool, &org, archive_type, year, month).await?;
    info!(org_id = org.id, archive_type = %archive_type, year, month, "single month deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_sweep_is_tomorrow_when_todays_slot_passed() {
        let at = NaiveTime::from_hms_opt(0, 1, 0).unwrap();
        let sweep_start = Utc.with_ymd_and_hms(2018, 1, 8, 0, 2, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2018, 1, 8, 0, 30, 0).unwrap();

        let next = next_sweep_time(sweep_start, now, at);
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 1, 9, 0, 1, 0).unwrap());
    }

    #[test]
    fn test_next_sweep_is_today_when_slot_still_ahead() {
        let at = NaiveTime::from_hms_opt(23, 55, 0).unwrap();
        let sweep_start = Utc.with_ymd_and_hms(2018, 1, 8, 23, 50, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2018, 1, 8, 23, 52, 0).unwrap();

        let next = next_sweep_time(sweep_start, now, at);
        assert_eq!(next, Utc.with_ymd_and_hms(2018, 1, 8, 23, 55, 0).unwrap());
    }

    #[test]
    fn test_enabled_kinds_follow_config() {
        let mut config = Config {
            db: String::new(),
            log_level: "info".to_string(),
            sentry_dsn: None,
            s3_endpoint: String::new(),
            s3_region: String::new(),
            s3_bucket: String::new(),
            s3_disable_ssl: false,
            s3_force_path_style: false,
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            temp_dir: "/tmp".to_string(),
            keep_files: false,
            upload_to_s3: true,
            archive_messages: true,
            archive_runs: true,
            retention_period: 90,
            delete: false,
            exit_on_completion: false,
            start_time: "00:01".to_string(),
            rollup_org_timeout: 3,
            build_rollup_archive_timeout: 1,
            max_concurrent_archivation: 2,
        };
        assert_eq!(enabled_kinds(&config), vec![ArchiveType::Message, ArchiveType::Run]);

        config.archive_messages = false;
        assert_eq!(enabled_kinds(&config), vec![ArchiveType::Run]);
    }
}
