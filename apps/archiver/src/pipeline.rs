//! Per-(org, kind) archival pipeline: plan what is missing, build and upload
//! each archive, record it in the catalog, roll complete months up, then
//! purge source rows. A failure on one archive never takes down the rest of
//! the org's work; it is logged with full context and skipped.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::{error, info};

use crate::builder;
use crate::catalog;
use crate::config::Config;
use crate::deleter;
use crate::errors::ArchiveError;
use crate::models::{Archive, ArchivePeriod, ArchiveType, Org};
use crate::planner;
use crate::rollup;
use crate::s3;

/// Building one archive file, even a big monthly backfill, gets this long.
const CREATE_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

/// Runs the full pipeline for one org and kind: create missing archives,
/// roll up complete months, and (when enabled) purge archived source rows.
/// Returns the created and purged archives.
pub async fn archive_org(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<(Vec<Archive>, Vec<Archive>)> {
    let mut created = create_org_archives(pool, s3_client, config, org, archive_type, now)
        .await
        .context("error creating archives")?;

    let monthlies = rollup_org_archives(pool, s3_client, config, org, archive_type, now)
        .await
        .context("error rolling up archives")?;
    created.extend(monthlies);

    let mut deleted = Vec::new();
    if config.delete {
        deleted = delete_archived_org_records(pool, org, archive_type, now)
            .await
            .context("error deleting archived records")?;
    }

    Ok((created, deleted))
}

/// Builds all missing archives for an org. An org with an empty catalog is a
/// backfill: whole months are built directly from the database first, then
/// dailies fill in what the months do not cover.
pub async fn create_org_archives(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let start = Instant::now();
    let archive_count = catalog::archive_count(pool, org, archive_type)
        .await
        .context("error getting current archive count")?;

    let mut created = Vec::new();

    if archive_count == 0 {
        let monthlies = planner::missing_monthly_archives(pool, org, archive_type, now)
            .await
            .context("error getting missing monthly archives")?;
        created.extend(create_archives(pool, s3_client, config, org, monthlies).await);
    }

    let dailies = planner::missing_daily_archives(pool, org, archive_type, now)
        .await
        .context("error getting missing daily archives")?;
    created.extend(create_archives(pool, s3_client, config, org, dailies).await);

    if !created.is_empty() {
        let records: i64 = created.iter().map(|a| a.record_count).sum();
        let elapsed = start.elapsed();
        let rate = records as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            org = %org.name,
            org_id = org.id,
            archive_type = %archive_type,
            count = created.len(),
            elapsed = ?elapsed,
            records_per_second = rate,
            "completed archival for org"
        );
    }

    Ok(created)
}

/// Builds, uploads and catalogues each planned archive in turn, returning
/// those that made it all the way. Failures are logged and skipped.
async fn create_archives(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archives: Vec<Archive>,
) -> Vec<Archive> {
    let mut created = Vec::new();

    for mut archive in archives {
        info!(
            org = %org.name,
            org_id = org.id,
            archive_type = %archive.archive_type,
            start_date = %archive.start_date,
            end_date = %archive.end_date(),
            period = %archive.period,
            "starting archive"
        );
        let start = Instant::now();

        match create_archive(pool, s3_client, config, org, &mut archive).await {
            Ok(()) => {
                info!(
                    org_id = org.id,
                    archive_id = archive.id,
                    record_count = archive.record_count,
                    elapsed = ?start.elapsed(),
                    "archive complete"
                );
                created.push(archive);
            }
            Err(err) => {
                error!(
                    org_id = org.id,
                    archive_type = %archive.archive_type,
                    start_date = %archive.start_date,
                    period = %archive.period,
                    error = %format!("{err:#}"),
                    "error creating archive"
                );
            }
        }
    }

    created
}

async fn create_archive(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive: &mut Archive,
) -> Result<()> {
    timeout(
        CREATE_ARCHIVE_TIMEOUT,
        builder::create_archive_file(pool, org, archive, Path::new(&config.temp_dir)),
    )
    .await
    .context("timed out building archive file")?
    .context("error writing archive file")?;

    let result = upload_and_catalogue(pool, s3_client, config, archive).await;

    if !config.keep_files {
        if let Err(err) = builder::delete_scratch_file(archive) {
            error!(org_id = org.id, error = %format!("{err:#}"), "error deleting scratch file");
        }
    }

    result
}

async fn upload_and_catalogue(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    archive: &mut Archive,
) -> Result<()> {
    if config.upload_to_s3 {
        s3::upload_archive(s3_client, config, archive)
            .await
            .context("error uploading archive")?;
    }

    catalog::insert_archive(pool, archive)
        .await
        .context("error writing archive to catalog")
}

/// Rolls up monthly archives from complete sets of daily archives. Months
/// with gaps in their daily coverage are skipped (and logged), not failed.
pub async fn rollup_org_archives(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let org_timeout = Duration::from_secs(config.rollup_org_timeout as u64 * 3600);
    timeout(
        org_timeout,
        rollup_archives(pool, s3_client, config, org, archive_type, now),
    )
    .await
    .context("timed out rolling up org archives")?
}

async fn rollup_archives(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let missing = planner::missing_monthly_archives(pool, org, archive_type, now).await?;

    let mut created = Vec::new();
    for mut monthly in missing {
        info!(
            org = %org.name,
            org_id = org.id,
            archive_type = %archive_type,
            start_date = %monthly.start_date,
            "starting rollup"
        );
        let start = Instant::now();

        match build_and_catalogue_rollup(pool, s3_client, config, org, &mut monthly, false).await {
            Ok(()) => {
                info!(
                    org_id = org.id,
                    archive_id = monthly.id,
                    record_count = monthly.record_count,
                    elapsed = ?start.elapsed(),
                    "rollup complete"
                );
                created.push(monthly);
            }
            Err(err) => {
                error!(
                    org_id = org.id,
                    archive_type = %archive_type,
                    start_date = %monthly.start_date,
                    period = %monthly.period,
                    error = %format!("{err:#}"),
                    "error building monthly archive"
                );
            }
        }
    }

    Ok(created)
}

async fn build_and_catalogue_rollup(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    monthly: &mut Archive,
    replace_existing: bool,
) -> Result<()> {
    rollup::build_rollup_archive(pool, s3_client, config, org, monthly)
        .await
        .context("error building rollup archive")?;

    let result = async {
        if config.upload_to_s3 {
            s3::upload_archive(s3_client, config, monthly)
                .await
                .context("error uploading rollup archive")?;
        }
        if replace_existing {
            catalog::upsert_archive(pool, monthly).await
        } else {
            catalog::insert_archive(pool, monthly).await
        }
        .context("error writing rollup to catalog")
    }
    .await;

    if !config.keep_files {
        if let Err(err) = builder::delete_scratch_file(monthly) {
            error!(org_id = org.id, error = %format!("{err:#}"), "error deleting scratch file");
        }
    }

    result
}

/// Purges source rows for every catalog entry still flagged as needing
/// deletion, marking each entry purged as its batches commit.
pub async fn delete_archived_org_records(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let archives = catalog::list_archives_needing_deletion(pool, org, archive_type)
        .await
        .context("error finding archives needing deletion")?;

    let mut deleted = Vec::new();
    for mut archive in archives {
        let start = Instant::now();

        let result = delete_archive_records(pool, org, &archive).await;
        if let Err(err) = result {
            error!(
                archive_id = archive.id,
                org_id = archive.org_id,
                archive_type = %archive.archive_type,
                start_date = %archive.start_date,
                period = %archive.period,
                error = %format!("{err:#}"),
                "error deleting archive records"
            );
            continue;
        }

        catalog::mark_archive_purged(pool, archive.id, now).await?;
        archive.needs_deletion = false;
        archive.deleted_on = Some(now);

        info!(
            archive_id = archive.id,
            org_id = archive.org_id,
            archive_type = %archive.archive_type,
            record_count = archive.record_count,
            start_date = %archive.start_date,
            period = %archive.period,
            elapsed = ?start.elapsed(),
            "deleted archive records"
        );
        deleted.push(archive);
    }

    Ok(deleted)
}

async fn delete_archive_records(pool: &PgPool, org: &Org, archive: &Archive) -> Result<()> {
    match archive.archive_type {
        ArchiveType::Message => {
            deleter::delete_archived_messages(pool, archive).await?;
            deleter::delete_orphaned_broadcasts(pool, org, archive.end_date()).await
        }
        ArchiveType::Run => deleter::delete_archived_runs(pool, archive).await,
        ArchiveType::Session => Err(ArchiveError::UnknownArchiveType(archive.archive_type).into()),
    }
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>> {
    Ok(NaiveDate::from_ymd_opt(year, month, 1)
        .with_context(|| format!("invalid year/month: {year}-{month:02}"))?
        .and_time(NaiveTime::MIN)
        .and_utc())
}

/// One-shot: archives a single calendar month for an org straight from the
/// database, as one monthly archive.
pub async fn archive_org_single_month(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    year: i32,
    month: u32,
) -> Result<Vec<Archive>> {
    let archive = Archive::planned(org, archive_type, ArchivePeriod::Month, month_start(year, month)?);
    Ok(create_archives(pool, s3_client, config, org, vec![archive]).await)
}

/// One-shot: builds any missing dailies for a single calendar month, then
/// rolls the month up, replacing an existing monthly catalog row in place.
pub async fn rollup_org_single_month(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    archive_type: ArchiveType,
    year: i32,
    month: u32,
) -> Result<Vec<Archive>> {
    let start = month_start(year, month)?;

    let monthly_template = Archive::planned(org, archive_type, ArchivePeriod::Month, start);
    let first_day = start.date_naive();
    let last_day = (monthly_template.end_date() - chrono::Duration::days(1)).date_naive();

    let missing_dailies =
        planner::missing_daily_archives_in_range(pool, org, archive_type, first_day, last_day).await?;
    let mut created = create_archives(pool, s3_client, config, org, missing_dailies).await;

    let mut monthly = monthly_template;
    build_and_catalogue_rollup(pool, s3_client, config, org, &mut monthly, true).await?;
    created.push(monthly);

    Ok(created)
}

/// One-shot: purges a single calendar month's already-archived source rows
/// for an org, without touching the catalog.
pub async fn delete_archived_org_month(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    year: i32,
    month: u32,
) -> Result<()> {
    let archive = Archive::planned(org, archive_type, ArchivePeriod::Month, month_start(year, month)?);
    delete_archive_records(pool, org, &archive).await
}
