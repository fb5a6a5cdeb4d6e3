//! CRUD on the archive catalog. The catalog is the single source of truth:
//! objects in S3 and files on scratch disk are caches of its state, and every
//! multi-statement operation here is transactional.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::timeout;

use crate::config::Config;
use crate::errors::ArchiveError;
use crate::models::{Archive, ArchivePeriod, ArchiveType, Org};

/// Catalog queries are expected to be cheap; anything slower than this is a
/// stuck connection.
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

const LOOKUP_ACTIVE_ORGS: &str = r#"
SELECT o.id, o.name, o.created_on, o.is_anon
FROM orgs_org o
WHERE o.is_active = TRUE
ORDER BY o.id
"#;

/// Returns the active orgs sorted by id, with the configured retention
/// period applied.
pub async fn get_active_orgs(pool: &PgPool, config: &Config) -> Result<Vec<Org>> {
    let mut orgs: Vec<Org> = timeout(
        QUERY_TIMEOUT,
        sqlx::query_as(LOOKUP_ACTIVE_ORGS).fetch_all(pool),
    )
    .await
    .context("timed out fetching active orgs")?
    .context("error fetching active orgs")?;

    for org in &mut orgs {
        org.retention_days = config.retention_period;
    }
    Ok(orgs)
}

const SELECT_ORG: &str = r#"
SELECT o.id, o.name, o.created_on, o.is_anon
FROM orgs_org o
WHERE o.id = $1
"#;

pub async fn get_org(pool: &PgPool, config: &Config, org_id: i32) -> Result<Option<Org>> {
    let org: Option<Org> = timeout(
        QUERY_TIMEOUT,
        sqlx::query_as(SELECT_ORG).bind(org_id).fetch_optional(pool),
    )
    .await
    .context("timed out fetching org")?
    .with_context(|| format!("error fetching org for id: {org_id}"))?;

    Ok(org.map(|mut o| {
        o.retention_days = config.retention_period;
        o
    }))
}

const LOOKUP_ORG_ARCHIVES: &str = r#"
SELECT id, archive_type, org_id, created_on, start_date, period, record_count, size, hash, url, build_time, needs_deletion, deleted_on, rollup_id
FROM archives_archive
WHERE org_id = $1 AND archive_type = $2
ORDER BY start_date ASC, period DESC
"#;

/// All catalog rows for an org and kind, ordered by start date ascending and
/// period descending so a monthly precedes its constituent dailies when
/// start dates collide at a month boundary.
pub async fn list_archives(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
) -> Result<Vec<Archive>> {
    timeout(
        QUERY_TIMEOUT,
        sqlx::query_as(LOOKUP_ORG_ARCHIVES)
            .bind(org.id)
            .bind(archive_type)
            .fetch_all(pool),
    )
    .await
    .context("timed out listing archives")?
    .with_context(|| format!("error selecting archives for org: {} and type: {}", org.id, archive_type))
}

const LOOKUP_ARCHIVES_NEEDING_DELETION: &str = r#"
SELECT id, archive_type, org_id, created_on, start_date, period, record_count, size, hash, url, build_time, needs_deletion, deleted_on, rollup_id
FROM archives_archive
WHERE org_id = $1 AND archive_type = $2 AND needs_deletion = TRUE
ORDER BY start_date ASC, period DESC
"#;

/// Catalog rows whose source rows have been archived but not yet purged.
pub async fn list_archives_needing_deletion(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
) -> Result<Vec<Archive>> {
    timeout(
        QUERY_TIMEOUT,
        sqlx::query_as(LOOKUP_ARCHIVES_NEEDING_DELETION)
            .bind(org.id)
            .bind(archive_type)
            .fetch_all(pool),
    )
    .await
    .context("timed out listing archives needing deletion")?
    .with_context(|| {
        format!("error selecting archives needing deletion for org: {} and type: {}", org.id, archive_type)
    })
}

const COUNT_ORG_ARCHIVES: &str = r#"
SELECT count(id)
FROM archives_archive
WHERE org_id = $1 AND archive_type = $2
"#;

pub async fn archive_count(pool: &PgPool, org: &Org, archive_type: ArchiveType) -> Result<i64> {
    timeout(
        QUERY_TIMEOUT,
        sqlx::query_scalar(COUNT_ORG_ARCHIVES)
            .bind(org.id)
            .bind(archive_type)
            .fetch_one(pool),
    )
    .await
    .context("timed out counting archives")?
    .with_context(|| format!("error counting archives for org: {} and type: {}", org.id, archive_type))
}

// inclusive on both sides
const LOOKUP_DAILY_ARCHIVES_IN_RANGE: &str = r#"
SELECT id, archive_type, org_id, created_on, start_date, period, record_count, size, hash, url, build_time, needs_deletion, deleted_on, rollup_id
FROM archives_archive
WHERE org_id = $1 AND archive_type = $2 AND period = $3 AND start_date BETWEEN $4 AND $5
ORDER BY start_date ASC
"#;

/// Daily archives for an org and kind whose start dates fall in
/// `[start, end]`.
pub async fn daily_archives_in_range(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    timeout(
        QUERY_TIMEOUT,
        sqlx::query_as(LOOKUP_DAILY_ARCHIVES_IN_RANGE)
            .bind(org.id)
            .bind(archive_type)
            .bind(ArchivePeriod::Day)
            .bind(start)
            .bind(end)
            .fetch_all(pool),
    )
    .await
    .context("timed out listing daily archives")?
    .with_context(|| format!("error selecting daily archives for org: {} and type: {}", org.id, archive_type))
}

const INSERT_ARCHIVE: &str = r#"
INSERT INTO archives_archive(archive_type, org_id, created_on, start_date, period, record_count, size, hash, url, needs_deletion, build_time, rollup_id)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
RETURNING id
"#;

const UPSERT_ARCHIVE: &str = r#"
INSERT INTO archives_archive(archive_type, org_id, created_on, start_date, period, record_count, size, hash, url, needs_deletion, build_time, rollup_id)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (org_id, archive_type, start_date, period) DO UPDATE
SET created_on = EXCLUDED.created_on,
    record_count = EXCLUDED.record_count,
    size = EXCLUDED.size,
    hash = EXCLUDED.hash,
    url = EXCLUDED.url,
    needs_deletion = EXCLUDED.needs_deletion,
    build_time = EXCLUDED.build_time,
    rollup_id = EXCLUDED.rollup_id
RETURNING id
"#;

const UPDATE_ROLLUPS: &str = r#"
UPDATE archives_archive
SET rollup_id = $1
WHERE id = ANY($2)
"#;

/// Inserts a built archive, assigning its id. If the archive carries a
/// `dailies` list, those rows' `rollup_id` is set to the new id in the same
/// transaction; updating anything other than exactly that many rows aborts.
pub async fn insert_archive(pool: &PgPool, archive: &mut Archive) -> Result<()> {
    write_archive(pool, archive, INSERT_ARCHIVE).await
}

/// Same as [`insert_archive`] but replaces all non-key fields on a
/// (org, type, start_date, period) conflict. Used when a monthly is rebuilt
/// in place.
pub async fn upsert_archive(pool: &PgPool, archive: &mut Archive) -> Result<()> {
    write_archive(pool, archive, UPSERT_ARCHIVE).await
}

async fn write_archive(pool: &PgPool, archive: &mut Archive, query: &'static str) -> Result<()> {
    archive.created_on = Utc::now();

    let result = timeout(QUERY_TIMEOUT, async {
        let mut tx = pool.begin().await?;

        let id: i32 = sqlx::query_scalar(query)
            .bind(archive.archive_type)
            .bind(archive.org_id)
            .bind(archive.created_on)
            .bind(archive.start_date)
            .bind(archive.period)
            .bind(archive.record_count)
            .bind(archive.size)
            .bind(&archive.hash)
            .bind(&archive.url)
            .bind(archive.needs_deletion)
            .bind(archive.build_time)
            .bind(archive.rollup_id)
            .fetch_one(&mut *tx)
            .await
            .context("error writing archive row")?;

        if !archive.dailies.is_empty() {
            let child_ids: Vec<i32> = archive.dailies.iter().map(|d| d.id).collect();
            let updated = sqlx::query(UPDATE_ROLLUPS)
                .bind(id)
                .bind(&child_ids)
                .execute(&mut *tx)
                .await
                .context("error updating rollup ids")?
                .rows_affected();

            if updated as usize != child_ids.len() {
                // dropping the transaction rolls everything back
                return Err(ArchiveError::RollupChildMismatch {
                    expected: child_ids.len(),
                    updated,
                }
                .into());
            }
        }

        tx.commit().await.context("error committing archive transaction")?;
        Ok::<i32, anyhow::Error>(id)
    })
    .await
    .context("timed out writing archive to catalog")??;

    archive.id = result;
    Ok(())
}

const SET_ARCHIVE_PURGED: &str = r#"
UPDATE archives_archive
SET needs_deletion = FALSE, deleted_on = $2
WHERE id = $1
"#;

/// Records that an archive's source rows have been purged.
pub async fn mark_archive_purged(pool: &PgPool, archive_id: i32, when: DateTime<Utc>) -> Result<()> {
    timeout(
        QUERY_TIMEOUT,
        sqlx::query(SET_ARCHIVE_PURGED).bind(archive_id).bind(when).execute(pool),
    )
    .await
    .context("timed out marking archive purged")?
    .with_context(|| format!("error marking archive {archive_id} purged"))?;
    Ok(())
}
