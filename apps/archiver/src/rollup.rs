//! Builds a monthly archive by re-combining the month's daily archives.
//! Each daily object is downloaded, its bytes hashed against the catalog on
//! the way through a decompressor, and its decompressed content appended
//! verbatim to a fresh gzip stream. A corrupt or missing daily aborts the
//! whole rollup before anything reaches the catalog.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Duration as TimeDelta, Months, NaiveDate, NaiveTime, Utc};
use flate2::write::GzDecoder;
use md5::{Digest, Md5};
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::debug;

use crate::builder::ScratchWriter;
use crate::catalog;
use crate::config::Config;
use crate::errors::ArchiveError;
use crate::models::{Archive, Org};
use crate::planner;
use crate::s3;

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Verifies and appends one daily archive into the monthly stream: compressed
/// bytes are hashed as they arrive and decompressed into the monthly writer.
struct DailyAppender<'a> {
    decoder: GzDecoder<&'a mut ScratchWriter>,
    hasher: Md5,
}

impl<'a> DailyAppender<'a> {
    fn new(scratch: &'a mut ScratchWriter) -> Self {
        DailyAppender {
            decoder: GzDecoder::new(scratch),
            hasher: Md5::new(),
        }
    }

    fn chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.hasher.update(bytes);
        self.decoder
            .write_all(bytes)
            .context("error decompressing daily archive")?;
        Ok(())
    }

    /// Closes the decompressor and checks the downloaded bytes against the
    /// daily's catalog hash.
    fn finish(mut self, daily: &Archive) -> Result<()> {
        self.decoder
            .try_finish()
            .context("error finishing daily archive decompression")?;

        let actual = hex::encode(self.hasher.finalize());
        if actual != daily.hash {
            return Err(ArchiveError::DailyHashMismatch {
                url: daily.url.clone(),
                expected: daily.hash.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }
}

/// Builds a monthly rollup archive from its already-uploaded dailies,
/// refusing if any day of the month is not yet covered.
pub async fn build_rollup_archive(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    monthly: &mut Archive,
) -> Result<()> {
    let build_timeout = Duration::from_secs(config.build_rollup_archive_timeout as u64 * 3600);
    timeout(build_timeout, build_rollup(pool, s3_client, config, org, monthly))
        .await
        .context("timed out building rollup archive")?
}

async fn build_rollup(
    pool: &PgPool,
    s3_client: &S3Client,
    config: &Config,
    org: &Org,
    monthly: &mut Archive,
) -> Result<()> {
    let start = Instant::now();

    // orgs created mid-month only have dailies from their creation day on
    let month_first = monthly.start_date.date_naive();
    let first_day = if monthly.start_date < org.created_on {
        org.created_on.date_naive()
    } else {
        month_first
    };
    let last_day = month_first + Months::new(1) - TimeDelta::days(1);

    let missing =
        planner::missing_daily_archives_in_range(pool, org, monthly.archive_type, first_day, last_day).await?;
    if !missing.is_empty() {
        return Err(ArchiveError::MissingDailyArchives { count: missing.len() }.into());
    }

    let dailies = catalog::daily_archives_in_range(
        pool,
        org,
        monthly.archive_type,
        day_start(first_day),
        day_start(last_day),
    )
    .await?;

    let mut scratch = ScratchWriter::create(monthly, Path::new(&config.temp_dir))?;
    let mut record_count: i64 = 0;

    for daily in &dailies {
        // empty days contribute no bytes but stay in the parent-link set
        if daily.record_count == 0 {
            continue;
        }

        let mut body = s3::get_archive_stream(s3_client, config, &daily.url).await?;
        let mut appender = DailyAppender::new(&mut scratch);
        while let Some(chunk) = body
            .try_next()
            .await
            .with_context(|| format!("error reading daily archive from {}", daily.url))?
        {
            appender.chunk(&chunk)?;
        }
        appender.finish(daily)?;

        record_count += daily.record_count;
    }

    // a month of empty days still gets the canonical empty archive
    let built = if record_count == 0 {
        scratch.finish_empty()?
    } else {
        scratch.finish()?
    };

    debug!(
        org_id = monthly.org_id,
        archive_type = %monthly.archive_type,
        start_date = %monthly.start_date,
        dailies = dailies.len(),
        record_count,
        file_size = built.size,
        file_hash = %built.hash,
        "completed building rollup archive"
    );

    monthly.archive_file = Some(built.path);
    monthly.size = built.size;
    monthly.hash = built.hash;
    monthly.record_count = record_count;
    monthly.build_time = start.elapsed().as_millis() as i64;
    // source rows were already purged (or will be) through the dailies
    monthly.needs_deletion = false;
    monthly.dailies = dailies;
    Ok(())
}
