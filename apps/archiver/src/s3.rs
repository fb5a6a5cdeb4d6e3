//! Object-store client and archive upload/download. Keys are deterministic
//! and content-addressed: the hash is part of the name, so re-uploading the
//! same content after a crash is idempotent and an object, once written, is
//! never modified.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::ArchiveError;
use crate::models::Archive;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const UPLOAD_ATTEMPTS: u32 = 3;

/// Endpoint actually used for requests and recorded in archive URLs;
/// disabling SSL downgrades an https endpoint to http.
fn endpoint_url(config: &Config) -> String {
    if config.s3_disable_ssl {
        config.s3_endpoint.replacen("https://", "http://", 1)
    } else {
        config.s3_endpoint.clone()
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
pub async fn build_client(config: &Config) -> S3Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "archiver-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(config.s3_region.clone()))
        .credentials_provider(credentials)
        .endpoint_url(endpoint_url(config))
        .load()
        .await;

    let conf = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(config.s3_force_path_style)
        .build();
    S3Client::from_conf(conf)
}

/// Deterministic object key for an archive:
/// `/{org}/{kind}_D{yyyy}{mm}{dd}_{hash}.jsonl.gz` for dailies,
/// `/{org}/{kind}_M{yyyy}{mm}_{hash}.jsonl.gz` for monthlies.
pub fn archive_key(archive: &Archive) -> String {
    format!(
        "/{}/{}_{}_{}.jsonl.gz",
        archive.org_id,
        archive.archive_type,
        archive.date_fragment(),
        archive.hash
    )
}

fn archive_url(config: &Config, key: &str) -> String {
    let endpoint = endpoint_url(config);
    format!("{}/{}{}", endpoint.trim_end_matches('/'), config.s3_bucket, key)
}

fn key_from_url(url: &str, bucket: &str) -> Result<String> {
    let marker = format!("/{bucket}/");
    match url.split_once(&marker) {
        Some((_, key)) => Ok(key.to_string()),
        None => bail!("unable to determine object key for URL: {url}"),
    }
}

fn is_transient<E, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_)
    )
}

/// Uploads a built archive's scratch file to its deterministic key, setting
/// the archive's URL and, when purging is enabled, flagging its source rows
/// for deletion. Transient network failures are retried with exponential
/// backoff; anything else surfaces to the caller.
pub async fn upload_archive(s3: &S3Client, config: &Config, archive: &mut Archive) -> Result<()> {
    let path = archive
        .archive_file
        .clone()
        .context("archive has no scratch file to upload")?;
    let key = archive_key(archive);

    timeout(UPLOAD_TIMEOUT, async {
        let mut attempt: u32 = 0;
        loop {
            let body = ByteStream::from_path(&path)
                .await
                .with_context(|| format!("error opening scratch file {}", path.display()))?;

            let result = s3
                .put_object()
                .bucket(&config.s3_bucket)
                .key(key.trim_start_matches('/'))
                .content_type("application/json")
                .content_encoding("gzip")
                .acl(ObjectCannedAcl::Private)
                .body(body)
                .send()
                .await;

            match result {
                Ok(_) => return Ok::<(), anyhow::Error>(()),
                Err(err) if attempt + 1 < UPLOAD_ATTEMPTS && is_transient(&err) => {
                    warn!(key = %key, attempt, error = %err, "transient upload failure, retrying");
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ArchiveError::Upload(format!("error uploading {key}: {err}")).into())
                }
            }
        }
    })
    .await
    .context("timed out uploading archive")??;

    archive.url = archive_url(config, &key);
    archive.needs_deletion = config.delete;

    debug!(
        org_id = archive.org_id,
        archive_type = %archive.archive_type,
        start_date = %archive.start_date,
        period = %archive.period,
        url = %archive.url,
        file_size = archive.size,
        file_hash = %archive.hash,
        "completed uploading archive file"
    );
    Ok(())
}

/// Opens a streaming download of an archive object previously written by
/// [`upload_archive`].
pub async fn get_archive_stream(s3: &S3Client, config: &Config, url: &str) -> Result<ByteStream> {
    let key = key_from_url(url, &config.s3_bucket)?;
    let resp = s3
        .get_object()
        .bucket(&config.s3_bucket)
        .key(&key)
        .send()
        .await
        .with_context(|| format!("error fetching archive object {url}"))?;
    Ok(resp.body)
}
