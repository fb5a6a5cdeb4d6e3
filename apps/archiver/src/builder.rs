//! Builds a single archive file: records stream from the reader through a
//! buffered gzip writer into a scratch file, with an MD5 hasher teeing the
//! compressed bytes on their way to disk. Nothing is ever materialized in
//! memory; the hash and size come straight off the stream.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{Stream, TryStreamExt};
use md5::{Digest, Md5};
use sqlx::{PgPool, Row};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::ArchiveError;
use crate::models::{Archive, Org};
use crate::readers;

/// Hard cap on the gzipped size of a single archive. Anything bigger must be
/// produced as daily archives instead.
const MAX_ARCHIVE_BYTES: i64 = 5_000_000_000;

/// The canonical zero-record archive: gzip of the empty byte sequence as the
/// platform has always written it (header with zero mtime and unknown OS, an
/// empty stored block, zero CRC and length). Existing catalog rows and object
/// keys are addressed by the hash of these exact bytes, so they are frozen;
/// gzip encoders emit other, equally valid empty streams.
pub(crate) const EMPTY_ARCHIVE: &[u8] = &[
    0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, // header
    0x01, 0x00, 0x00, 0xff, 0xff, // empty stored block
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // crc32 + input length
];

/// Writer adapter that feeds every byte it forwards into an MD5 hasher.
/// Wrapped *inside* the gzip encoder, it digests the compressed stream.
pub(crate) struct Md5Writer<W: Write> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> Md5Writer<W> {
    fn new(inner: W) -> Self {
        Md5Writer { inner, hasher: Md5::new() }
    }

    /// Returns the inner writer and the hex digest of everything written.
    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for Md5Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A scratch archive file under construction. Bytes written here are
/// buffered, gzipped and hashed on their way to disk. Dropping it before
/// [`ScratchWriter::finish`] removes the file.
pub(crate) struct ScratchWriter {
    scratch: NamedTempFile,
    writer: BufWriter<GzEncoder<Md5Writer<File>>>,
}

/// Size and hash of a finished scratch file, now persisted on disk.
pub(crate) struct BuiltFile {
    pub path: PathBuf,
    pub size: i64,
    pub hash: String,
}

impl ScratchWriter {
    pub(crate) fn create(archive: &Archive, temp_dir: &Path) -> Result<Self> {
        let prefix = format!("{}_{}_{}_", archive.archive_type, archive.org_id, archive.date_fragment());
        let scratch = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".jsonl.gz")
            .tempfile_in(temp_dir)
            .with_context(|| format!("error creating scratch file in {}", temp_dir.display()))?;

        debug!(
            org_id = archive.org_id,
            archive_type = %archive.archive_type,
            start_date = %archive.start_date,
            period = %archive.period,
            filename = %scratch.path().display(),
            "creating new archive file"
        );

        let file = scratch.reopen().context("error reopening scratch file")?;
        let writer = BufWriter::new(GzEncoder::new(Md5Writer::new(file), Compression::default()));
        Ok(ScratchWriter { scratch, writer })
    }

    pub(crate) fn write_record(&mut self, json: &str) -> io::Result<()> {
        self.writer.write_all(json.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    /// Flushes and closes the gzip stream, fsyncs, enforces the size cap,
    /// and persists the file. Any failure removes the scratch file.
    pub(crate) fn finish(mut self) -> Result<BuiltFile> {
        self.writer.flush().context("error flushing archive file")?;
        let encoder = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context("error flushing archive buffer")?;
        let md5_writer = encoder.finish().context("error closing archive gzip stream")?;
        let (file, hash) = md5_writer.finish();
        file.sync_all().context("error syncing archive file")?;

        let size = file.metadata().context("error statting archive file")?.len() as i64;
        if size > MAX_ARCHIVE_BYTES {
            return Err(ArchiveError::ArchiveTooLarge { size, cap: MAX_ARCHIVE_BYTES }.into());
        }

        let (_file, path) = self.scratch.keep().context("error persisting scratch file")?;
        Ok(BuiltFile { path, size, hash })
    }

    /// Discards whatever the encoder produced and persists the canonical
    /// empty archive instead. Used for zero-record windows, whose size and
    /// hash are frozen constants.
    pub(crate) fn finish_empty(self) -> Result<BuiltFile> {
        let ScratchWriter { scratch, writer } = self;
        drop(writer);

        let mut file = scratch.reopen().context("error reopening scratch file")?;
        file.set_len(0).context("error truncating scratch file")?;
        file.write_all(EMPTY_ARCHIVE).context("error writing empty archive")?;
        file.sync_all().context("error syncing archive file")?;

        let (_file, path) = scratch.keep().context("error persisting scratch file")?;
        Ok(BuiltFile {
            path,
            size: EMPTY_ARCHIVE.len() as i64,
            hash: hex::encode(Md5::digest(EMPTY_ARCHIVE)),
        })
    }
}

impl Write for ScratchWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Builds the archive file for a planned archive, filling in its size, hash,
/// record count, build time and scratch path.
pub async fn create_archive_file(
    pool: &PgPool,
    org: &Org,
    archive: &mut Archive,
    temp_dir: &Path,
) -> Result<()> {
    let query = readers::records_query(archive.archive_type, org, archive.start_date, archive.end_date())?;
    let records = query
        .fetch(pool)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { row.try_get::<String, _>(1).map_err(anyhow::Error::from) });

    build_archive(archive, records, temp_dir).await
}

/// Streams records into a fresh scratch file. On any error the scratch file
/// is removed; it is only persisted once fully written and fsynced.
async fn build_archive<S>(archive: &mut Archive, records: S, temp_dir: &Path) -> Result<()>
where
    S: Stream<Item = Result<String>>,
{
    let start = Instant::now();
    let mut scratch = ScratchWriter::create(archive, temp_dir)?;

    let mut record_count: i64 = 0;
    futures::pin_mut!(records);
    while let Some(record) = records.try_next().await.context("error reading record")? {
        scratch.write_record(&record)?;
        record_count += 1;
    }

    let built = if record_count == 0 {
        scratch.finish_empty()?
    } else {
        scratch.finish()?
    };

    debug!(
        org_id = archive.org_id,
        archive_type = %archive.archive_type,
        record_count,
        file_size = built.size,
        file_hash = %built.hash,
        filename = %built.path.display(),
        "completed writing archive file"
    );

    archive.archive_file = Some(built.path);
    archive.size = built.size;
    archive.hash = built.hash;
    archive.record_count = record_count;
    archive.build_time = start.elapsed().as_millis() as i64;
    Ok(())
}

/// Removes an archive's scratch file, if it still has one.
pub fn delete_scratch_file(archive: &mut Archive) -> Result<()> {
    if let Some(path) = archive.archive_file.take() {
        std::fs::remove_file(&path)
            .with_context(|| format!("error deleting scratch file: {}", path.display()))?;
        debug!(
            org_id = archive.org_id,
            archive_type = %archive.archive_type,
            filename = %path.display(),
            "deleted scratch archive file"
        );
    }
    Ok(())
}

/// Checks that the scratch directory exists, creating it if necessary, and
/// that it is actually writable.
pub fn ensure_temp_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("temp directory path cannot be empty");
    }

    if !path.exists() {
        return std::fs::create_dir_all(path)
            .with_context(|| format!("error creating temp directory {}", path.display()));
    }
    if !path.is_dir() {
        bail!("temp path '{}' is not a directory", path.display());
    }

    let probe = path.join(".archiver_probe");
    File::create(&probe).with_context(|| format!("temp directory '{}' is not writable", path.display()))?;
    std::fs::remove_file(&probe).context("error removing probe file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchivePeriod, ArchiveType, Org};
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;
    use futures::stream;
    use std::io::Read;

    fn make_org() -> Org {
        Org {
            id: 2,
            name: "Nyaruka".to_string(),
            created_on: Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(),
            is_anon: false,
            retention_days: 90,
        }
    }

    fn make_task() -> Archive {
        Archive::planned(
            &make_org(),
            ArchiveType::Message,
            ArchivePeriod::Day,
            Utc.with_ymd_and_hms(2017, 8, 12, 0, 0, 0).unwrap(),
        )
    }

    fn read_back(archive: &Archive) -> (Vec<u8>, Vec<u8>) {
        let raw = std::fs::read(archive.archive_file.as_ref().unwrap()).unwrap();
        let mut decompressed = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut decompressed).unwrap();
        (raw, decompressed)
    }

    fn gzip(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_empty_archive_is_the_canonical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = make_task();

        build_archive(&mut task, stream::iter(Vec::<Result<String>>::new()), dir.path())
            .await
            .unwrap();

        assert_eq!(task.record_count, 0);
        assert_eq!(task.size, 23);
        assert_eq!(task.hash, "f0d79988b7772c003d04a28bd7417a62");

        let (raw, decompressed) = read_back(&task);
        assert_eq!(raw, EMPTY_ARCHIVE);
        assert!(decompressed.is_empty());
    }

    const MESSAGE_RECORDS: [&str; 3] = [
        r#"{"id":1,"broadcast":null,"contact":{"uuid":"3e814add-e614-41f7-8b5d-a07f670a698f","name":"Ajodinabiff Dane"},"urn":"tel:+12067797777","channel":{"uuid":"60f2ed5b-05f2-4156-9ff0-e44e90da1b85","name":"Channel 2"},"direction":"in","type":"inbox","status":"handled","visibility":"visible","text":"message 1","attachments":[],"labels":[],"created_on":"2017-08-12T19:11:59.890662+00:00","modified_on":"2017-08-12T19:11:59.890662+00:00","sent_on":null}"#,
        r#"{"id":2,"broadcast":null,"contact":{"uuid":"3e814add-e614-41f7-8b5d-a07f670a698f","name":"Ajodinabiff Dane"},"urn":"tel:+12067797777","channel":{"uuid":"60f2ed5b-05f2-4156-9ff0-e44e90da1b85","name":"Channel 2"},"direction":"out","type":"inbox","status":"sent","visibility":"visible","text":"message 2","attachments":[],"labels":[{"uuid":"1d9e3188-b74b-4ae0-a166-0de31aedb34a","name":"Label 1"}],"created_on":"2017-08-12T19:13:59.890662+00:00","modified_on":"2017-08-12T19:13:59.890662+00:00","sent_on":"2017-08-12T19:14:00.123456+00:00","response_to":1}"#,
        r#"{"id":3,"broadcast":null,"contact":{"uuid":"3e814add-e614-41f7-8b5d-a07f670a698f","name":"Ajodinabiff Dane"},"urn":"tel:+12067797777","channel":{"uuid":"60f2ed5b-05f2-4156-9ff0-e44e90da1b85","name":"Channel 2"},"direction":"in","type":"inbox","status":"handled","visibility":"visible","text":"message 3","attachments":[{"content_type":"image/png","url":"https://foo.bar/image1.png"},{"content_type":"image/png","url":"https://foo.bar/image2.png"}],"labels":[],"created_on":"2017-08-12T19:19:59.890662+00:00","modified_on":"2017-08-12T19:19:59.890662+00:00","sent_on":null}"#,
    ];

    const RUN_RECORDS: [&str; 2] = [
        r#"{"id":1,"uuid":"4ced1260-9cfe-4b7f-81dd-b637108f15b9","flow":{"uuid":"6639286a-9120-45d4-aa39-03ae3942a4a6","name":"Flow 1"},"contact":{"uuid":"3e814add-e614-41f7-8b5d-a07f670a698f","name":"Ajodinabiff Dane"},"responded":true,"path":[{"node":"10896d63-8df7-4022-88dd-a9d93edf355b","time":"2017-08-12T13:07:24.049815+00:00"}],"values":{"agree":{"category":"Strongly agree","name":"Do you agree?","node":"084c8cf1-715d-4d0a-b38d-a616ed74e638","time":"2017-05-03T12:25:21.714339+00:00","value":"A"}},"events":[],"created_on":"2017-08-12T07:11:25.537251+00:00","modified_on":"2017-08-12T21:11:25.537251+00:00","exited_on":"2017-08-12T21:11:25.537251+00:00","exit_type":"completed","submitted_by":null}"#,
        r#"{"id":2,"uuid":"7d68469c-0494-498a-bdf3-bac68321fd6d","flow":{"uuid":"6639286a-9120-45d4-aa39-03ae3942a4a6","name":"Flow 1"},"contact":{"uuid":"3e814add-e614-41f7-8b5d-a07f670a698f","name":"Ajodinabiff Dane"},"responded":true,"path":[{"node":"accbc6e2-b0df-46cd-9a76-bff0fdf4d753","time":"2017-08-12T13:07:24.049815+00:00"}],"values":{},"events":[],"created_on":"2017-08-12T07:11:30.537251+00:00","modified_on":"2017-08-12T21:11:30.537251+00:00","exited_on":"2017-08-12T21:11:30.537251+00:00","exit_type":"expired","submitted_by":null}"#,
    ];

    async fn build_fixture(records: &[&str], archive_type: ArchiveType) -> Archive {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Archive::planned(
            &make_org(),
            archive_type,
            ArchivePeriod::Day,
            Utc.with_ymd_and_hms(2017, 8, 12, 0, 0, 0).unwrap(),
        );
        let rows: Vec<Result<String>> = records.iter().map(|r| Ok(r.to_string())).collect();
        build_archive(&mut task, stream::iter(rows), dir.path()).await.unwrap();

        // read everything back before the temp dir goes away
        let (raw, decompressed) = read_back(&task);
        let expected_content: Vec<u8> = records
            .iter()
            .flat_map(|r| r.bytes().chain(std::iter::once(b'\n')))
            .collect();
        assert_eq!(decompressed, expected_content);

        let expected_gz = gzip(&expected_content);
        assert_eq!(task.size, expected_gz.len() as i64);
        assert_eq!(task.hash, hex::encode(Md5::digest(&expected_gz)));
        assert_eq!(raw, expected_gz);
        task
    }

    #[tokio::test]
    async fn test_message_day_archive_fixture() {
        let task = build_fixture(&MESSAGE_RECORDS, ArchiveType::Message).await;
        assert_eq!(task.record_count, 3);
    }

    #[tokio::test]
    async fn test_run_day_archive_fixture() {
        let task = build_fixture(&RUN_RECORDS, ArchiveType::Run).await;
        assert_eq!(task.record_count, 2);
    }

    #[tokio::test]
    async fn test_records_are_newline_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = make_task();
        let rows = vec![
            Ok(r#"{"id":1,"text":"hello"}"#.to_string()),
            Ok(r#"{"id":2,"text":"world"}"#.to_string()),
            Ok(r#"{"id":3,"text":"goodbye"}"#.to_string()),
        ];

        build_archive(&mut task, stream::iter(rows), dir.path()).await.unwrap();

        assert_eq!(task.record_count, 3);
        let (raw, decompressed) = read_back(&task);
        assert_eq!(
            String::from_utf8(decompressed).unwrap(),
            "{\"id\":1,\"text\":\"hello\"}\n{\"id\":2,\"text\":\"world\"}\n{\"id\":3,\"text\":\"goodbye\"}\n"
        );
        assert_eq!(task.size, raw.len() as i64);
        assert_eq!(task.hash, hex::encode(Md5::digest(&raw)));
    }

    #[tokio::test]
    async fn test_rebuild_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let rows = || {
            stream::iter(vec![
                Ok(r#"{"id":1}"#.to_string()),
                Ok(r#"{"id":2}"#.to_string()),
            ])
        };

        let mut first = make_task();
        build_archive(&mut first, rows(), dir.path()).await.unwrap();
        let mut second = make_task();
        build_archive(&mut second, rows(), dir.path()).await.unwrap();

        assert_eq!(first.size, second.size);
        assert_eq!(first.hash, second.hash);
        assert_ne!(first.archive_file, second.archive_file);
    }

    #[tokio::test]
    async fn test_reader_error_removes_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = make_task();
        let rows = vec![
            Ok(r#"{"id":1}"#.to_string()),
            Err(anyhow::anyhow!("connection reset")),
        ];

        let result = build_archive(&mut task, stream::iter(rows), dir.path()).await;

        assert!(result.is_err());
        assert!(task.archive_file.is_none());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_md5_writer_digests_what_it_forwards() {
        let mut writer = Md5Writer::new(Vec::new());
        writer.write_all(b"some archive bytes").unwrap();
        let (inner, hash) = writer.finish();

        assert_eq!(inner, b"some archive bytes");
        assert_eq!(hash, hex::encode(Md5::digest(b"some archive bytes")));
    }

    #[test]
    fn test_ensure_temp_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("scratch/archives");

        ensure_temp_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // idempotent on an existing, writable directory
        ensure_temp_dir(&nested).unwrap();
    }

    #[test]
    fn test_ensure_temp_dir_rejects_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        std::fs::write(&file_path, b"x").unwrap();

        assert!(ensure_temp_dir(&file_path).is_err());
    }
}
