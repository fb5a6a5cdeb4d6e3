use thiserror::Error;

use crate::models::ArchiveType;

/// Failures with specific recovery or reporting semantics. Everything else
/// travels as `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An archive's gzipped file exceeded the hard size cap. The caller
    /// should be producing daily archives instead.
    #[error("archive too large ({size} bytes), must be smaller than {cap} bytes, build dailies if possible")]
    ArchiveTooLarge { size: i64, cap: i64 },

    /// A rollup cannot be built because the month is not fully covered.
    #[error("missing {count} daily archives")]
    MissingDailyArchives { count: usize },

    /// A downloaded daily's content no longer matches its catalog hash.
    #[error("daily archive hash mismatch for {url}: expected {expected}, got {actual}")]
    DailyHashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Inserting a monthly archive must update the rollup_id of exactly its
    /// listed dailies; any other count aborts the transaction.
    #[error("rollup child update mismatch: expected {expected} rows, updated {updated}")]
    RollupChildMismatch { expected: usize, updated: u64 },

    /// A code path was handed an archive type it cannot process.
    #[error("unknown archive type: {0}")]
    UnknownArchiveType(ArchiveType),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
