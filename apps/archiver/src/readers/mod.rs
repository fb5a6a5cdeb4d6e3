//! Streaming readers over the operational tables. Each reader is a single
//! query producing one JSON object per source record, rendered by Postgres
//! itself so the byte shape of a record never depends on client-side
//! serialization. Rows stream through a server-side cursor; memory stays
//! O(1) in the number of rows.
//!
//! Row ordering is the hash contract: archives are content-addressed, so the
//! reader's ORDER BY, the JSON key order, and the trailing newline policy are
//! all frozen.

mod messages;
mod runs;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use crate::errors::ArchiveError;
use crate::models::{ArchiveType, Org};

/// A prepared record query for one archive window. Each result row is
/// `(exit_time, json_text)`; callers append a newline after every record.
pub fn records_query(
    archive_type: ArchiveType,
    org: &Org,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Query<'static, Postgres, PgArguments>, ArchiveError> {
    let sql = match archive_type {
        ArchiveType::Message => messages::LOOKUP_MESSAGES,
        ArchiveType::Run => runs::LOOKUP_FLOW_RUNS,
        ArchiveType::Session => return Err(ArchiveError::UnknownArchiveType(archive_type)),
    };

    Ok(sqlx::query(sql).bind(org.id).bind(org.is_anon).bind(start).bind(end))
}
