use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, Utc};
use sqlx::FromRow;

use crate::models::Org;

/// Kind of record an archive holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum ArchiveType {
    Message,
    Run,
    /// Reserved. No reader produces sessions; hitting this in a build or
    /// delete path is an error.
    Session,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Message => "message",
            ArchiveType::Run => "run",
            ArchiveType::Session => "session",
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" | "msg" => Ok(ArchiveType::Message),
            "run" => Ok(ArchiveType::Run),
            "session" => Ok(ArchiveType::Session),
            other => Err(format!("unknown archive type '{other}'")),
        }
    }
}

/// Span of data an archive covers: a UTC day or a UTC calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum ArchivePeriod {
    #[sqlx(rename = "D")]
    Day,
    #[sqlx(rename = "M")]
    Month,
}

impl fmt::Display for ArchivePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchivePeriod::Day => "D",
            ArchivePeriod::Month => "M",
        })
    }
}

/// One catalog row plus its backing object.
///
/// The catalog table is the single source of truth for what has been
/// archived; the object store and scratch disk are caches of its state.
#[derive(Debug, Clone, FromRow)]
pub struct Archive {
    pub id: i32,
    pub archive_type: ArchiveType,
    pub org_id: i32,
    pub created_on: DateTime<Utc>,

    /// Midnight UTC of the first day covered. For monthly archives this is
    /// the first of the month.
    pub start_date: DateTime<Utc>,
    pub period: ArchivePeriod,

    pub record_count: i64,
    /// Byte size of the gzipped file.
    pub size: i64,
    /// MD5 hex digest of the gzipped file contents.
    pub hash: String,
    pub url: String,
    pub build_time: i64,

    pub needs_deletion: bool,
    pub deleted_on: Option<DateTime<Utc>>,
    /// Back-reference to the monthly archive that superseded this daily.
    pub rollup_id: Option<i32>,

    /// Scratch file on local disk, present only between build and cleanup.
    #[sqlx(skip)]
    pub archive_file: Option<PathBuf>,
    /// For a monthly rollup, the daily archives it was assembled from.
    #[sqlx(skip)]
    pub dailies: Vec<Archive>,
}

impl Archive {
    /// A planned archive: computed by the planner but not yet built.
    pub fn planned(
        org: &Org,
        archive_type: ArchiveType,
        period: ArchivePeriod,
        start_date: DateTime<Utc>,
    ) -> Self {
        Archive {
            id: 0,
            archive_type,
            org_id: org.id,
            created_on: Utc::now(),
            start_date,
            period,
            record_count: 0,
            size: 0,
            hash: String::new(),
            url: String::new(),
            build_time: 0,
            needs_deletion: false,
            deleted_on: None,
            rollup_id: None,
            archive_file: None,
            dailies: Vec::new(),
        }
    }

    /// Exclusive end of the window this archive covers.
    pub fn end_date(&self) -> DateTime<Utc> {
        match self.period {
            ArchivePeriod::Day => self.start_date + chrono::Duration::days(1),
            ArchivePeriod::Month => self.start_date + Months::new(1),
        }
    }

    /// Date fragment used in scratch-file and object-store names:
    /// `D20170810` for a daily, `M201708` for a monthly.
    pub fn date_fragment(&self) -> String {
        let d = self.start_date;
        match self.period {
            ArchivePeriod::Day => format!("D{:04}{:02}{:02}", d.year(), d.month(), d.day()),
            ArchivePeriod::Month => format!("M{:04}{:02}", d.year(), d.month()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_org() -> Org {
        Org {
            id: 3,
            name: "Nyaruka".to_string(),
            created_on: Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(),
            is_anon: false,
            retention_days: 90,
        }
    }

    #[test]
    fn test_daily_end_date() {
        let org = make_org();
        let start = Utc.with_ymd_and_hms(2017, 8, 12, 0, 0, 0).unwrap();
        let a = Archive::planned(&org, ArchiveType::Message, ArchivePeriod::Day, start);
        assert_eq!(a.end_date(), Utc.with_ymd_and_hms(2017, 8, 13, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_end_date_spans_calendar_month() {
        let org = make_org();
        let start = Utc.with_ymd_and_hms(2017, 12, 1, 0, 0, 0).unwrap();
        let a = Archive::planned(&org, ArchiveType::Run, ArchivePeriod::Month, start);
        assert_eq!(a.end_date(), Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_date_fragments() {
        let org = make_org();
        let daily = Archive::planned(
            &org,
            ArchiveType::Message,
            ArchivePeriod::Day,
            Utc.with_ymd_and_hms(2017, 8, 2, 0, 0, 0).unwrap(),
        );
        assert_eq!(daily.date_fragment(), "D20170802");

        let monthly = Archive::planned(
            &org,
            ArchiveType::Message,
            ArchivePeriod::Month,
            Utc.with_ymd_and_hms(2017, 8, 1, 0, 0, 0).unwrap(),
        );
        assert_eq!(monthly.date_fragment(), "M201708");
    }

    #[test]
    fn test_archive_type_parsing() {
        assert_eq!("message".parse::<ArchiveType>().unwrap(), ArchiveType::Message);
        assert_eq!("msg".parse::<ArchiveType>().unwrap(), ArchiveType::Message);
        assert_eq!("run".parse::<ArchiveType>().unwrap(), ArchiveType::Run);
        assert!("broadcast".parse::<ArchiveType>().is_err());
    }
}
