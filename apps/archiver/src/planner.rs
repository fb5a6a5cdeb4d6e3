//! Decides which archives are missing for an org. The interesting part is a
//! pure computation over the org's catalog snapshot; thin async wrappers
//! fetch the snapshot and wrap the results as planned archives.
//!
//! The retention rule is conservative: a day or month becomes archivable only
//! once every instant it covers is older than the retention horizon.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;

use crate::catalog;
use crate::models::{Archive, ArchivePeriod, ArchiveType, Org};

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn month_first(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Days already covered by the catalog: every daily start date plus every
/// calendar day enclosed by a monthly archive.
fn covered_days(existing: &[Archive]) -> HashSet<NaiveDate> {
    let mut covered = HashSet::new();
    for archive in existing {
        match archive.period {
            ArchivePeriod::Day => {
                covered.insert(archive.start_date.date_naive());
            }
            ArchivePeriod::Month => {
                let first = archive.start_date.date_naive();
                let next_month = first + Months::new(1);
                let mut day = first;
                while day < next_month {
                    covered.insert(day);
                    day = day + Duration::days(1);
                }
            }
        }
    }
    covered
}

/// Missing daily starts in `[start, end]` (both inclusive), ascending.
pub fn missing_daily_starts_in_range(
    start: NaiveDate,
    end: NaiveDate,
    existing: &[Archive],
) -> Vec<DateTime<Utc>> {
    let covered = covered_days(existing);
    let mut missing = Vec::new();
    let mut day = start;
    while day <= end {
        if !covered.contains(&day) {
            missing.push(midnight(day));
        }
        day = day + Duration::days(1);
    }
    missing
}

/// Missing daily starts for an org: from the day it was created through the
/// most recent day whose every instant is past the retention horizon.
pub fn missing_daily_starts(org: &Org, now: DateTime<Utc>, existing: &[Archive]) -> Vec<DateTime<Utc>> {
    let start = org.created_on.date_naive();
    let end = now.date_naive() - Duration::days(org.retention_days);
    if start > end {
        return Vec::new();
    }
    missing_daily_starts_in_range(start, end, existing)
}

/// Missing monthly starts for an org: every month-start from the org's
/// creation month up to (exclusive) the month containing the retention
/// horizon, minus months already archived monthly.
pub fn missing_monthly_starts(org: &Org, now: DateTime<Utc>, existing: &[Archive]) -> Vec<DateTime<Utc>> {
    let archived_months: HashSet<NaiveDate> = existing
        .iter()
        .filter(|a| a.period == ArchivePeriod::Month)
        .map(|a| a.start_date.date_naive())
        .collect();

    let horizon = month_first((now - Duration::days(org.retention_days)).date_naive());
    let mut month = month_first(org.created_on.date_naive());

    let mut missing = Vec::new();
    while month < horizon {
        if !archived_months.contains(&month) {
            missing.push(midnight(month));
        }
        month = month + Months::new(1);
    }
    missing
}

/// Computes the missing daily archives for an org as planned archives.
pub async fn missing_daily_archives(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let existing = catalog::list_archives(pool, org, archive_type).await?;
    Ok(missing_daily_starts(org, now, &existing)
        .into_iter()
        .map(|start| Archive::planned(org, archive_type, ArchivePeriod::Day, start))
        .collect())
}

/// Computes the missing daily archives within a date range (inclusive on
/// both sides), used to check a month's coverage before rolling it up.
pub async fn missing_daily_archives_in_range(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Archive>> {
    let existing = catalog::list_archives(pool, org, archive_type).await?;
    Ok(missing_daily_starts_in_range(start, end, &existing)
        .into_iter()
        .map(|day| Archive::planned(org, archive_type, ArchivePeriod::Day, day))
        .collect())
}

/// Computes the missing monthly archives for an org as planned archives.
pub async fn missing_monthly_archives(
    pool: &PgPool,
    org: &Org,
    archive_type: ArchiveType,
    now: DateTime<Utc>,
) -> Result<Vec<Archive>> {
    let existing = catalog::list_archives(pool, org, archive_type).await?;
    Ok(missing_monthly_starts(org, now, &existing)
        .into_iter()
        .map(|start| Archive::planned(org, archive_type, ArchivePeriod::Month, start))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn make_org(created_on: DateTime<Utc>, retention_days: i64) -> Org {
        Org {
            id: 2,
            name: "Nyaruka".to_string(),
            created_on,
            is_anon: false,
            retention_days,
        }
    }

    fn make_archive(period: ArchivePeriod, year: i32, month: u32, day: u32) -> Archive {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap(), 90);
        Archive::planned(
            &org,
            ArchiveType::Message,
            period,
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 1, 8, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_new_org_has_no_missing_dailies() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 11, 10, 19, 11, 59).unwrap(), 90);
        assert!(missing_daily_starts(&org, now(), &[]).is_empty());
    }

    #[test]
    fn test_missing_dailies_with_empty_catalog() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let missing = missing_daily_starts(&org, now(), &[]);

        // 2017-08-10 through 2017-10-10, both archivable
        assert_eq!(missing.len(), 62);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        assert_eq!(missing[61], Utc.with_ymd_and_hms(2017, 10, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_existing_daily_is_skipped() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let existing = vec![make_archive(ArchivePeriod::Day, 2017, 10, 8)];
        let missing = missing_daily_starts(&org, now(), &existing);

        assert_eq!(missing.len(), 61);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        assert_eq!(missing[60], Utc.with_ymd_and_hms(2017, 10, 10, 0, 0, 0).unwrap());
        assert!(!missing.contains(&Utc.with_ymd_and_hms(2017, 10, 8, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_monthly_archive_covers_its_days() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let existing = vec![
            make_archive(ArchivePeriod::Day, 2017, 8, 10),
            make_archive(ArchivePeriod::Month, 2017, 9, 1),
        ];
        let missing = missing_daily_starts(&org, now(), &existing);

        // 21 days left in August, 10 in October
        assert_eq!(missing.len(), 31);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 8, 11, 0, 0, 0).unwrap());
        assert_eq!(missing[21], Utc.with_ymd_and_hms(2017, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(missing[30], Utc.with_ymd_and_hms(2017, 10, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_longer_retention_leaves_nothing_archivable() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 200);
        assert!(missing_daily_starts(&org, now(), &[]).is_empty());
    }

    #[test]
    fn test_short_retention_opens_recent_days() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 11, 10, 19, 11, 59).unwrap(), 2);
        let missing = missing_daily_starts(&org, now(), &[]);

        assert_eq!(missing.len(), 58);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 11, 10, 0, 0, 0).unwrap());
        assert_eq!(missing[21], Utc.with_ymd_and_hms(2017, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(missing[30], Utc.with_ymd_and_hms(2017, 12, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_months_with_empty_catalog() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let missing = missing_monthly_starts(&org, now(), &[]);

        // horizon is 2017-10-10, so October itself is not yet fully past it
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 8, 1, 0, 0, 0).unwrap());
        assert_eq!(missing[1], Utc.with_ymd_and_hms(2017, 9, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_months_skips_archived_month() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let existing = vec![make_archive(ArchivePeriod::Month, 2017, 9, 1)];
        let missing = missing_monthly_starts(&org, now(), &existing);

        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0], Utc.with_ymd_and_hms(2017, 8, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_months_for_new_org() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 11, 10, 19, 11, 59).unwrap(), 90);
        assert!(missing_monthly_starts(&org, now(), &[]).is_empty());
    }

    #[test]
    fn test_missing_and_covered_partition_the_eligible_range() {
        let org = make_org(Utc.with_ymd_and_hms(2017, 8, 10, 21, 30, 0).unwrap(), 90);
        let existing = vec![
            make_archive(ArchivePeriod::Day, 2017, 8, 15),
            make_archive(ArchivePeriod::Day, 2017, 10, 2),
            make_archive(ArchivePeriod::Month, 2017, 9, 1),
        ];
        let missing: HashSet<NaiveDate> = missing_daily_starts(&org, now(), &existing)
            .into_iter()
            .map(|d| d.date_naive())
            .collect();
        let covered = covered_days(&existing);

        let mut day = org.created_on.date_naive();
        let end = now().date_naive() - Duration::days(org.retention_days);
        while day <= end {
            // every eligible day is exactly one of missing or covered
            assert_ne!(missing.contains(&day), covered.contains(&day), "day {day}");
            day = day + Duration::days(1);
        }
        // and nothing missing is covered
        assert!(missing.is_disjoint(&covered));
    }

    #[test]
    fn test_range_check_for_a_fully_built_month() {
        let sept: Vec<Archive> = (1..=30).map(|d| make_archive(ArchivePeriod::Day, 2017, 9, d)).collect();
        let start = NaiveDate::from_ymd_opt(2017, 9, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2017, 9, 30).unwrap();
        assert!(missing_daily_starts_in_range(start, end, &sept).is_empty());

        // drop one day and it shows up
        let partial = &sept[1..];
        let missing = missing_daily_starts_in_range(start, end, partial);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].date_naive().day(), 1);
    }
}
