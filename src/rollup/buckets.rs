//! Bucket arithmetic
//!
//! Hour, day and month buckets are aligned in UTC. Cyclic levels map a
//! bucket onto a synthetic timestamp in 2001 so rows sharing a label
//! (every Tuesday, every 14:00 in summer) share one aggregate key.

use crate::store::types::{AggregateLevel, TimeRange};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use std::time::UNIX_EPOCH;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

/// Monday 2001-01-01T00:00:00Z
const CYCLIC_BASE_SECS: i64 = 978_307_200;
/// 2001-04-01, 2001-07-01, 2001-10-01 (UTC midnight)
const SPRING_BASE_SECS: i64 = 986_083_200;
const SUMMER_BASE_SECS: i64 = 993_945_600;
const AUTUMN_BASE_SECS: i64 = 1_001_894_400;

/// Key used for the single running-total queue row per stream
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(UNIX_EPOCH)
}

fn truncate(ts: DateTime<Utc>, unit_ms: i64) -> DateTime<Utc> {
    ts - Duration::milliseconds(ts.timestamp_millis().rem_euclid(unit_ms))
}

pub fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate(ts, HOUR_MS)
}

pub fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate(ts, DAY_MS)
}

pub fn month_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    day_start(ts) - Duration::days(i64::from(ts.day0()))
}

fn next_month_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    month_start(month_start(ts) + Duration::days(32))
}

/// Bucket key of `ts` at `level`
pub fn bucket_start(level: AggregateLevel, ts: DateTime<Utc>) -> DateTime<Utc> {
    match level {
        AggregateLevel::Hour => hour_start(ts),
        AggregateLevel::Day => day_start(ts),
        AggregateLevel::Month => month_start(ts),
        AggregateLevel::RunningTotal => epoch(),
        _ => cyclic_key(ts, level),
    }
}

/// `[start, end)` of a calendar bucket; `None` for running-total and cyclic levels
pub fn bucket_range(level: AggregateLevel, start: DateTime<Utc>) -> Option<TimeRange> {
    match level {
        AggregateLevel::Hour => Some(TimeRange::new(start, start + Duration::hours(1))),
        AggregateLevel::Day => Some(TimeRange::new(start, start + Duration::days(1))),
        AggregateLevel::Month => Some(TimeRange::new(start, next_month_start(start))),
        _ => None,
    }
}

fn season_base(ts: DateTime<Utc>) -> i64 {
    match ts.month() {
        3..=5 => SPRING_BASE_SECS,
        6..=8 => SUMMER_BASE_SECS,
        9..=11 => AUTUMN_BASE_SECS,
        _ => CYCLIC_BASE_SECS,
    }
}

fn weekday_offset(day: Weekday) -> i64 {
    i64::from(day.num_days_from_monday())
}

/// Synthetic 2001 timestamp labelling the cyclic bucket of `ts`
///
/// Calendar levels pass through to `bucket_start`.
pub fn cyclic_key(ts: DateTime<Utc>, level: AggregateLevel) -> DateTime<Utc> {
    let (base_secs, offset) = match level {
        AggregateLevel::DayOfWeek => (CYCLIC_BASE_SECS, Duration::days(weekday_offset(ts.weekday()))),
        AggregateLevel::HourOfDay => (CYCLIC_BASE_SECS, Duration::hours(i64::from(ts.hour()))),
        AggregateLevel::SeasonalDayOfWeek => {
            (season_base(ts), Duration::days(weekday_offset(ts.weekday())))
        }
        AggregateLevel::SeasonalHourOfDay => (season_base(ts), Duration::hours(i64::from(ts.hour()))),
        _ => return bucket_start(level, ts),
    };
    epoch() + Duration::seconds(base_secs) + offset
}

/// Calendar fields every bucket under one cyclic key shares
///
/// Lets stores select a key's children by hour, weekday and season instead
/// of scanning the whole level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleFilter {
    pub hour: Option<u32>,
    /// 0 = Sunday, matching SQLite's `strftime('%w')`
    pub weekday: Option<u32>,
    pub months: Option<[u32; 3]>,
}

fn season_months(key: DateTime<Utc>) -> [u32; 3] {
    match key.month() {
        4 => [3, 4, 5],
        7 => [6, 7, 8],
        10 => [9, 10, 11],
        _ => [12, 1, 2],
    }
}

impl CycleFilter {
    /// Filter for the children of `key` at a cyclic `level`; `None` for calendar levels
    pub fn for_key(key: DateTime<Utc>, level: AggregateLevel) -> Option<Self> {
        let hour = Some(key.hour());
        let weekday = Some(key.weekday().num_days_from_sunday());
        let filter = match level {
            AggregateLevel::HourOfDay => CycleFilter { hour, ..Default::default() },
            AggregateLevel::DayOfWeek => CycleFilter { weekday, ..Default::default() },
            AggregateLevel::SeasonalHourOfDay => CycleFilter {
                hour,
                months: Some(season_months(key)),
                ..Default::default()
            },
            AggregateLevel::SeasonalDayOfWeek => CycleFilter {
                weekday,
                months: Some(season_months(key)),
                ..Default::default()
            },
            _ => return None,
        };
        Some(filter)
    }
}

/// Start of the current local day, as a UTC instant
///
/// Running totals include everything strictly before this cutoff.
pub fn running_total_cutoff(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&local_midnight) - Duration::seconds(i64::from(offset.local_minus_utc()))
}
