//! Audit counter rows (`aud_datum`)

use crate::error::Result;
use crate::rollup::buckets::hour_start;
use crate::store::db::{time_col, to_millis, uuid_col, DatumStore};
use crate::store::queue::level_col;
use crate::store::types::{AggregateLevel, AuditDatum, StreamId, TimeRange};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const AUDIT_COLUMNS: &str = "stream_id, agg_kind, ts_start, datum_count, prop_count, \
     datum_q_count, datum_hourly_count, datum_daily_count, datum_monthly_count";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditDatum> {
    Ok(AuditDatum {
        stream_id: uuid_col(row, 0)?,
        level: level_col(row, 1)?,
        bucket_start: time_col(row, 2)?,
        datum_count: row.get(3)?,
        prop_count: row.get(4)?,
        datum_query_count: row.get(5)?,
        datum_hourly_count: row.get(6)?,
        datum_daily_count: row.get(7)?,
        datum_monthly_count: row.get(8)?,
    })
}

/// Add to the Hour counters of the hour containing `now`
///
/// Returns true when this call created the hour row.
pub fn increment_hourly(
    conn: &Connection,
    stream_id: StreamId,
    now: DateTime<Utc>,
    datums: i64,
    props: i64,
    queried: i64,
) -> Result<bool> {
    let hour = to_millis(hour_start(now));
    let level = AggregateLevel::Hour.as_str();

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM aud_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start = ?3)",
        params![stream_id.to_string(), level, hour],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO aud_datum (stream_id, agg_kind, ts_start, datum_count, prop_count, datum_q_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(stream_id, agg_kind, ts_start) DO UPDATE SET
            datum_count = datum_count + excluded.datum_count,
            prop_count = prop_count + excluded.prop_count,
            datum_q_count = datum_q_count + excluded.datum_q_count",
        params![stream_id.to_string(), level, hour, datums, props, queried],
    )?;

    Ok(!exists)
}

pub fn load_audit(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    bucket_start: DateTime<Utc>,
) -> Result<Option<AuditDatum>> {
    let sql = format!(
        "SELECT {} FROM aud_datum WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start = ?3",
        AUDIT_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![stream_id.to_string(), level.as_str(), to_millis(bucket_start)],
            audit_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Audit rows at `level`, optionally limited to `range`, ascending
pub fn audit_rows(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    range: Option<TimeRange>,
) -> Result<Vec<AuditDatum>> {
    let (start, end) = match range {
        Some(r) => (to_millis(r.start), to_millis(r.end)),
        None => (i64::MIN, i64::MAX),
    };
    let sql = format!(
        "SELECT {} FROM aud_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4
         ORDER BY ts_start",
        AUDIT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![stream_id.to_string(), level.as_str(), start, end],
        audit_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Replace a rolled-up audit row
pub fn upsert_audit(conn: &Connection, audit: &AuditDatum) -> Result<()> {
    conn.execute(
        "INSERT INTO aud_datum (stream_id, agg_kind, ts_start, datum_count, prop_count,
            datum_q_count, datum_hourly_count, datum_daily_count, datum_monthly_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(stream_id, agg_kind, ts_start) DO UPDATE SET
            datum_count = excluded.datum_count,
            prop_count = excluded.prop_count,
            datum_q_count = excluded.datum_q_count,
            datum_hourly_count = excluded.datum_hourly_count,
            datum_daily_count = excluded.datum_daily_count,
            datum_monthly_count = excluded.datum_monthly_count",
        params![
            audit.stream_id.to_string(),
            audit.level.as_str(),
            to_millis(audit.bucket_start),
            audit.datum_count,
            audit.prop_count,
            audit.datum_query_count,
            audit.datum_hourly_count,
            audit.datum_daily_count,
            audit.datum_monthly_count,
        ],
    )?;
    Ok(())
}

pub fn delete_audit(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    bucket_start: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "DELETE FROM aud_datum WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start = ?3",
        params![stream_id.to_string(), level.as_str(), to_millis(bucket_start)],
    )?;
    Ok(())
}

impl DatumStore {
    /// Audit rows of one level; `range` filters on bucket start
    pub fn query_audit(
        &self,
        stream_id: StreamId,
        level: AggregateLevel,
        range: Option<TimeRange>,
    ) -> Result<Vec<AuditDatum>> {
        let conn = self.conn()?;
        audit_rows(&conn, stream_id, level, range)
    }
}
