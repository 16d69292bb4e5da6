//! Aggregate rows (`agg_datum`)

use crate::error::Result;
use crate::rollup::buckets::CycleFilter;
use crate::store::db::{json_col, time_col, to_millis, uuid_col, DatumStore};
use crate::store::queue::level_col;
use crate::store::types::{AggregateDatum, AggregateLevel, StreamId, TimeRange};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const AGG_COLUMNS: &str = "stream_id, agg_kind, ts_start, data_i, stat_i, data_a, read_a";

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<AggregateDatum> {
    Ok(AggregateDatum {
        stream_id: uuid_col(row, 0)?,
        level: level_col(row, 1)?,
        timestamp: time_col(row, 2)?,
        instantaneous: json_col(row, 3)?,
        instantaneous_stats: json_col(row, 4)?,
        accumulating: json_col(row, 5)?,
        accumulating_stats: json_col(row, 6)?,
    })
}

fn bounds(range: Option<TimeRange>) -> (i64, i64) {
    match range {
        Some(r) => (to_millis(r.start), to_millis(r.end)),
        None => (i64::MIN, i64::MAX),
    }
}

pub fn load_aggregate(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    timestamp: DateTime<Utc>,
) -> Result<Option<AggregateDatum>> {
    let sql = format!(
        "SELECT {} FROM agg_datum WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start = ?3",
        AGG_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![stream_id.to_string(), level.as_str(), to_millis(timestamp)],
            aggregate_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Aggregates at `level` keyed inside `range` (all of them when `None`), ascending
pub fn aggregates_in_range(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    range: Option<TimeRange>,
) -> Result<Vec<AggregateDatum>> {
    let (start, end) = bounds(range);
    let sql = format!(
        "SELECT {} FROM agg_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4
         ORDER BY ts_start",
        AGG_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![stream_id.to_string(), level.as_str(), start, end],
        aggregate_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Aggregates at `level` whose keys fall on the calendar fields of `filter`, ascending
pub fn aggregates_on_cycle(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    filter: CycleFilter,
) -> Result<Vec<AggregateDatum>> {
    let sql = format!(
        "SELECT {} FROM agg_datum
         WHERE stream_id = ?1 AND agg_kind = ?2
           AND (?3 IS NULL OR CAST(strftime('%H', ts_start / 1000, 'unixepoch') AS INTEGER) = ?3)
           AND (?4 IS NULL OR CAST(strftime('%w', ts_start / 1000, 'unixepoch') AS INTEGER) = ?4)
           AND (?5 IS NULL OR CAST(strftime('%m', ts_start / 1000, 'unixepoch') AS INTEGER) IN (?5, ?6, ?7))
         ORDER BY ts_start",
        AGG_COLUMNS
    );
    let [m0, m1, m2] = match filter.months {
        Some(months) => months.map(Some),
        None => [None; 3],
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![
            stream_id.to_string(),
            level.as_str(),
            filter.hour,
            filter.weekday,
            m0,
            m1,
            m2
        ],
        aggregate_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_in_range(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    range: Option<TimeRange>,
) -> Result<i64> {
    let (start, end) = bounds(range);
    let count = conn.query_row(
        "SELECT COUNT(*) FROM agg_datum
         WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start >= ?3 AND ts_start < ?4",
        params![stream_id.to_string(), level.as_str(), start, end],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn upsert_aggregate(conn: &Connection, agg: &AggregateDatum) -> Result<()> {
    conn.execute(
        "INSERT INTO agg_datum (stream_id, agg_kind, ts_start, data_i, stat_i, data_a, read_a)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(stream_id, agg_kind, ts_start) DO UPDATE SET
            data_i = excluded.data_i,
            stat_i = excluded.stat_i,
            data_a = excluded.data_a,
            read_a = excluded.read_a",
        params![
            agg.stream_id.to_string(),
            agg.level.as_str(),
            to_millis(agg.timestamp),
            serde_json::to_string(&agg.instantaneous)?,
            serde_json::to_string(&agg.instantaneous_stats)?,
            serde_json::to_string(&agg.accumulating)?,
            serde_json::to_string(&agg.accumulating_stats)?,
        ],
    )?;
    Ok(())
}

pub fn delete_aggregate(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    timestamp: DateTime<Utc>,
) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM agg_datum WHERE stream_id = ?1 AND agg_kind = ?2 AND ts_start = ?3",
        params![stream_id.to_string(), level.as_str(), to_millis(timestamp)],
    )?)
}

/// Remove every row of one level (running totals keep a single row per stream)
pub fn delete_level(conn: &Connection, stream_id: StreamId, level: AggregateLevel) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM agg_datum WHERE stream_id = ?1 AND agg_kind = ?2",
        params![stream_id.to_string(), level.as_str()],
    )?)
}

impl DatumStore {
    /// Stored aggregates at `level` whose key falls in `range`
    pub fn query_aggregate(
        &self,
        stream_id: StreamId,
        level: AggregateLevel,
        range: Option<TimeRange>,
    ) -> Result<Vec<AggregateDatum>> {
        let conn = self.conn()?;
        aggregates_in_range(&conn, stream_id, level, range)
    }

    /// Number of aggregate rows at a calendar level; `None` for cyclic levels
    pub fn count_aggregates(
        &self,
        stream_id: StreamId,
        level: AggregateLevel,
        range: Option<TimeRange>,
    ) -> Result<Option<i64>> {
        if level.is_cyclic() {
            return Ok(None);
        }
        let conn = self.conn()?;
        count_in_range(&conn, stream_id, level, range).map(Some)
    }
}
