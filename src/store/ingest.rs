//! Raw datum rows: append, range queries and explicit reprocessing

use crate::error::{DatumError, Result};
use crate::rollup::buckets::{day_start, hour_start};
use crate::store::counters;
use crate::store::db::{json_col, time_col, to_millis, uuid_col, DatumStore};
use crate::store::queue::{mark_stale, StaleQueue};
use crate::store::registry::{ensure_properties, resolve_stream};
use crate::store::types::{
    AggregateLevel, DatumRecord, DatumSamples, ObjectKind, StreamId, TimeRange,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeSet;

const DATUM_COLUMNS: &str = "stream_id, ts, received, data_i, data_a, data_s, tags";

fn datum_from_row(row: &Row<'_>) -> rusqlite::Result<DatumRecord> {
    Ok(DatumRecord {
        stream_id: uuid_col(row, 0)?,
        timestamp: time_col(row, 1)?,
        received_at: time_col(row, 2)?,
        instantaneous: json_col(row, 3)?,
        accumulating: json_col(row, 4)?,
        status: json_col(row, 5)?,
        tags: json_col(row, 6)?,
    })
}

/// Raw rows with `range.start <= ts < range.end`, ascending
pub fn datum_in_range(
    conn: &Connection,
    stream_id: StreamId,
    range: TimeRange,
) -> Result<Vec<DatumRecord>> {
    let sql = format!(
        "SELECT {} FROM da_datum WHERE stream_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts",
        DATUM_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![stream_id.to_string(), to_millis(range.start), to_millis(range.end)],
        datum_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn single_datum(
    conn: &Connection,
    stream_id: StreamId,
    ts: DateTime<Utc>,
    clause: &str,
) -> Result<Option<DatumRecord>> {
    let sql = format!(
        "SELECT {} FROM da_datum WHERE stream_id = ?1 AND {} LIMIT 1",
        DATUM_COLUMNS, clause
    );
    let record = conn
        .prepare_cached(&sql)?
        .query_row(params![stream_id.to_string(), to_millis(ts)], datum_from_row)
        .optional()?;
    Ok(record)
}

/// Latest row with `timestamp <= ts`
pub fn latest_at_or_before(
    conn: &Connection,
    stream_id: StreamId,
    ts: DateTime<Utc>,
) -> Result<Option<DatumRecord>> {
    single_datum(conn, stream_id, ts, "ts <= ?2 ORDER BY ts DESC")
}

/// Latest row with `timestamp < ts`
pub fn latest_before(
    conn: &Connection,
    stream_id: StreamId,
    ts: DateTime<Utc>,
) -> Result<Option<DatumRecord>> {
    single_datum(conn, stream_id, ts, "ts < ?2 ORDER BY ts DESC")
}

/// Earliest row with `timestamp >= ts`
pub fn earliest_at_or_after(
    conn: &Connection,
    stream_id: StreamId,
    ts: DateTime<Utc>,
) -> Result<Option<DatumRecord>> {
    single_datum(conn, stream_id, ts, "ts >= ?2 ORDER BY ts")
}

/// Hours holding the nearest raw rows on either side of `range`
///
/// An hour's boundary interpolation and carried-in reading come from these
/// rows, so they go stale together with the rows inside the range.
fn neighbour_hours(
    conn: &Connection,
    stream_id: StreamId,
    range: TimeRange,
) -> Result<Vec<DateTime<Utc>>> {
    let before = latest_before(conn, stream_id, range.start)?;
    let after = earliest_at_or_after(conn, stream_id, range.end)?;
    Ok(before
        .into_iter()
        .chain(after)
        .map(|row| hour_start(row.timestamp))
        .collect())
}

/// Lay named samples out in the stream's positional order
fn align_samples(
    samples: &DatumSamples,
    positions: &[usize],
    widths: (usize, usize, usize),
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<String>>) {
    let mut instantaneous = vec![None; widths.0];
    let mut accumulating = vec![None; widths.1];
    let mut status = vec![None; widths.2];

    let mut pos = positions.iter().copied();
    for value in samples.instantaneous.values() {
        if let Some(idx) = pos.next() {
            instantaneous[idx] = Some(*value);
        }
    }
    for value in samples.accumulating.values() {
        if let Some(idx) = pos.next() {
            accumulating[idx] = Some(*value);
        }
    }
    for value in samples.status.values() {
        if let Some(idx) = pos.next() {
            status[idx] = Some(value.clone());
        }
    }

    (instantaneous, accumulating, status)
}

impl DatumStore {
    /// Store one reading and mark its hour stale
    ///
    /// Registry resolution, schema growth, the datum upsert, the stale Hour
    /// enqueue and the hourly audit increment commit together or not at all.
    /// A second write with the same `(stream, timestamp)` replaces the first.
    pub fn append(
        &self,
        object_id: i64,
        source_id: &str,
        kind: ObjectKind,
        timestamp: DateTime<Utc>,
        samples: &DatumSamples,
    ) -> Result<StreamId> {
        if let Some(name) = samples.first_non_finite() {
            return Err(DatumError::NonFiniteSample { name: name.to_string() });
        }
        let now = self.now();
        let limit = self.options().max_properties;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let meta = resolve_stream(&tx, object_id, source_id, kind, now)?;
        let stream_id = meta.stream_id;
        let (names, positions) =
            ensure_properties(&tx, stream_id, &samples.observed_names(), limit)?;

        let (instantaneous, accumulating, status) = align_samples(
            samples,
            &positions,
            (
                names.instantaneous.len(),
                names.accumulating.len(),
                names.status.len(),
            ),
        );

        tx.execute(
            "INSERT INTO da_datum (stream_id, ts, received, data_i, data_a, data_s, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(stream_id, ts) DO UPDATE SET
                received = excluded.received,
                data_i = excluded.data_i,
                data_a = excluded.data_a,
                data_s = excluded.data_s,
                tags = excluded.tags",
            params![
                stream_id.to_string(),
                to_millis(timestamp),
                to_millis(now),
                serde_json::to_string(&instantaneous)?,
                serde_json::to_string(&accumulating)?,
                serde_json::to_string(&status)?,
                serde_json::to_string(&samples.tags)?,
            ],
        )?;

        // Timestamps are stored at millisecond precision
        let own = TimeRange::new(timestamp, timestamp + Duration::milliseconds(1));
        let mut hours: BTreeSet<DateTime<Utc>> =
            neighbour_hours(&tx, stream_id, own)?.into_iter().collect();
        hours.insert(hour_start(timestamp));
        for hour in hours {
            mark_stale(&tx, StaleQueue::Aggregate, stream_id, hour, AggregateLevel::Hour, now)?;
        }

        let props = (samples.property_count() + samples.tags.len()) as i64;
        let first_touch = counters::increment_hourly(&tx, stream_id, now, 1, props, 0)?;
        if first_touch {
            mark_stale(
                &tx,
                StaleQueue::Audit,
                stream_id,
                day_start(now),
                AggregateLevel::Day,
                now,
            )?;
        }

        tx.commit()?;
        log::debug!(
            "📥 Stored datum {} @ {} ({} props)",
            stream_id,
            timestamp.to_rfc3339(),
            props
        );
        Ok(stream_id)
    }

    /// Raw rows in `range`, ascending; unknown streams yield an empty result
    ///
    /// Returned rows are counted against the stream's hourly query counter.
    pub fn query_raw(&self, stream_id: StreamId, range: TimeRange) -> Result<Vec<DatumRecord>> {
        let now = self.now();
        let conn = self.conn()?;
        let rows = datum_in_range(&conn, stream_id, range)?;
        if !rows.is_empty() {
            counters::increment_hourly(&conn, stream_id, now, 0, 0, rows.len() as i64)?;
        }
        Ok(rows)
    }

    /// Force reprocessing of `range`
    ///
    /// Every hour holding raw rows, plus the hours of the nearest rows outside
    /// the range, becomes aggregate-stale and every day the range touches
    /// becomes audit-stale. Returns the number of buckets marked.
    pub fn mark_stale(&self, stream_id: StreamId, range: TimeRange) -> Result<usize> {
        if range.is_empty() {
            return Ok(0);
        }
        let now = self.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut hours: BTreeSet<DateTime<Utc>> = {
            let mut stmt = tx.prepare(
                "SELECT ts FROM da_datum WHERE stream_id = ?1 AND ts >= ?2 AND ts < ?3",
            )?;
            let rows = stmt.query_map(
                params![stream_id.to_string(), to_millis(range.start), to_millis(range.end)],
                |row| time_col(row, 0),
            )?;
            let hours = rows
                .map(|r| r.map(hour_start))
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            hours
        };
        hours.extend(neighbour_hours(&tx, stream_id, range)?);

        for hour in &hours {
            mark_stale(&tx, StaleQueue::Aggregate, stream_id, *hour, AggregateLevel::Hour, now)?;
        }

        let mut days = 0;
        let mut day = day_start(range.start);
        while day < range.end {
            mark_stale(&tx, StaleQueue::Audit, stream_id, day, AggregateLevel::Day, now)?;
            days += 1;
            day += Duration::days(1);
        }

        tx.commit()?;
        log::info!(
            "🔁 Marked {} hours and {} audit days stale for {}",
            hours.len(),
            days,
            stream_id
        );
        Ok(hours.len() + days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::test_support::*;

    fn stale_hours(store: &DatumStore) -> Vec<DateTime<Utc>> {
        store
            .list_stale(StaleQueue::Aggregate, Some(AggregateLevel::Hour))
            .unwrap()
            .into_iter()
            .map(|s| s.bucket_start)
            .collect()
    }

    #[test]
    fn test_same_hour_writes_share_one_stale_row() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);

        for minute in [0, 5, 12, 20, 33, 47, 59] {
            let t = ts("2024-03-10T09:00:00Z") + Duration::minutes(minute);
            store
                .append(1, "meter", ObjectKind::Node, t, &DatumSamples::new().with_instantaneous("watts", 1.0))
                .unwrap();
        }

        assert_eq!(stale_hours(&store), vec![ts("2024-03-10T09:00:00Z")]);
    }

    #[test]
    fn test_cross_boundary_writes_enqueue_two_hours() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_instantaneous("watts", 1.0);

        store.append(1, "meter", ObjectKind::Node, ts("2024-03-10T09:05:00Z"), &samples).unwrap();
        store.append(1, "meter", ObjectKind::Node, ts("2024-03-10T10:05:00Z"), &samples).unwrap();

        assert_eq!(
            stale_hours(&store),
            vec![ts("2024-03-10T09:00:00Z"), ts("2024-03-10T10:00:00Z")]
        );
    }

    #[test]
    fn test_write_marks_neighbouring_hours() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_accumulating("wattHours", 1.0);

        store.append(1, "meter", ObjectKind::Node, ts("2024-03-10T02:30:00Z"), &samples).unwrap();
        store.append(1, "meter", ObjectKind::Node, ts("2024-03-10T07:15:00Z"), &samples).unwrap();
        store.conn().unwrap().execute("DELETE FROM agg_stale_datum", []).unwrap();

        // Lands between the two: both neighbours interpolate against it
        store.append(1, "meter", ObjectKind::Node, ts("2024-03-10T04:45:00Z"), &samples).unwrap();
        assert_eq!(
            stale_hours(&store),
            vec![
                ts("2024-03-10T02:00:00Z"),
                ts("2024-03-10T04:00:00Z"),
                ts("2024-03-10T07:00:00Z"),
            ]
        );
    }

    #[test]
    fn test_non_finite_sample_is_rejected() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);

        let err = store
            .append(
                1,
                "meter",
                ObjectKind::Node,
                ts("2024-03-10T09:00:00Z"),
                &DatumSamples::new().with_instantaneous("watts", f64::INFINITY),
            )
            .unwrap_err();
        assert!(matches!(err, DatumError::NonFiniteSample { ref name } if name == "watts"));
        assert!(store.find_stream(1, "meter", ObjectKind::Node).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_timestamp_overwrites() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);
        let t = ts("2024-03-10T09:05:00Z");

        let id = store
            .append(1, "meter", ObjectKind::Node, t, &DatumSamples::new().with_instantaneous("watts", 1.0))
            .unwrap();
        clock.set(ts("2024-03-10T12:30:00Z"));
        store
            .append(1, "meter", ObjectKind::Node, t, &DatumSamples::new().with_instantaneous("watts", 2.0))
            .unwrap();

        let rows = store
            .query_raw(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-11T00:00:00Z")))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instantaneous, vec![Some(2.0)]);
        assert_eq!(rows[0].received_at, ts("2024-03-10T12:30:00Z"));
    }

    #[test]
    fn test_rows_align_to_growing_schema() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);

        let id = store
            .append(
                1,
                "meter",
                ObjectKind::Node,
                ts("2024-03-10T09:00:00Z"),
                &DatumSamples::new().with_instantaneous("watts", 5.0),
            )
            .unwrap();
        store
            .append(
                1,
                "meter",
                ObjectKind::Node,
                ts("2024-03-10T09:01:00Z"),
                &DatumSamples::new()
                    .with_instantaneous("volts", 230.0)
                    .with_status("mode", "auto")
                    .with_tag("test"),
            )
            .unwrap();

        let rows = store
            .query_raw(id, TimeRange::new(ts("2024-03-10T09:00:00Z"), ts("2024-03-10T10:00:00Z")))
            .unwrap();
        assert_eq!(rows[0].instantaneous, vec![Some(5.0)]);
        // "watts" keeps index 0 and is absent (null, not zero) in the second row
        assert_eq!(rows[1].instantaneous, vec![None, Some(230.0)]);
        assert_eq!(rows[1].status, vec![Some("auto".to_string())]);
        assert!(rows[1].tags.contains("test"));
    }

    #[test]
    fn test_schema_limit_rolls_back_whole_write() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock); // limit 8

        let mut samples = DatumSamples::new();
        for i in 0..9 {
            samples = samples.with_instantaneous(&format!("p{}", i), i as f64);
        }
        let err = store
            .append(1, "meter", ObjectKind::Node, ts("2024-03-10T09:00:00Z"), &samples)
            .unwrap_err();
        assert!(matches!(err, DatumError::SchemaLimitExceeded { .. }));

        // Nothing from the failed write survives, not even the stream
        assert!(store.find_stream(1, "meter", ObjectKind::Node).unwrap().is_none());
        assert!(store.list_stale(StaleQueue::Aggregate, None).unwrap().is_empty());
    }

    #[test]
    fn test_query_unknown_stream_is_empty() {
        let clock = TestClock::at(ts("2024-03-10T12:00:00Z"));
        let store = memory_store(&clock);
        let rows = store
            .query_raw(
                uuid::Uuid::new_v4(),
                TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-11T00:00:00Z")),
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_mark_stale_range() {
        let clock = TestClock::at(ts("2024-03-12T12:00:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_accumulating("wattHours", 1.0);
        let id = store.append(1, "m", ObjectKind::Node, ts("2024-03-10T09:05:00Z"), &samples).unwrap();
        store.append(1, "m", ObjectKind::Node, ts("2024-03-11T22:05:00Z"), &samples).unwrap();

        // Simulate both hours having been processed already
        store.conn().unwrap().execute("DELETE FROM agg_stale_datum", []).unwrap();
        store.conn().unwrap().execute("DELETE FROM aud_stale_datum", []).unwrap();

        let marked = store
            .mark_stale(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-12T00:00:00Z")))
            .unwrap();
        assert_eq!(marked, 4);
        assert_eq!(
            stale_hours(&store),
            vec![ts("2024-03-10T09:00:00Z"), ts("2024-03-11T22:00:00Z")]
        );
        assert_eq!(store.list_stale(StaleQueue::Audit, Some(AggregateLevel::Day)).unwrap().len(), 2);
    }

    #[test]
    fn test_mark_stale_includes_neighbouring_hours() {
        let clock = TestClock::at(ts("2024-03-12T12:00:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_accumulating("wattHours", 1.0);
        let id = store.append(1, "m", ObjectKind::Node, ts("2024-03-09T23:40:00Z"), &samples).unwrap();
        store.append(1, "m", ObjectKind::Node, ts("2024-03-10T09:05:00Z"), &samples).unwrap();
        store.append(1, "m", ObjectKind::Node, ts("2024-03-11T00:20:00Z"), &samples).unwrap();
        store.conn().unwrap().execute("DELETE FROM agg_stale_datum", []).unwrap();

        store
            .mark_stale(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-11T00:00:00Z")))
            .unwrap();
        assert_eq!(
            stale_hours(&store),
            vec![
                ts("2024-03-09T23:00:00Z"),
                ts("2024-03-10T09:00:00Z"),
                ts("2024-03-11T00:00:00Z"),
            ]
        );
    }
}
