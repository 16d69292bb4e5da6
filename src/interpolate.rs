//! Synthetic readings between stored datum rows

use crate::error::Result;
use crate::store::db::DatumStore;
use crate::store::ingest::{
    datum_in_range, earliest_at_or_after, latest_at_or_before, latest_before,
};
use crate::store::types::{DatumRecord, StreamId, TimeRange};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::BTreeSet;

fn lerp(prior: &[Option<f64>], next: &[Option<f64>], ratio: f64) -> Vec<Option<f64>> {
    let len = prior.len().max(next.len());
    (0..len)
        .map(|i| match (prior.get(i).copied().flatten(), next.get(i).copied().flatten()) {
            (Some(a), Some(b)) => Some(a + ratio * (b - a)),
            _ => None,
        })
        .collect()
}

/// Linear interpolation between two bracketing rows
///
/// Properties missing on either side stay `None`. Status values and tags are
/// not interpolated.
pub fn interpolate_between(prior: &DatumRecord, next: &DatumRecord, at: DateTime<Utc>) -> DatumRecord {
    let span = (next.timestamp - prior.timestamp).num_milliseconds();
    let ratio = if span == 0 {
        0.0
    } else {
        (at - prior.timestamp).num_milliseconds() as f64 / span as f64
    };

    DatumRecord {
        stream_id: prior.stream_id,
        timestamp: at,
        received_at: next.received_at,
        instantaneous: lerp(&prior.instantaneous, &next.instantaneous, ratio),
        accumulating: lerp(&prior.accumulating, &next.accumulating, ratio),
        status: Vec::new(),
        tags: BTreeSet::new(),
    }
}

/// Reading at `at`, or `None` unless rows exist on both sides
///
/// A stored row at exactly `at` is returned unchanged.
pub fn interpolate(conn: &Connection, stream_id: StreamId, at: DateTime<Utc>) -> Result<Option<DatumRecord>> {
    let Some(prior) = latest_at_or_before(conn, stream_id, at)? else {
        return Ok(None);
    };
    if prior.timestamp == at {
        return Ok(Some(prior));
    }
    let Some(next) = earliest_at_or_after(conn, stream_id, at)? else {
        return Ok(None);
    };
    Ok(Some(interpolate_between(&prior, &next, at)))
}

/// Readings at both ends of `range`
///
/// Each end is interpolated when possible; otherwise the earliest (start) or
/// latest (end) stored row inside the range stands in for it.
pub fn boundary_readings(
    conn: &Connection,
    stream_id: StreamId,
    range: TimeRange,
) -> Result<Option<(DatumRecord, DatumRecord)>> {
    let start = match interpolate(conn, stream_id, range.start)? {
        Some(reading) => Some(reading),
        None => earliest_at_or_after(conn, stream_id, range.start)?
            .filter(|row| row.timestamp < range.end),
    };
    let end = match interpolate(conn, stream_id, range.end)? {
        Some(reading) => Some(reading),
        None => latest_before(conn, stream_id, range.end)?
            .filter(|row| row.timestamp >= range.start),
    };

    Ok(start.zip(end))
}

/// Per-index accumulating difference `end - start`
pub fn accumulating_difference(start: &DatumRecord, end: &DatumRecord) -> Vec<Option<f64>> {
    let len = start.accumulating.len().max(end.accumulating.len());
    (0..len)
        .map(|i| match (start.accumulating_at(i), end.accumulating_at(i)) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        })
        .collect()
}

impl DatumStore {
    pub fn interpolate(&self, stream_id: StreamId, at: DateTime<Utc>) -> Result<Option<DatumRecord>> {
        let conn = self.conn()?;
        interpolate(&conn, stream_id, at)
    }

    /// Accumulating change over `range`, or `None` when the range holds no readings
    pub fn reading_difference(
        &self,
        stream_id: StreamId,
        range: TimeRange,
    ) -> Result<Option<Vec<Option<f64>>>> {
        if range.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let readings = boundary_readings(&conn, stream_id, range)?;
        Ok(readings.map(|(start, end)| accumulating_difference(&start, &end)))
    }

    /// Raw rows plus interpolated readings at both range ends
    pub fn query_with_boundaries(
        &self,
        stream_id: StreamId,
        range: TimeRange,
    ) -> Result<Vec<DatumRecord>> {
        let conn = self.conn()?;
        let mut rows = datum_in_range(&conn, stream_id, range)?;
        if rows.first().map(|r| r.timestamp) != Some(range.start) {
            if let Some(start) = interpolate(&conn, stream_id, range.start)? {
                rows.insert(0, start);
            }
        }
        if let Some(end) = interpolate(&conn, stream_id, range.end)? {
            rows.push(end);
        }
        Ok(rows)
    }
}
