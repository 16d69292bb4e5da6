//! Staleness queues with explicit leases
//!
//! A queue row is in one of three states:
//! - unleased (`leased_until IS NULL`): stale, claimable
//! - leased until T: claimed by a worker; the reaper returns it to unleased after T
//! - consumed: deleted by the worker in the same transaction that persists its result
//!
//! Re-marking a row that is currently leased bumps its `generation`. Completion
//! only deletes the row when the generation still matches the claim, otherwise
//! it unleases it so the late write gets its own pass.

use crate::error::Result;
use crate::store::db::{from_millis, time_col, to_millis, uuid_col, DatumStore};
use crate::store::types::{AggregateLevel, StaleDatum, StreamId};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;

/// Which staleness queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleQueue {
    Aggregate,
    Audit,
}

impl StaleQueue {
    fn table(&self) -> &'static str {
        match self {
            StaleQueue::Aggregate => "agg_stale_datum",
            StaleQueue::Audit => "aud_stale_datum",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StaleQueue::Aggregate => "aggregate",
            StaleQueue::Audit => "audit",
        }
    }
}

/// A leased stale row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleClaim {
    pub stale: StaleDatum,
    pub generation: i64,
    pub leased_until: DateTime<Utc>,
}

pub(crate) fn level_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<AggregateLevel> {
    let s: String = row.get(idx)?;
    AggregateLevel::from_key(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid aggregate level: {}", s).into(),
        )
    })
}

/// Mark a bucket stale; a no-op when an unleased row already exists
pub fn mark_stale(
    conn: &Connection,
    queue: StaleQueue,
    stream_id: StreamId,
    bucket_start: DateTime<Utc>,
    level: AggregateLevel,
    now: DateTime<Utc>,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (stream_id, ts_start, agg_kind, created, leased_until, generation)
         VALUES (?1, ?2, ?3, ?4, NULL, 0)
         ON CONFLICT(stream_id, ts_start, agg_kind) DO UPDATE
         SET generation = generation + 1
         WHERE leased_until IS NOT NULL",
        queue.table()
    );
    conn.execute(
        &sql,
        params![
            stream_id.to_string(),
            to_millis(bucket_start),
            level.as_str(),
            to_millis(now)
        ],
    )?;
    Ok(())
}

/// Lease the next unleased row at `level`, oldest bucket first then stream
///
/// Runs in an IMMEDIATE transaction, so two connections can never lease the
/// same row; the loser simply sees the next row (or none).
pub fn claim_next(
    conn: &mut Connection,
    queue: StaleQueue,
    level: AggregateLevel,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<StaleClaim>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let select = format!(
        "SELECT stream_id, ts_start, generation FROM {}
         WHERE agg_kind = ?1 AND leased_until IS NULL
         ORDER BY ts_start, stream_id
         LIMIT 1",
        queue.table()
    );
    let next = tx
        .query_row(&select, [level.as_str()], |row| {
            Ok((uuid_col(row, 0)?, time_col(row, 1)?, row.get::<_, i64>(2)?))
        })
        .optional()?;

    let Some((stream_id, bucket_start, generation)) = next else {
        return Ok(None);
    };

    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2);
    let leased_until_ms = to_millis(now).saturating_add(lease_ms);
    let update = format!(
        "UPDATE {} SET leased_until = ?4
         WHERE stream_id = ?1 AND ts_start = ?2 AND agg_kind = ?3",
        queue.table()
    );
    tx.execute(
        &update,
        params![
            stream_id.to_string(),
            to_millis(bucket_start),
            level.as_str(),
            leased_until_ms
        ],
    )?;
    tx.commit()?;

    Ok(Some(StaleClaim {
        stale: StaleDatum {
            stream_id,
            bucket_start,
            level,
        },
        generation,
        leased_until: from_millis(leased_until_ms)?,
    }))
}

/// Consume a claim. Returns false when the row was re-marked while leased;
/// in that case it is unleased again instead of deleted.
pub fn complete(conn: &Connection, queue: StaleQueue, claim: &StaleClaim) -> Result<bool> {
    let key = params![
        claim.stale.stream_id.to_string(),
        to_millis(claim.stale.bucket_start),
        claim.stale.level.as_str(),
        claim.generation
    ];

    let delete = format!(
        "DELETE FROM {} WHERE stream_id = ?1 AND ts_start = ?2 AND agg_kind = ?3
         AND generation = ?4",
        queue.table()
    );
    if conn.execute(&delete, key)? > 0 {
        return Ok(true);
    }

    let release = format!(
        "UPDATE {} SET leased_until = NULL
         WHERE stream_id = ?1 AND ts_start = ?2 AND agg_kind = ?3",
        queue.table()
    );
    conn.execute(
        &release,
        params![
            claim.stale.stream_id.to_string(),
            to_millis(claim.stale.bucket_start),
            claim.stale.level.as_str()
        ],
    )?;
    Ok(false)
}

/// Return every lease that expired at or before `now` to unleased
pub fn reap_expired(conn: &Connection, queue: StaleQueue, now: DateTime<Utc>) -> Result<usize> {
    let sql = format!(
        "UPDATE {} SET leased_until = NULL
         WHERE leased_until IS NOT NULL AND leased_until <= ?1",
        queue.table()
    );
    Ok(conn.execute(&sql, [to_millis(now)])?)
}

/// Queue rows (leased or not), optionally filtered by level
pub fn list_stale(
    conn: &Connection,
    queue: StaleQueue,
    level: Option<AggregateLevel>,
) -> Result<Vec<StaleDatum>> {
    let sql = format!(
        "SELECT stream_id, ts_start, agg_kind FROM {}
         WHERE (?1 IS NULL OR agg_kind = ?1)
         ORDER BY agg_kind, ts_start, stream_id",
        queue.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([level.map(|l| l.as_str())], |row| {
        Ok(StaleDatum {
            stream_id: uuid_col(row, 0)?,
            bucket_start: time_col(row, 1)?,
            level: level_col(row, 2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl DatumStore {
    pub fn mark_stale_bucket(
        &self,
        queue: StaleQueue,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        level: AggregateLevel,
    ) -> Result<()> {
        let now = self.now();
        let conn = self.conn()?;
        mark_stale(&conn, queue, stream_id, bucket_start, level, now)
    }

    pub fn claim_next_stale(
        &self,
        queue: StaleQueue,
        level: AggregateLevel,
        lease: Duration,
    ) -> Result<Option<StaleClaim>> {
        let now = self.now();
        let mut conn = self.conn()?;
        claim_next(&mut conn, queue, level, now, lease)
    }

    pub fn reap_expired_leases(&self, queue: StaleQueue) -> Result<usize> {
        let now = self.now();
        let conn = self.conn()?;
        reap_expired(&conn, queue, now)
    }

    pub fn list_stale(
        &self,
        queue: StaleQueue,
        level: Option<AggregateLevel>,
    ) -> Result<Vec<StaleDatum>> {
        let conn = self.conn()?;
        list_stale(&conn, queue, level)
    }
}
