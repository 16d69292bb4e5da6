//! Aggregation engine: claims stale buckets, recomputes them and cascades staleness
//!
//! Per `(stream, bucket, level)` the lifecycle is
//! `Stale -> Claimed -> (Computed | Stale again)`. Recompute, persist,
//! dequeue and cascade happen in a single transaction, so a worker can stop
//! between any two buckets without losing work.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::interpolate::{accumulating_difference, boundary_readings};
use crate::rollup::buckets::{
    self, bucket_range, cyclic_key, day_start, hour_start, month_start, CycleFilter,
};
use crate::rollup::stats::{fold_children, summarize_accumulating, summarize_instantaneous};
use crate::store::aggregates::{
    aggregates_in_range, aggregates_on_cycle, delete_aggregate, delete_level, upsert_aggregate,
};
use crate::store::db::DatumStore;
use crate::store::ingest::{datum_in_range, earliest_at_or_after, latest_before};
use crate::store::queue::{self, mark_stale, StaleClaim, StaleQueue};
use crate::store::registry::load_stream;
use crate::store::types::{AggregateDatum, AggregateLevel, StaleDatum, StreamId, TimeRange};
use crate::zones::ZoneLookup;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;

/// Calendar levels in cascade order
pub const CALENDAR_LEVELS: [AggregateLevel; 4] = [
    AggregateLevel::Hour,
    AggregateLevel::Day,
    AggregateLevel::Month,
    AggregateLevel::RunningTotal,
];

pub const CYCLIC_LEVELS: [AggregateLevel; 4] = [
    AggregateLevel::HourOfDay,
    AggregateLevel::SeasonalHourOfDay,
    AggregateLevel::DayOfWeek,
    AggregateLevel::SeasonalDayOfWeek,
];

const DEFAULT_LEASE: Duration = Duration::from_secs(300);

pub struct AggregationEngine {
    store: Arc<DatumStore>,
    zones: Arc<dyn ZoneLookup>,
    lease: Duration,
    cyclic: bool,
}

impl AggregationEngine {
    pub fn new(store: Arc<DatumStore>, zones: Arc<dyn ZoneLookup>) -> Self {
        Self {
            store,
            zones,
            lease: DEFAULT_LEASE,
            cyclic: true,
        }
    }

    pub fn from_config(store: Arc<DatumStore>, zones: Arc<dyn ZoneLookup>, config: &EngineConfig) -> Self {
        Self::new(store, zones)
            .with_lease(config.claim_lease())
            .with_cyclic(config.cyclic_aggregates)
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Enable or disable maintenance of the cyclic levels
    pub fn with_cyclic(mut self, cyclic: bool) -> Self {
        self.cyclic = cyclic;
        self
    }

    pub fn store(&self) -> &Arc<DatumStore> {
        &self.store
    }

    /// Levels this engine drains, in processing order
    pub fn levels(&self) -> Vec<AggregateLevel> {
        let mut levels = CALENDAR_LEVELS.to_vec();
        if self.cyclic {
            levels.extend(CYCLIC_LEVELS);
        }
        levels
    }

    /// Lease the next stale bucket at `level`; `None` when nothing is claimable
    pub fn claim_next_stale(&self, level: AggregateLevel) -> Result<Option<StaleClaim>> {
        self.store
            .claim_next_stale(StaleQueue::Aggregate, level, self.lease)
    }

    /// Compute (without persisting) the aggregate for one bucket
    ///
    /// `None` means the bucket has no source data. Running totals ignore
    /// `bucket_start` and are keyed by the cutoff derived from `now`.
    pub fn recompute(
        &self,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        level: AggregateLevel,
        now: DateTime<Utc>,
    ) -> Result<Option<AggregateDatum>> {
        let conn = self.store.conn()?;
        self.compute(&conn, stream_id, bucket_start, level, now)
    }

    /// Recompute, persist and dequeue a claimed bucket, cascading staleness upward
    pub fn process_claim(&self, claim: &StaleClaim) -> Result<Option<AggregateDatum>> {
        let StaleDatum {
            stream_id,
            bucket_start,
            level,
        } = claim.stale;
        let now = self.store.now();

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = self.compute(&tx, stream_id, bucket_start, level, now)?;
        if level == AggregateLevel::RunningTotal {
            delete_level(&tx, stream_id, level)?;
        }
        match &result {
            Some(agg) => upsert_aggregate(&tx, agg)?,
            None => {
                delete_aggregate(&tx, stream_id, level, bucket_start)?;
            }
        }

        let consumed = queue::complete(&tx, StaleQueue::Aggregate, claim)?;
        self.cascade(&tx, &claim.stale, now)?;
        tx.commit()?;

        log::debug!(
            "   ├─ {} {} @ {}: {}{}",
            level.as_str(),
            stream_id,
            bucket_start.to_rfc3339(),
            if result.is_some() { "stored" } else { "empty" },
            if consumed { "" } else { " (re-marked, kept stale)" }
        );
        Ok(result)
    }

    /// Claim and process one bucket at `level`
    pub fn process_next(&self, level: AggregateLevel) -> Result<Option<StaleDatum>> {
        let Some(claim) = self.claim_next_stale(level)? else {
            return Ok(None);
        };
        self.process_claim(&claim)?;
        Ok(Some(claim.stale))
    }

    /// Process up to `max` buckets at `level`
    pub fn process_batch(&self, level: AggregateLevel, max: usize) -> Result<usize> {
        let mut processed = 0;
        while processed < max && self.process_next(level)?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Process every claimable bucket, finest level first, until the queue is quiet
    pub fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut pass = 0;
            for level in self.levels() {
                pass += self.process_batch(level, usize::MAX)?;
            }
            if pass == 0 {
                break;
            }
            total += pass;
        }
        if total > 0 {
            log::info!("✅ Aggregation drained {} buckets", total);
        }
        Ok(total)
    }

    fn cascade(&self, conn: &Connection, stale: &StaleDatum, now: DateTime<Utc>) -> Result<()> {
        let StaleDatum {
            stream_id,
            bucket_start,
            level,
        } = *stale;

        if let Some(next) = level.next_coarser() {
            let parent = buckets::bucket_start(next, bucket_start);
            mark_stale(conn, StaleQueue::Aggregate, stream_id, parent, next, now)?;
        }
        if self.cyclic {
            for dependent in level.cyclic_dependents() {
                let key = cyclic_key(bucket_start, *dependent);
                mark_stale(conn, StaleQueue::Aggregate, stream_id, key, *dependent, now)?;
            }
        }
        // Audit rows count the aggregates stored under them
        let audit = match level {
            AggregateLevel::Hour => Some((day_start(bucket_start), AggregateLevel::Day)),
            AggregateLevel::Day | AggregateLevel::Month => {
                Some((month_start(bucket_start), AggregateLevel::Month))
            }
            _ => None,
        };
        if let Some((audit_start, audit_level)) = audit {
            mark_stale(conn, StaleQueue::Audit, stream_id, audit_start, audit_level, now)?;
        }
        Ok(())
    }

    fn compute(
        &self,
        conn: &Connection,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        level: AggregateLevel,
        now: DateTime<Utc>,
    ) -> Result<Option<AggregateDatum>> {
        match level {
            AggregateLevel::Hour | AggregateLevel::Day => {
                match bucket_range(level, bucket_start) {
                    Some(range) => compute_from_raw(conn, stream_id, level, range),
                    None => Ok(None),
                }
            }
            AggregateLevel::Month => match bucket_range(level, bucket_start) {
                Some(range) => compute_month(conn, stream_id, range),
                None => Ok(None),
            },
            AggregateLevel::RunningTotal => self.compute_running_total(conn, stream_id, now),
            _ => compute_cyclic(conn, stream_id, bucket_start, level),
        }
    }

    fn compute_running_total(
        &self,
        conn: &Connection,
        stream_id: StreamId,
        now: DateTime<Utc>,
    ) -> Result<Option<AggregateDatum>> {
        let Some(meta) = load_stream(conn, stream_id)? else {
            return Ok(None);
        };
        let cutoff = buckets::running_total_cutoff(now, self.zones.offset_for(&meta));
        let month0 = month_start(cutoff);
        let day0 = day_start(cutoff);
        let hour0 = hour_start(cutoff);

        // Whole months, then whole days, then whole hours up to the cutoff
        let mut children = aggregates_in_range(
            conn,
            stream_id,
            AggregateLevel::Month,
            Some(TimeRange::new(DateTime::<Utc>::MIN_UTC, month0)),
        )?;
        children.extend(aggregates_in_range(
            conn,
            stream_id,
            AggregateLevel::Day,
            Some(TimeRange::new(month0, day0)),
        )?);
        children.extend(aggregates_in_range(
            conn,
            stream_id,
            AggregateLevel::Hour,
            Some(TimeRange::new(day0, hour0)),
        )?);

        if children.is_empty() {
            return Ok(None);
        }

        let folded = fold_children(&children);
        Ok(Some(AggregateDatum {
            stream_id,
            timestamp: cutoff,
            level: AggregateLevel::RunningTotal,
            instantaneous: folded.instantaneous,
            instantaneous_stats: folded.instantaneous_stats,
            accumulating: folded.accumulating_sum,
            accumulating_stats: folded.accumulating_stats,
        }))
    }
}

fn boundary_difference(conn: &Connection, stream_id: StreamId, range: TimeRange) -> Result<Vec<Option<f64>>> {
    Ok(boundary_readings(conn, stream_id, range)?
        .map(|(start, end)| accumulating_difference(&start, &end))
        .unwrap_or_default())
}

fn compute_from_raw(
    conn: &Connection,
    stream_id: StreamId,
    level: AggregateLevel,
    range: TimeRange,
) -> Result<Option<AggregateDatum>> {
    let rows = datum_in_range(conn, stream_id, range)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let prior = latest_before(conn, stream_id, range.start)?;
    let has_later = earliest_at_or_after(conn, stream_id, range.end)?.is_some();
    let (instantaneous, instantaneous_stats) =
        summarize_instantaneous(&rows, prior.as_ref(), has_later, range);

    Ok(Some(AggregateDatum {
        stream_id,
        timestamp: range.start,
        level,
        instantaneous,
        instantaneous_stats,
        accumulating: boundary_difference(conn, stream_id, range)?,
        accumulating_stats: summarize_accumulating(&rows),
    }))
}

fn compute_month(
    conn: &Connection,
    stream_id: StreamId,
    range: TimeRange,
) -> Result<Option<AggregateDatum>> {
    let days = aggregates_in_range(conn, stream_id, AggregateLevel::Day, Some(range))?;
    if days.is_empty() {
        return Ok(None);
    }

    let folded = fold_children(&days);
    Ok(Some(AggregateDatum {
        stream_id,
        timestamp: range.start,
        level: AggregateLevel::Month,
        instantaneous: folded.instantaneous,
        instantaneous_stats: folded.instantaneous_stats,
        accumulating: boundary_difference(conn, stream_id, range)?,
        accumulating_stats: folded.accumulating_stats,
    }))
}

fn compute_cyclic(
    conn: &Connection,
    stream_id: StreamId,
    key: DateTime<Utc>,
    level: AggregateLevel,
) -> Result<Option<AggregateDatum>> {
    let source = match level {
        AggregateLevel::HourOfDay | AggregateLevel::SeasonalHourOfDay => AggregateLevel::Hour,
        _ => AggregateLevel::Day,
    };

    let Some(filter) = CycleFilter::for_key(key, level) else {
        return Ok(None);
    };
    let children = aggregates_on_cycle(conn, stream_id, source, filter)?;
    if children.is_empty() {
        return Ok(None);
    }

    let folded = fold_children(&children);
    Ok(Some(AggregateDatum {
        stream_id,
        timestamp: key,
        level,
        instantaneous: folded.instantaneous,
        instantaneous_stats: folded.instantaneous_stats,
        accumulating: folded.accumulating_mean,
        accumulating_stats: folded.accumulating_stats,
    }))
}
