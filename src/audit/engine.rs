//! Accounting engine: rolls hourly usage counters up to day, month and running total

use crate::config::EngineConfig;
use crate::error::Result;
use crate::rollup::buckets::{self, bucket_range};
use crate::store::aggregates::count_in_range;
use crate::store::counters::{audit_rows, delete_audit, upsert_audit};
use crate::store::db::DatumStore;
use crate::store::queue::{self, mark_stale, StaleClaim, StaleQueue};
use crate::store::types::{AggregateLevel, AuditDatum, StaleDatum, StreamId, TimeRange};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;

/// Audit levels in cascade order; Hour rows are written by ingest
pub const AUDIT_LEVELS: [AggregateLevel; 3] = [
    AggregateLevel::Day,
    AggregateLevel::Month,
    AggregateLevel::RunningTotal,
];

const DEFAULT_LEASE: Duration = Duration::from_secs(300);

pub struct AccountingEngine {
    store: Arc<DatumStore>,
    lease: Duration,
}

impl AccountingEngine {
    pub fn new(store: Arc<DatumStore>) -> Self {
        Self {
            store,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn from_config(store: Arc<DatumStore>, config: &EngineConfig) -> Self {
        Self::new(store).with_lease(config.claim_lease())
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn store(&self) -> &Arc<DatumStore> {
        &self.store
    }

    pub fn claim_next_stale(&self, level: AggregateLevel) -> Result<Option<StaleClaim>> {
        self.store.claim_next_stale(StaleQueue::Audit, level, self.lease)
    }

    /// Compute (without persisting) the counters of one audit bucket
    pub fn recompute(
        &self,
        stream_id: StreamId,
        bucket_start: DateTime<Utc>,
        level: AggregateLevel,
    ) -> Result<Option<AuditDatum>> {
        let conn = self.store.conn()?;
        compute(&conn, stream_id, bucket_start, level)
    }

    pub fn process_claim(&self, claim: &StaleClaim) -> Result<Option<AuditDatum>> {
        let StaleDatum {
            stream_id,
            bucket_start,
            level,
        } = claim.stale;
        let now = self.store.now();

        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = compute(&tx, stream_id, bucket_start, level)?;
        match &result {
            Some(audit) => upsert_audit(&tx, audit)?,
            None => delete_audit(&tx, stream_id, level, bucket_start)?,
        }
        queue::complete(&tx, StaleQueue::Audit, claim)?;

        if let Some(next) = level.next_coarser() {
            let parent = buckets::bucket_start(next, bucket_start);
            mark_stale(&tx, StaleQueue::Audit, stream_id, parent, next, now)?;
        }
        tx.commit()?;

        log::debug!(
            "   ├─ audit {} {} @ {}",
            level.as_str(),
            stream_id,
            bucket_start.to_rfc3339()
        );
        Ok(result)
    }

    pub fn process_next(&self, level: AggregateLevel) -> Result<Option<StaleDatum>> {
        let Some(claim) = self.claim_next_stale(level)? else {
            return Ok(None);
        };
        self.process_claim(&claim)?;
        Ok(Some(claim.stale))
    }

    pub fn process_batch(&self, level: AggregateLevel, max: usize) -> Result<usize> {
        let mut processed = 0;
        while processed < max && self.process_next(level)?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Process the audit queue until nothing is claimable
    pub fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut pass = 0;
            for level in AUDIT_LEVELS {
                pass += self.process_batch(level, usize::MAX)?;
            }
            if pass == 0 {
                break;
            }
            total += pass;
        }
        if total > 0 {
            log::info!("✅ Accounting drained {} buckets", total);
        }
        Ok(total)
    }
}

fn sum_children(stream_id: StreamId, bucket_start: DateTime<Utc>, level: AggregateLevel, children: &[AuditDatum]) -> AuditDatum {
    children.iter().fold(
        AuditDatum {
            stream_id,
            bucket_start,
            level,
            datum_count: 0,
            prop_count: 0,
            datum_query_count: 0,
            datum_hourly_count: 0,
            datum_daily_count: 0,
            datum_monthly_count: 0,
        },
        |mut acc, child| {
            acc.datum_count += child.datum_count;
            acc.prop_count += child.prop_count;
            acc.datum_query_count += child.datum_query_count;
            acc.datum_hourly_count += child.datum_hourly_count;
            acc.datum_daily_count += child.datum_daily_count;
            acc.datum_monthly_count += child.datum_monthly_count;
            acc
        },
    )
}

fn compute(
    conn: &Connection,
    stream_id: StreamId,
    bucket_start: DateTime<Utc>,
    level: AggregateLevel,
) -> Result<Option<AuditDatum>> {
    let audit = match level {
        AggregateLevel::Day => {
            let Some(range) = bucket_range(level, bucket_start) else {
                return Ok(None);
            };
            let hours = audit_rows(conn, stream_id, AggregateLevel::Hour, Some(range))?;
            let mut day = sum_children(stream_id, bucket_start, level, &hours);
            day.datum_hourly_count = count_in_range(conn, stream_id, AggregateLevel::Hour, Some(range))?;
            (!hours.is_empty() || day.datum_hourly_count > 0).then_some(day)
        }
        AggregateLevel::Month => {
            let Some(range) = bucket_range(level, bucket_start) else {
                return Ok(None);
            };
            let days = audit_rows(conn, stream_id, AggregateLevel::Day, Some(range))?;
            let mut month = sum_children(stream_id, bucket_start, level, &days);
            month.datum_daily_count = count_in_range(conn, stream_id, AggregateLevel::Day, Some(range))?;
            month.datum_monthly_count =
                count_in_range(conn, stream_id, AggregateLevel::Month, Some(range))?;
            (!days.is_empty() || month.datum_daily_count > 0 || month.datum_monthly_count > 0)
                .then_some(month)
        }
        AggregateLevel::RunningTotal => {
            let months = audit_rows(conn, stream_id, AggregateLevel::Month, None)?;
            (!months.is_empty()).then(|| sum_children(stream_id, buckets::epoch(), level, &months))
        }
        _ => None,
    };
    Ok(audit)
}

impl DatumStore {
    /// Audit rows over a range, with the Hour level read straight from ingest counters
    pub fn audit_summary(&self, stream_id: StreamId, range: TimeRange) -> Result<AuditDatum> {
        let conn = self.conn()?;
        let hours = audit_rows(&conn, stream_id, AggregateLevel::Hour, Some(range))?;
        Ok(sum_children(stream_id, range.start, AggregateLevel::Hour, &hours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::engine::AggregationEngine;
    use crate::store::db::test_support::*;
    use crate::store::types::{DatumSamples, ObjectKind};
    use crate::zones::StaticZones;

    #[test]
    fn test_audit_rolls_up_counts() {
        let clock = TestClock::at(ts("2024-03-10T09:15:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new()
            .with_instantaneous("watts", 1.0)
            .with_accumulating("wattHours", 10.0);

        let id = store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:00:00Z"), &samples).unwrap();
        store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:30:00Z"), &samples).unwrap();
        clock.set(ts("2024-03-10T10:05:00Z"));
        store.append(1, "m", ObjectKind::Node, ts("2024-03-10T09:30:00Z"), &samples).unwrap();
        store
            .query_raw(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-11T00:00:00Z")))
            .unwrap();

        AggregationEngine::new(store.clone(), Arc::new(StaticZones::default()))
            .with_cyclic(false)
            .drain()
            .unwrap();
        let accounting = AccountingEngine::new(store.clone());
        assert_eq!(accounting.drain().unwrap(), 3);

        let day = store.query_audit(id, AggregateLevel::Day, None).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].datum_count, 3);
        assert_eq!(day[0].prop_count, 6);
        assert_eq!(day[0].datum_query_count, 3);
        assert_eq!(day[0].datum_hourly_count, 2);

        let month = store.query_audit(id, AggregateLevel::Month, None).unwrap();
        assert_eq!(month[0].bucket_start, ts("2024-03-01T00:00:00Z"));
        assert_eq!(month[0].datum_count, 3);
        assert_eq!(month[0].datum_hourly_count, 2);
        assert_eq!(month[0].datum_daily_count, 1);
        assert_eq!(month[0].datum_monthly_count, 1);

        let total = store.query_audit(id, AggregateLevel::RunningTotal, None).unwrap();
        assert_eq!(total.len(), 1);
        assert_eq!(total[0].bucket_start, buckets::epoch());
        assert_eq!(total[0].datum_count, 3);
        assert_eq!(total[0].datum_monthly_count, 1);

        assert!(store.list_stale(StaleQueue::Audit, None).unwrap().is_empty());
    }

    #[test]
    fn test_month_counts_follow_late_aggregation() {
        let clock = TestClock::at(ts("2024-03-12T09:15:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_accumulating("wattHours", 10.0);
        let id = store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:00:00Z"), &samples).unwrap();
        store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:30:00Z"), &samples).unwrap();

        let aggregation =
            AggregationEngine::new(store.clone(), Arc::new(StaticZones::default())).with_cyclic(false);
        let accounting = AccountingEngine::new(store.clone());

        // Accounting runs ahead while only the hour exists
        aggregation.process_next(AggregateLevel::Hour).unwrap();
        accounting.drain().unwrap();
        let month = store.query_audit(id, AggregateLevel::Month, None).unwrap();
        assert_eq!(month[0].datum_daily_count, 0);

        aggregation.drain().unwrap();
        accounting.drain().unwrap();

        let month = store.query_audit(id, AggregateLevel::Month, None).unwrap();
        assert_eq!(month.len(), 1);
        assert_eq!(month[0].datum_daily_count, 1);
        assert_eq!(month[0].datum_monthly_count, 1);
        assert!(store.list_stale(StaleQueue::Audit, None).unwrap().is_empty());
    }

    #[test]
    fn test_summary_over_hours() {
        let clock = TestClock::at(ts("2024-03-10T09:15:00Z"));
        let store = memory_store(&clock);
        let samples = DatumSamples::new().with_instantaneous("watts", 1.0);
        let id = store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:00:00Z"), &samples).unwrap();
        clock.set(ts("2024-03-10T11:15:00Z"));
        store.append(1, "m", ObjectKind::Node, ts("2024-03-10T08:01:00Z"), &samples).unwrap();

        let summary = store
            .audit_summary(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-10T10:00:00Z")))
            .unwrap();
        assert_eq!(summary.datum_count, 1);
    }

    #[test]
    fn test_empty_bucket_has_no_row() {
        let clock = TestClock::at(ts("2024-03-10T09:15:00Z"));
        let store = memory_store(&clock);
        let accounting = AccountingEngine::new(store.clone());
        let id = uuid::Uuid::new_v4();
        assert!(accounting
            .recompute(id, ts("2024-03-10T00:00:00Z"), AggregateLevel::Day)
            .unwrap()
            .is_none());
    }
}
