//! End-to-end: ingest through several store handles on one database file,
//! drain both queues, then read aggregates, audit rows and interpolations.

use chrono::{DateTime, Duration, Utc};
use datumflow::worker::run_stale_pass;
use datumflow::{
    AccountingEngine, AggregateLevel, AggregationEngine, DatumSamples, DatumStore, ObjectKind,
    StaleQueue, StaticZones, StoreOptions, TimeRange,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn open_at(path: &Path, now: DateTime<Utc>) -> Arc<DatumStore> {
    Arc::new(
        DatumStore::open(
            path,
            StoreOptions {
                max_properties: 16,
                now_fn: Arc::new(move || now),
            },
        )
        .unwrap(),
    )
}

fn create_test_db() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("datumflow.db");
    (dir, path)
}

#[test]
fn test_ingest_and_drain_across_connections() {
    let (_dir, path) = create_test_db();
    let now = ts("2024-04-02T06:00:00Z");
    let writer = open_at(&path, now);

    // One day of quarter-hourly readings
    let start = ts("2024-03-31T00:00:00Z");
    let mut stream_id = None;
    for i in 0..96 {
        let t = start + Duration::minutes(15 * i);
        let samples = DatumSamples::new()
            .with_instantaneous("watts", if i % 2 == 0 { 100.0 } else { 300.0 })
            .with_accumulating("wattHours", 1000.0 + 50.0 * i as f64);
        stream_id = Some(writer.append(42, "inverter/1", ObjectKind::Node, t, &samples).unwrap());
    }
    let stream_id = stream_id.unwrap();

    assert_eq!(writer.list_stale(StaleQueue::Aggregate, Some(AggregateLevel::Hour)).unwrap().len(), 24);

    // Two worker handles race for the same queue; every bucket is processed once
    let zones = Arc::new(StaticZones::default());
    let a = AggregationEngine::new(open_at(&path, now), zones.clone());
    let b = AggregationEngine::new(open_at(&path, now), zones);
    let mut processed = 0;
    loop {
        let pa = a.process_next(AggregateLevel::Hour).unwrap();
        let pb = b.process_next(AggregateLevel::Hour).unwrap();
        if let (Some(x), Some(y)) = (pa, pb) {
            assert_ne!(x, y);
        }
        let n = pa.is_some() as usize + pb.is_some() as usize;
        if n == 0 {
            break;
        }
        processed += n;
    }
    assert_eq!(processed, 24);
    a.drain().unwrap();
    assert!(writer.list_stale(StaleQueue::Aggregate, None).unwrap().is_empty());

    let hours = writer.query_aggregate(stream_id, AggregateLevel::Hour, None).unwrap();
    assert_eq!(hours.len(), 24);
    // Each hour gains 4 readings * 50 Wh; the next hour's first reading bounds it
    for hour in &hours[..23] {
        assert_eq!(hour.accumulating, vec![Some(200.0)]);
        assert_eq!(hour.instantaneous_stats[0].unwrap().count, 4);
    }

    let day = writer.query_aggregate(stream_id, AggregateLevel::Day, None).unwrap();
    assert_eq!(day.len(), 1);
    // First reading 1000, last reading 1000 + 95 * 50
    assert_eq!(day[0].accumulating, vec![Some(4750.0)]);
    assert_eq!(day[0].instantaneous_stats[0].unwrap().count, 96);
    assert_eq!(day[0].instantaneous_stats[0].unwrap().min, 100.0);
    assert_eq!(day[0].instantaneous_stats[0].unwrap().max, 300.0);

    // The March month has ended, so the running total folds the month row
    let total = writer.query_aggregate(stream_id, AggregateLevel::RunningTotal, None).unwrap();
    assert_eq!(total.len(), 1);
    assert_eq!(total[0].timestamp, ts("2024-04-02T00:00:00Z"));
    assert_eq!(total[0].accumulating, vec![Some(4750.0)]);

    assert_eq!(writer.count_aggregates(stream_id, AggregateLevel::Hour, None).unwrap(), Some(24));
    assert_eq!(writer.count_aggregates(stream_id, AggregateLevel::HourOfDay, None).unwrap(), None);
    assert_eq!(writer.query_aggregate(stream_id, AggregateLevel::HourOfDay, None).unwrap().len(), 24);
}

#[tokio::test]
async fn test_audit_after_worker_passes() {
    let (_dir, path) = create_test_db();
    let now = ts("2024-03-10T12:30:00Z");
    let store = open_at(&path, now);

    let samples = DatumSamples::new().with_instantaneous("watts", 5.0).with_tag("grid");
    let id = store.append(7, "meter", ObjectKind::Location, ts("2024-03-10T11:00:00Z"), &samples).unwrap();
    store.append(7, "meter", ObjectKind::Location, ts("2024-03-10T11:10:00Z"), &samples).unwrap();

    let rows = store
        .query_raw(id, TimeRange::new(ts("2024-03-10T00:00:00Z"), ts("2024-03-11T00:00:00Z")))
        .unwrap();
    assert_eq!(rows.len(), 2);

    let aggregation = AggregationEngine::new(store.clone(), Arc::new(StaticZones::default()));
    let accounting = AccountingEngine::new(store.clone());
    assert!(run_stale_pass(&aggregation, 100).await > 0);
    assert_eq!(run_stale_pass(&accounting, 100).await, 3);

    let day = store.query_audit(id, AggregateLevel::Day, None).unwrap();
    assert_eq!(day.len(), 1);
    assert_eq!(day[0].datum_count, 2);
    assert_eq!(day[0].prop_count, 4);
    assert_eq!(day[0].datum_query_count, 2);
    assert_eq!(day[0].datum_hourly_count, 1);
}

#[test]
fn test_interpolation_matches_stored_readings() {
    let (_dir, path) = create_test_db();
    let store = open_at(&path, ts("2024-03-10T12:00:00Z"));
    let id = store
        .append(
            1,
            "meter",
            ObjectKind::Node,
            ts("2024-03-10T00:00:00Z"),
            &DatumSamples::new().with_instantaneous("watts", 10.0).with_accumulating("wattHours", 100.0),
        )
        .unwrap();
    store
        .append(
            1,
            "meter",
            ObjectKind::Node,
            ts("2024-03-10T00:10:00Z"),
            &DatumSamples::new().with_instantaneous("watts", 20.0).with_accumulating("wattHours", 150.0),
        )
        .unwrap();

    let mid = store.interpolate(id, ts("2024-03-10T00:02:30Z")).unwrap().unwrap();
    assert_eq!(mid.instantaneous, vec![Some(12.5)]);
    assert_eq!(mid.accumulating, vec![Some(112.5)]);

    let exact = store.interpolate(id, ts("2024-03-10T00:10:00Z")).unwrap().unwrap();
    assert_eq!(exact.accumulating, vec![Some(150.0)]);

    assert!(store.interpolate(id, ts("2024-03-10T01:00:00Z")).unwrap().is_none());
}
