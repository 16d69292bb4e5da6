//! Bucket summaries: raw rows into aggregates, aggregates into coarser aggregates

use crate::store::types::{AccumulatingStats, AggregateDatum, DatumRecord, InstantaneousStats, TimeRange};

/// Instantaneous summary of one bucket of raw rows
///
/// `rows` are the in-bucket rows in ascending order, `prior` the latest row
/// before the bucket. A reading holds until the next reading of the same
/// property; the prior reading carries in from `range.start`, and the last
/// in-bucket reading holds until `range.end` only when `has_later` says a raw
/// row exists after the bucket. Stats cover in-bucket samples only.
pub fn summarize_instantaneous(
    rows: &[DatumRecord],
    prior: Option<&DatumRecord>,
    has_later: bool,
    range: TimeRange,
) -> (Vec<Option<f64>>, Vec<Option<InstantaneousStats>>) {
    let width = rows.iter().map(|r| r.instantaneous.len()).max().unwrap_or(0);
    let mut values = Vec::with_capacity(width);
    let mut stats = Vec::with_capacity(width);

    for idx in 0..width {
        let samples: Vec<(i64, f64)> = rows
            .iter()
            .filter_map(|r| r.instantaneous_at(idx).map(|v| (r.timestamp.timestamp_millis(), v)))
            .collect();

        let Some(&(_, first)) = samples.first() else {
            values.push(None);
            stats.push(None);
            continue;
        };

        let (min, max) = samples
            .iter()
            .fold((first, first), |(lo, hi), &(_, v)| (lo.min(v), hi.max(v)));
        stats.push(Some(InstantaneousStats {
            count: samples.len() as u64,
            min,
            max,
        }));

        // Piecewise-constant segments
        let mut segments: Vec<(i64, f64)> = Vec::with_capacity(samples.len() + 1);
        if let Some(carry) = prior.and_then(|p| p.instantaneous_at(idx)) {
            segments.push((range.start.timestamp_millis(), carry));
        }
        segments.extend(samples.iter().copied());

        let end_ms = range.end.timestamp_millis();
        let mut weighted = 0.0;
        let mut total = 0i64;
        for (i, &(t, v)) in segments.iter().enumerate() {
            let until = match segments.get(i + 1) {
                Some(&(next_t, _)) => next_t,
                None if has_later => end_ms,
                None => t,
            };
            let held = until - t;
            weighted += v * held as f64;
            total += held;
        }

        let value = if total > 0 {
            weighted / total as f64
        } else {
            samples.iter().map(|&(_, v)| v).sum::<f64>() / samples.len() as f64
        };
        values.push(Some(value));
    }

    (values, stats)
}

/// Raw accumulating samples seen in the bucket
pub fn summarize_accumulating(rows: &[DatumRecord]) -> Vec<Option<AccumulatingStats>> {
    let width = rows.iter().map(|r| r.accumulating.len()).max().unwrap_or(0);
    (0..width)
        .map(|idx| {
            rows.iter()
                .filter_map(|r| r.accumulating_at(idx))
                .fold(None, |acc: Option<AccumulatingStats>, v| {
                    Some(match acc {
                        None => AccumulatingStats { count: 1, start: v, end: v },
                        Some(s) => AccumulatingStats {
                            count: s.count + 1,
                            start: s.start.min(v),
                            end: s.end.max(v),
                        },
                    })
                })
        })
        .collect()
}

/// Child aggregates folded into one coarser bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Folded {
    pub instantaneous: Vec<Option<f64>>,
    pub instantaneous_stats: Vec<Option<InstantaneousStats>>,
    pub accumulating_sum: Vec<Option<f64>>,
    pub accumulating_mean: Vec<Option<f64>>,
    pub accumulating_stats: Vec<Option<AccumulatingStats>>,
}

/// Count-weighted means, summed counts, min of mins and max of maxes
pub fn fold_children(children: &[AggregateDatum]) -> Folded {
    let inst_width = children.iter().map(|c| c.instantaneous.len()).max().unwrap_or(0);
    let acc_width = children.iter().map(|c| c.accumulating.len()).max().unwrap_or(0);
    let mut folded = Folded::default();

    for idx in 0..inst_width {
        let mut weighted = 0.0;
        let mut weight = 0u64;
        let mut stats: Option<InstantaneousStats> = None;

        for child in children {
            let child_stats = child.instantaneous_stats.get(idx).copied().flatten();
            if let Some(v) = child.instantaneous.get(idx).copied().flatten() {
                let w = child_stats.map(|s| s.count).unwrap_or(1).max(1);
                weighted += v * w as f64;
                weight += w;
            }
            if let Some(s) = child_stats {
                stats = Some(match stats {
                    None => s,
                    Some(acc) => InstantaneousStats {
                        count: acc.count + s.count,
                        min: acc.min.min(s.min),
                        max: acc.max.max(s.max),
                    },
                });
            }
        }

        folded
            .instantaneous
            .push((weight > 0).then(|| weighted / weight as f64));
        folded.instantaneous_stats.push(stats);
    }

    for idx in 0..acc_width {
        let values: Vec<f64> = children
            .iter()
            .filter_map(|c| c.accumulating.get(idx).copied().flatten())
            .collect();
        let sum: f64 = values.iter().sum();
        let present = !values.is_empty();
        folded.accumulating_sum.push(present.then_some(sum));
        folded
            .accumulating_mean
            .push(present.then(|| sum / values.len() as f64));

        let stats = children
            .iter()
            .filter_map(|c| c.accumulating_stats.get(idx).copied().flatten())
            .reduce(|acc, s| AccumulatingStats {
                count: acc.count + s.count,
                start: acc.start.min(s.start),
                end: acc.end.max(s.end),
            });
        folded.accumulating_stats.push(stats);
    }

    folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::test_support::ts;
    use crate::store::types::AggregateLevel;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn row(at: &str, inst: Option<f64>, acc: Option<f64>) -> DatumRecord {
        DatumRecord {
            stream_id: Uuid::nil(),
            timestamp: ts(at),
            received_at: ts(at),
            instantaneous: vec![inst],
            accumulating: vec![acc],
            status: vec![],
            tags: BTreeSet::new(),
        }
    }

    fn hour_range(start: &str) -> TimeRange {
        let s = ts(start);
        TimeRange::new(s, s + chrono::Duration::hours(1))
    }

    #[test]
    fn test_time_weighted_mean_with_carry_in() {
        let prior = row("2024-03-10T08:40:00Z", Some(10.0), None);
        let rows = vec![row("2024-03-10T09:30:00Z", Some(20.0), None)];

        let (values, stats) =
            summarize_instantaneous(&rows, Some(&prior), true, hour_range("2024-03-10T09:00:00Z"));
        assert_eq!(values, vec![Some(15.0)]);
        assert_eq!(stats, vec![Some(InstantaneousStats { count: 1, min: 20.0, max: 20.0 })]);
    }

    #[test]
    fn test_last_reading_holds_only_with_later_row() {
        let rows = vec![
            row("2024-03-10T09:00:00Z", Some(10.0), None),
            row("2024-03-10T09:15:00Z", Some(30.0), None),
        ];
        let range = hour_range("2024-03-10T09:00:00Z");

        // Without later data the last reading has zero weight
        let (values, _) = summarize_instantaneous(&rows, None, false, range);
        assert_eq!(values, vec![Some(10.0)]);

        // With later data it holds for the remaining 45 minutes
        let (values, _) = summarize_instantaneous(&rows, None, true, range);
        assert_eq!(values, vec![Some(25.0)]);
    }

    #[test]
    fn test_single_sample_falls_back_to_plain_mean() {
        let rows = vec![row("2024-03-10T09:10:00Z", Some(7.0), Some(3.0))];
        let (values, stats) =
            summarize_instantaneous(&rows, None, false, hour_range("2024-03-10T09:00:00Z"));
        assert_eq!(values, vec![Some(7.0)]);
        assert_eq!(stats[0].unwrap().count, 1);
    }

    #[test]
    fn test_null_samples_are_skipped() {
        let rows = vec![
            row("2024-03-10T09:00:00Z", None, Some(100.0)),
            row("2024-03-10T09:30:00Z", None, Some(130.0)),
        ];
        let (values, stats) =
            summarize_instantaneous(&rows, None, false, hour_range("2024-03-10T09:00:00Z"));
        assert_eq!(values, vec![None]);
        assert_eq!(stats, vec![None]);

        let acc = summarize_accumulating(&rows);
        assert_eq!(acc, vec![Some(AccumulatingStats { count: 2, start: 100.0, end: 130.0 })]);
    }

    #[test]
    fn test_fold_weights_by_count() {
        let child = |mean: f64, count: u64, min: f64, max: f64, acc: f64| AggregateDatum {
            stream_id: Uuid::nil(),
            timestamp: ts("2024-03-10T00:00:00Z"),
            level: AggregateLevel::Day,
            instantaneous: vec![Some(mean)],
            instantaneous_stats: vec![Some(InstantaneousStats { count, min, max })],
            accumulating: vec![Some(acc)],
            accumulating_stats: vec![Some(AccumulatingStats { count, start: acc, end: acc * 2.0 })],
        };

        let folded = fold_children(&[child(10.0, 1, 10.0, 10.0, 4.0), child(20.0, 3, 15.0, 25.0, 8.0)]);
        assert_eq!(folded.instantaneous, vec![Some(17.5)]);
        assert_eq!(
            folded.instantaneous_stats,
            vec![Some(InstantaneousStats { count: 4, min: 10.0, max: 25.0 })]
        );
        assert_eq!(folded.accumulating_sum, vec![Some(12.0)]);
        assert_eq!(folded.accumulating_mean, vec![Some(6.0)]);
        assert_eq!(
            folded.accumulating_stats,
            vec![Some(AccumulatingStats { count: 4, start: 4.0, end: 16.0 })]
        );
    }
}
