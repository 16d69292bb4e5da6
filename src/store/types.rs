//! Core data structures shared by the store, rollup and audit engines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Stable identifier of one time series
pub type StreamId = Uuid;

/// Kind of object a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Node,
    Location,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Node => "n",
            ObjectKind::Location => "l",
        }
    }

    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "n" => Some(ObjectKind::Node),
            "l" => Some(ObjectKind::Location),
            _ => None,
        }
    }
}

/// How a property is aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyType {
    /// Point-in-time measurement, summarized by mean/min/max
    Instantaneous,
    /// Monotonic counter, summarized by difference
    Accumulating,
    /// Free-form text, never aggregated
    Status,
}

/// Ordered property names per type; a name's index is its column in every row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNames {
    pub instantaneous: Vec<String>,
    pub accumulating: Vec<String>,
    pub status: Vec<String>,
}

impl PropertyNames {
    pub fn names(&self, ty: PropertyType) -> &[String] {
        match ty {
            PropertyType::Instantaneous => &self.instantaneous,
            PropertyType::Accumulating => &self.accumulating,
            PropertyType::Status => &self.status,
        }
    }

    fn names_mut(&mut self, ty: PropertyType) -> &mut Vec<String> {
        match ty {
            PropertyType::Instantaneous => &mut self.instantaneous,
            PropertyType::Accumulating => &mut self.accumulating,
            PropertyType::Status => &mut self.status,
        }
    }

    pub fn position(&self, ty: PropertyType, name: &str) -> Option<usize> {
        self.names(ty).iter().position(|n| n == name)
    }

    /// Position of `name`, appending it when unseen. Returns `(index, appended)`.
    pub fn position_or_append(&mut self, ty: PropertyType, name: &str) -> (usize, bool) {
        match self.position(ty, name) {
            Some(idx) => (idx, false),
            None => {
                let names = self.names_mut(ty);
                names.push(name.to_string());
                (names.len() - 1, true)
            }
        }
    }

    pub fn total_len(&self) -> usize {
        self.instantaneous.len() + self.accumulating.len() + self.status.len()
    }
}

/// Registry entry for one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_id: StreamId,
    pub object_id: i64,
    pub source_id: String,
    pub kind: ObjectKind,
    pub property_names: PropertyNames,
}

/// Named samples of one reading, as handed to `append`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatumSamples {
    pub instantaneous: BTreeMap<String, f64>,
    pub accumulating: BTreeMap<String, f64>,
    pub status: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
}

impl DatumSamples {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instantaneous(mut self, name: &str, value: f64) -> Self {
        self.instantaneous.insert(name.to_string(), value);
        self
    }

    pub fn with_accumulating(mut self, name: &str, value: f64) -> Self {
        self.accumulating.insert(name.to_string(), value);
        self
    }

    pub fn with_status(mut self, name: &str, value: &str) -> Self {
        self.status.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    /// Observed names in (type, name) order
    pub fn observed_names(&self) -> Vec<(PropertyType, &str)> {
        let inst = self
            .instantaneous
            .keys()
            .map(|k| (PropertyType::Instantaneous, k.as_str()));
        let acc = self
            .accumulating
            .keys()
            .map(|k| (PropertyType::Accumulating, k.as_str()));
        let stat = self.status.keys().map(|k| (PropertyType::Status, k.as_str()));
        inst.chain(acc).chain(stat).collect()
    }

    pub fn property_count(&self) -> usize {
        self.instantaneous.len() + self.accumulating.len() + self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.property_count() == 0 && self.tags.is_empty()
    }

    /// First numeric sample that is NaN or infinite
    pub fn first_non_finite(&self) -> Option<&str> {
        self.instantaneous
            .iter()
            .chain(self.accumulating.iter())
            .find(|(_, value)| !value.is_finite())
            .map(|(name, _)| name.as_str())
    }
}

/// One stored raw reading
///
/// Value vectors are aligned to the stream's property names at write time,
/// so rows written before the schema grew are shorter. `None` means absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumRecord {
    pub stream_id: StreamId,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub instantaneous: Vec<Option<f64>>,
    pub accumulating: Vec<Option<f64>>,
    pub status: Vec<Option<String>>,
    pub tags: BTreeSet<String>,
}

impl DatumRecord {
    pub fn instantaneous_at(&self, idx: usize) -> Option<f64> {
        self.instantaneous.get(idx).copied().flatten()
    }

    pub fn accumulating_at(&self, idx: usize) -> Option<f64> {
        self.accumulating.get(idx).copied().flatten()
    }
}

/// Aggregation level of an `AggregateDatum` or stale queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateLevel {
    Hour,
    Day,
    Month,
    RunningTotal,
    DayOfWeek,
    HourOfDay,
    SeasonalDayOfWeek,
    SeasonalHourOfDay,
}

impl AggregateLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateLevel::Hour => "h",
            AggregateLevel::Day => "d",
            AggregateLevel::Month => "M",
            AggregateLevel::RunningTotal => "rt",
            AggregateLevel::DayOfWeek => "wd",
            AggregateLevel::HourOfDay => "hd",
            AggregateLevel::SeasonalDayOfWeek => "swd",
            AggregateLevel::SeasonalHourOfDay => "shd",
        }
    }

    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "h" => Some(AggregateLevel::Hour),
            "d" => Some(AggregateLevel::Day),
            "M" => Some(AggregateLevel::Month),
            "rt" => Some(AggregateLevel::RunningTotal),
            "wd" => Some(AggregateLevel::DayOfWeek),
            "hd" => Some(AggregateLevel::HourOfDay),
            "swd" => Some(AggregateLevel::SeasonalDayOfWeek),
            "shd" => Some(AggregateLevel::SeasonalHourOfDay),
            _ => None,
        }
    }

    /// Levels keyed by a calendar label instead of a single time bucket
    pub fn is_cyclic(&self) -> bool {
        matches!(
            self,
            AggregateLevel::DayOfWeek
                | AggregateLevel::HourOfDay
                | AggregateLevel::SeasonalDayOfWeek
                | AggregateLevel::SeasonalHourOfDay
        )
    }

    /// Staleness cascade target
    pub fn next_coarser(&self) -> Option<AggregateLevel> {
        match self {
            AggregateLevel::Hour => Some(AggregateLevel::Day),
            AggregateLevel::Day => Some(AggregateLevel::Month),
            AggregateLevel::Month => Some(AggregateLevel::RunningTotal),
            _ => None,
        }
    }

    /// Cyclic levels folded from buckets at this level
    pub fn cyclic_dependents(&self) -> &'static [AggregateLevel] {
        match self {
            AggregateLevel::Hour => &[
                AggregateLevel::HourOfDay,
                AggregateLevel::SeasonalHourOfDay,
            ],
            AggregateLevel::Day => &[
                AggregateLevel::DayOfWeek,
                AggregateLevel::SeasonalDayOfWeek,
            ],
            _ => &[],
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstantaneousStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

/// Raw accumulating samples seen inside a bucket (diagnostic only)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccumulatingStats {
    pub count: u64,
    pub start: f64,
    pub end: f64,
}

/// Computed aggregate for one (stream, level, bucket)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDatum {
    pub stream_id: StreamId,
    pub timestamp: DateTime<Utc>,
    pub level: AggregateLevel,
    pub instantaneous: Vec<Option<f64>>,
    pub instantaneous_stats: Vec<Option<InstantaneousStats>>,
    pub accumulating: Vec<Option<f64>>,
    pub accumulating_stats: Vec<Option<AccumulatingStats>>,
}

/// Stale queue row key, shared by the aggregate and audit queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StaleDatum {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub level: AggregateLevel,
}

pub type StaleAggregateDatum = StaleDatum;
pub type StaleAuditDatum = StaleDatum;

/// Usage counters for one (stream, level, bucket)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDatum {
    pub stream_id: StreamId,
    pub bucket_start: DateTime<Utc>,
    pub level: AggregateLevel,
    pub datum_count: i64,
    pub prop_count: i64,
    pub datum_query_count: i64,
    pub datum_hourly_count: i64,
    pub datum_daily_count: i64,
    pub datum_monthly_count: i64,
}
