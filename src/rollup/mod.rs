//! Multi-resolution aggregates over the aggregate staleness queue

pub mod buckets;
pub mod engine;
pub mod stats;

pub use engine::{AggregationEngine, CALENDAR_LEVELS, CYCLIC_LEVELS};
