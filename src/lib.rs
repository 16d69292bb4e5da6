//! datumflow: time-series datum store with staleness-driven rollups
//!
//! Writes land in the raw store and mark their hour stale; background
//! workers recompute stale buckets (hour, day, month, running total and the
//! cyclic hour-of-day / day-of-week levels) and roll usage counters up the
//! same way. Readings between samples are reconstructed on demand.

pub mod audit;
pub mod config;
pub mod error;
pub mod interpolate;
pub mod rollup;
pub mod sqlite_pragma;
pub mod store;
pub mod worker;
pub mod zones;

pub use audit::AccountingEngine;
pub use config::EngineConfig;
pub use error::{DatumError, Result};
pub use rollup::AggregationEngine;
pub use store::types::{
    AccumulatingStats, AggregateDatum, AggregateLevel, AuditDatum, DatumRecord, DatumSamples,
    InstantaneousStats, ObjectKind, PropertyNames, PropertyType, StaleDatum, StreamId,
    StreamMetadata, TimeRange,
};
pub use store::{DatumStore, StaleClaim, StaleQueue, StoreOptions};
pub use worker::StaleProcessor;
pub use zones::{StaticZones, ZoneLookup};
