//! SQLite persistence: registry, raw datum, aggregates, audit counters and stale queues

pub mod aggregates;
pub mod counters;
pub mod db;
pub mod ingest;
pub mod queue;
pub mod registry;
pub mod types;

pub use db::{DatumStore, NowFn, StoreOptions};
pub use queue::{StaleClaim, StaleQueue};
