//! Usage accounting over the audit staleness queue

pub mod engine;

pub use engine::{AccountingEngine, AUDIT_LEVELS};
