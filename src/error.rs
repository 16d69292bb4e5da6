//! Error types for the datum store and rollup engines.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for datumflow operations.
pub type Result<T> = std::result::Result<T, DatumError>;

/// Unified error type for the datum store, rollup and audit engines.
///
/// Lost claim races and out-of-range interpolation are not errors: the
/// former surface as `Ok(None)` from a claim, the latter as `Ok(None)`
/// from the interpolator.
#[derive(Error, Debug)]
pub enum DatumError {
    #[error("stream {stream_id} would exceed the limit of {limit} properties")]
    SchemaLimitExceeded { stream_id: Uuid, limit: usize },

    #[error("sample {name} is not a finite number")]
    NonFiniteSample { name: String },

    #[error("unknown stream {0}")]
    UnknownStream(Uuid),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error("configuration error: {0}")]
    Config(String),
}
