//! SQLite-backed datum store
//!
//! `DatumStore` owns one connection. Processes (or workers) that need
//! independent claim transactions open their own store on the same file;
//! WAL mode plus `BEGIN IMMEDIATE` claims make that safe.

use crate::error::{DatumError, Result};
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::store::types::StreamId;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Clock used for `received_at`, audit buckets and lease expiry
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Schema files, executed in order; every statement uses IF NOT EXISTS
const MIGRATIONS: &[(&str, &str)] = &[
    ("00_stream_meta.sql", include_str!("../../sql/00_stream_meta.sql")),
    ("01_datum.sql", include_str!("../../sql/01_datum.sql")),
    ("02_agg_datum.sql", include_str!("../../sql/02_agg_datum.sql")),
    ("03_aud_datum.sql", include_str!("../../sql/03_aud_datum.sql")),
];

/// Store-level options
#[derive(Clone)]
pub struct StoreOptions {
    /// Ceiling on distinct property names per stream
    pub max_properties: usize,
    pub now_fn: NowFn,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_properties: 256,
            now_fn: Arc::new(Utc::now),
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("max_properties", &self.max_properties)
            .finish_non_exhaustive()
    }
}

pub struct DatumStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl DatumStore {
    /// Open (or create) the database file and run schema migrations
    pub fn open(db_path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// Private in-memory database (tests, ephemeral tools)
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        apply_optimized_pragmas(&conn)?;
        run_schema_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.options.now_fn)()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DatumError::LockPoisoned)
    }
}

/// Run embedded schema migrations
///
/// Idempotent: safe to run on every open.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        tx.execute_batch(sql)?;
    }
    tx.commit()?;
    log::debug!("✅ Schema migrations applied ({} files)", MIGRATIONS.len());
    Ok(())
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<StreamId> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(row.get(idx)?)
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
