//! SQLite connection tuning shared by every store connection.

use rusqlite::Connection;
use std::time::Duration;

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply the PRAGMAs every datumflow connection runs with.
///
/// - `journal_mode = WAL` so readers never block the ingest writer
/// - `synchronous = NORMAL` (safe with WAL)
/// - `temp_store = MEMORY`
/// - `wal_autocheckpoint = 1000` pages
/// - busy timeout so concurrent claimers queue up instead of failing
///
/// In-memory databases report `memory` for the journal mode; that is fine.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal_mode={}", mode);

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    let _checkpoint: i64 =
        conn.pragma_update_and_check(None, "wal_autocheckpoint", 1000, |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}
