//! Stream registry: (object, source, kind) -> stream id and property schema

use crate::error::{DatumError, Result};
use crate::store::db::{json_col, to_millis, uuid_col, DatumStore};
use crate::store::types::{ObjectKind, PropertyNames, PropertyType, StreamId, StreamMetadata};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const META_COLUMNS: &str =
    "stream_id, object_id, source_id, kind, names_i, names_a, names_s";

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<StreamMetadata> {
    let kind_str: String = row.get(3)?;
    let kind = ObjectKind::from_key(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("invalid object kind: {}", kind_str).into(),
        )
    })?;

    Ok(StreamMetadata {
        stream_id: uuid_col(row, 0)?,
        object_id: row.get(1)?,
        source_id: row.get(2)?,
        kind,
        property_names: PropertyNames {
            instantaneous: json_col(row, 4)?,
            accumulating: json_col(row, 5)?,
            status: json_col(row, 6)?,
        },
    })
}

/// Look up a stream's metadata by id
pub fn load_stream(conn: &Connection, stream_id: StreamId) -> Result<Option<StreamMetadata>> {
    let sql = format!("SELECT {} FROM da_stream_meta WHERE stream_id = ?1", META_COLUMNS);
    let meta = conn
        .query_row(&sql, [stream_id.to_string()], meta_from_row)
        .optional()?;
    Ok(meta)
}

/// Look up a stream by its natural key
pub fn find_stream(
    conn: &Connection,
    object_id: i64,
    source_id: &str,
    kind: ObjectKind,
) -> Result<Option<StreamMetadata>> {
    let sql = format!(
        "SELECT {} FROM da_stream_meta WHERE object_id = ?1 AND source_id = ?2 AND kind = ?3",
        META_COLUMNS
    );
    let meta = conn
        .query_row(&sql, params![object_id, source_id, kind.as_str()], meta_from_row)
        .optional()?;
    Ok(meta)
}

/// All streams of one object, ordered by source id
pub fn list_streams(conn: &Connection, object_id: i64, kind: ObjectKind) -> Result<Vec<StreamMetadata>> {
    let sql = format!(
        "SELECT {} FROM da_stream_meta WHERE object_id = ?1 AND kind = ?2 ORDER BY source_id",
        META_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![object_id, kind.as_str()], meta_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Look up or create the stream for `(object_id, source_id, kind)`
///
/// Insert-or-fetch: concurrent first writers race on the UNIQUE key and
/// all end up reading the single winning row.
pub fn resolve_stream(
    conn: &Connection,
    object_id: i64,
    source_id: &str,
    kind: ObjectKind,
    now: DateTime<Utc>,
) -> Result<StreamMetadata> {
    let candidate = Uuid::new_v4();
    let created = conn.execute(
        "INSERT INTO da_stream_meta (stream_id, object_id, source_id, kind, created)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(object_id, source_id, kind) DO NOTHING",
        params![
            candidate.to_string(),
            object_id,
            source_id,
            kind.as_str(),
            to_millis(now)
        ],
    )?;

    if created > 0 {
        log::debug!(
            "🆕 Created stream {} for {}:{}:{}",
            candidate,
            kind.as_str(),
            object_id,
            source_id
        );
    }

    find_stream(conn, object_id, source_id, kind)?.ok_or_else(|| {
        DatumError::Corrupt(format!(
            "stream for {}:{}:{} missing after insert",
            kind.as_str(),
            object_id,
            source_id
        ))
    })
}

/// Make sure every observed property has a column, returning stable positions
///
/// Positions are returned in the order of `observed`. Unseen names are
/// appended; existing names never move. Growth past `limit` total
/// properties fails with `SchemaLimitExceeded` and changes nothing.
pub fn ensure_properties(
    conn: &Connection,
    stream_id: StreamId,
    observed: &[(PropertyType, &str)],
    limit: usize,
) -> Result<(PropertyNames, Vec<usize>)> {
    let meta = load_stream(conn, stream_id)?.ok_or(DatumError::UnknownStream(stream_id))?;
    let mut names = meta.property_names;

    let mut positions = Vec::with_capacity(observed.len());
    let mut grew = false;
    for (ty, name) in observed {
        let (idx, appended) = names.position_or_append(*ty, name);
        grew |= appended;
        positions.push(idx);
    }

    if grew {
        if names.total_len() > limit {
            return Err(DatumError::SchemaLimitExceeded { stream_id, limit });
        }
        conn.execute(
            "UPDATE da_stream_meta SET names_i = ?2, names_a = ?3, names_s = ?4
             WHERE stream_id = ?1",
            params![
                stream_id.to_string(),
                serde_json::to_string(&names.instantaneous)?,
                serde_json::to_string(&names.accumulating)?,
                serde_json::to_string(&names.status)?,
            ],
        )?;
    }

    Ok((names, positions))
}

impl DatumStore {
    pub fn load_stream(&self, stream_id: StreamId) -> Result<Option<StreamMetadata>> {
        let conn = self.conn()?;
        load_stream(&conn, stream_id)
    }

    pub fn find_stream(
        &self,
        object_id: i64,
        source_id: &str,
        kind: ObjectKind,
    ) -> Result<Option<StreamMetadata>> {
        let conn = self.conn()?;
        find_stream(&conn, object_id, source_id, kind)
    }

    pub fn list_streams(&self, object_id: i64, kind: ObjectKind) -> Result<Vec<StreamMetadata>> {
        let conn = self.conn()?;
        list_streams(&conn, object_id, kind)
    }

    pub fn resolve_stream(
        &self,
        object_id: i64,
        source_id: &str,
        kind: ObjectKind,
    ) -> Result<StreamMetadata> {
        let now = self.now();
        let conn = self.conn()?;
        resolve_stream(&conn, object_id, source_id, kind, now)
    }

    /// Schema growth under the store's property ceiling, in its own transaction
    pub fn ensure_properties(
        &self,
        stream_id: StreamId,
        observed: &[(PropertyType, &str)],
    ) -> Result<Vec<usize>> {
        let limit = self.options().max_properties;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let (_, positions) = ensure_properties(&tx, stream_id, observed, limit)?;
        tx.commit()?;
        Ok(positions)
    }
}
