//! Stream time zones

use crate::store::types::{ObjectKind, StreamMetadata};
use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;

/// Resolves the local offset of a stream's owning object
pub trait ZoneLookup: Send + Sync {
    fn offset_for(&self, meta: &StreamMetadata) -> FixedOffset;
}

/// Fixed per-object offsets with a default
#[derive(Debug, Clone)]
pub struct StaticZones {
    default: FixedOffset,
    overrides: HashMap<(ObjectKind, i64), FixedOffset>,
}

impl StaticZones {
    pub fn new(default: FixedOffset) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_object(mut self, kind: ObjectKind, object_id: i64, offset: FixedOffset) -> Self {
        self.overrides.insert((kind, object_id), offset);
        self
    }
}

impl Default for StaticZones {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl ZoneLookup for StaticZones {
    fn offset_for(&self, meta: &StreamMetadata) -> FixedOffset {
        self.overrides
            .get(&(meta.kind, meta.object_id))
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::PropertyNames;
    use uuid::Uuid;

    fn meta(kind: ObjectKind, object_id: i64) -> StreamMetadata {
        StreamMetadata {
            stream_id: Uuid::new_v4(),
            object_id,
            source_id: "s".to_string(),
            kind,
            property_names: PropertyNames::default(),
        }
    }

    #[test]
    fn test_override_by_kind_and_object() {
        let nz = FixedOffset::east_opt(12 * 3600).unwrap();
        let zones = StaticZones::default().with_object(ObjectKind::Node, 5, nz);

        assert_eq!(zones.offset_for(&meta(ObjectKind::Node, 5)), nz);
        assert_eq!(zones.offset_for(&meta(ObjectKind::Location, 5)).local_minus_utc(), 0);
        assert_eq!(zones.offset_for(&meta(ObjectKind::Node, 6)).local_minus_utc(), 0);
    }
}
