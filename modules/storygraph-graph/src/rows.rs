//! Row decoding shared by the readers and writers.

use chrono::{DateTime, NaiveDateTime, Utc};
use neo4rs::Row;
use serde::Deserialize;
use uuid::Uuid;

use storygraph_common::{
    BranchEdge, Entry, ObjectKind, ObjectRef, StoreResult, StoryGraphError, VersionRecord,
    WorldObject,
};

/// Datetimes are written as naive UTC strings and wrapped in `datetime()` server-side.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

pub(crate) fn field<'a, T: Deserialize<'a>>(row: &'a Row, key: &str) -> StoreResult<T> {
    row.get::<T>(key)
        .map_err(|e| StoryGraphError::Database(format!("column {key}: {e}")))
}

pub(crate) fn opt_string(row: &Row, key: &str) -> Option<String> {
    row.get::<Option<String>>(key).ok().flatten()
}

pub(crate) fn uuid_field(row: &Row, key: &str) -> StoreResult<Uuid> {
    let raw: String = field(row, key)?;
    parse_uuid(key, &raw)
}

pub(crate) fn opt_uuid_field(row: &Row, key: &str) -> StoreResult<Option<Uuid>> {
    opt_string(row, key)
        .map(|raw| parse_uuid(key, &raw))
        .transpose()
}

fn parse_uuid(key: &str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| StoryGraphError::Database(format!("column {key} is not a UUID ({raw}): {e}")))
}

/// Parse a datetime column, falling back to now if missing or unparseable.
pub(crate) fn datetime_field(row: &Row, key: &str) -> DateTime<Utc> {
    if let Ok(dt) = row.get::<DateTime<chrono::FixedOffset>>(key) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = row.get::<NaiveDateTime>(key) {
        return ndt.and_utc();
    }
    if let Ok(s) = row.get::<String>(key) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
            return dt.with_timezone(&Utc);
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f") {
            return ndt.and_utc();
        }
    }
    Utc::now()
}

pub(crate) fn object_kind_field(row: &Row, key: &str) -> StoreResult<ObjectKind> {
    let raw: String = field(row, key)?;
    raw.parse().map_err(StoryGraphError::Database)
}

// --- Projections ---
//
// Each reader/writer query aliases its columns to the names below so the
// decoders can be shared.

/// `RETURN e.id AS entry_id, e.story_id AS entry_story_id, e.text AS entry_text,
///  e.seq AS entry_seq, e.created_at AS entry_created_at, e.branch_root AS entry_branch_root`
pub(crate) const ENTRY_COLUMNS: &str = "e.id AS entry_id, e.story_id AS entry_story_id, \
    e.text AS entry_text, e.seq AS entry_seq, e.created_at AS entry_created_at, \
    coalesce(e.branch_root, false) AS entry_branch_root";

pub(crate) fn entry_from_row(row: &Row) -> StoreResult<Entry> {
    Ok(Entry {
        id: uuid_field(row, "entry_id")?,
        story_id: field(row, "entry_story_id")?,
        text: field(row, "entry_text")?,
        seq: field(row, "entry_seq")?,
        created_at: datetime_field(row, "entry_created_at"),
        branch_root: field(row, "entry_branch_root")?,
    })
}

/// Version columns for a History node bound to `h` and its CURRENT flag.
pub(crate) const VERSION_COLUMNS: &str = "h.id AS version_id, h.object_kind AS version_kind, \
    h.object_id AS version_object_id, h.story_id AS version_story_id, h.state AS version_state, \
    h.seq AS version_seq, coalesce(h.step, 0) AS version_step, h.entry_id AS version_entry_id, \
    h.supersedes AS version_supersedes, h.created_at AS version_created_at, \
    EXISTS { MATCH (h)-[:CURRENT]->() } AS version_is_current";

pub(crate) fn version_from_row(row: &Row) -> StoreResult<VersionRecord> {
    Ok(VersionRecord {
        id: uuid_field(row, "version_id")?,
        object: ObjectRef::new(
            object_kind_field(row, "version_kind")?,
            field::<String>(row, "version_object_id")?,
        ),
        story_id: field(row, "version_story_id")?,
        state: opt_string(row, "version_state").unwrap_or_default(),
        seq: field(row, "version_seq")?,
        step: field(row, "version_step")?,
        entry_id: opt_uuid_field(row, "version_entry_id")?,
        supersedes: opt_uuid_field(row, "version_supersedes")?,
        created_at: datetime_field(row, "version_created_at"),
        is_current: field(row, "version_is_current")?,
    })
}

/// Object columns for a world object bound to `o`; the kind comes from the caller.
pub(crate) const OBJECT_COLUMNS: &str = "o.id AS object_id, coalesce(o.title, o.name, '') AS object_title, \
    coalesce(o.description, '') AS object_description, o.created_at AS object_created_at";

pub(crate) fn object_from_row(row: &Row, kind: ObjectKind) -> StoreResult<WorldObject> {
    Ok(WorldObject {
        object: ObjectRef::new(kind, field::<String>(row, "object_id")?),
        title: field(row, "object_title")?,
        description: field(row, "object_description")?,
        created_at: datetime_field(row, "object_created_at"),
    })
}

/// Branch edge columns for `(src)-[b:BRANCH]->(dst)`.
pub(crate) const BRANCH_COLUMNS: &str = "src.id AS branch_from, dst.id AS branch_to, \
    b.title AS branch_title, b.id AS branch_id";

pub(crate) fn branch_from_row(row: &Row) -> StoreResult<BranchEdge> {
    Ok(BranchEdge {
        from: uuid_field(row, "branch_from")?,
        to: uuid_field(row, "branch_to")?,
        title: opt_string(row, "branch_title"),
        branch_id: opt_string(row, "branch_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datetimes_format_without_timezone() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_datetime(&dt), "2025-03-01T12:30:05.000000");
    }

    #[test]
    fn uuid_parse_errors_name_the_column() {
        let err = parse_uuid("entry_id", "not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("entry_id"));
    }
}
