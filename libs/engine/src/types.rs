//! Core engine types: resource metadata, revision bookkeeping, binary
//! references and indexed-field declarations.
//!
//! `ResourceMeta` and `RevisionInfo` are internal structs: unknown fields are
//! ignored on decode so old engines can read artefacts written by newer ones.
//! User record types are decoded strictly by deriving
//! `#[serde(deny_unknown_fields)]` on the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    Draft,
    Stable,
}

/// Mutable per-resource record; always reflects the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub resource_id: String,
    pub current_revision_id: String,
    pub total_revision_count: u64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub schema_version: Option<String>,
    /// Projection of the current revision's payload through the declared
    /// indexed fields, keyed by full field path.
    #[serde(default)]
    pub indexed_data: Map<String, Value>,
}

/// Immutable per-revision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub uid: Uuid,
    pub resource_id: String,
    pub revision_id: String,
    /// None only for a resource's first revision.
    #[serde(default)]
    pub parent_revision_id: Option<String>,
    pub status: RevisionStatus,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub data_hash: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

impl RevisionInfo {
    /// Sequence number encoded in the revision id (`"<resource_id>:<n>"`).
    pub fn sequence(&self) -> Option<u64> {
        revision_sequence(&self.revision_id)
    }
}

/// Parses the trailing sequence number out of a revision id.
pub fn revision_sequence(revision_id: &str) -> Option<u64> {
    revision_id.rsplit(':').next()?.parse().ok()
}

/// One revision of a resource: bookkeeping plus the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource<T> {
    pub info: RevisionInfo,
    pub data: T,
}

/// Large binary payload field.
///
/// Declared inline with raw `data`; promoted to a blob reference
/// (`file_id`/`size`/`content_type`, bytes elided) before the payload is
/// persisted. Reads return the reference; callers dereference through
/// `get_blob`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Binary {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_bytes::ByteBuf>,
}

impl Binary {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Binary {
            size: Some(data.len() as u64),
            data: Some(serde_bytes::ByteBuf::from(data)),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Blob reference with bytes elided.
    pub fn reference(file_id: impl Into<String>, size: u64, content_type: Option<String>) -> Self {
        Binary {
            file_id: Some(file_id.into()),
            size: Some(size),
            content_type,
            data: None,
        }
    }
}

/// Declares one payload field to project into `ResourceMeta.indexed_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexableField {
    pub field_path: String,
}

impl IndexableField {
    pub fn new(field_path: impl Into<String>) -> Self {
        IndexableField {
            field_path: field_path.into(),
        }
    }
}

impl<S: Into<String>> From<S> for IndexableField {
    fn from(field_path: S) -> Self {
        IndexableField::new(field_path)
    }
}

/// Walks a dotted field path through a JSON value. Returns `None` when any
/// segment is missing (missing paths are omitted from the projection, not
/// stored as null).
pub fn walk_field_path<'a>(value: &'a Value, field_path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in field_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Builds the indexed projection for a payload value.
pub fn project_indexed_data(value: &Value, fields: &[IndexableField]) -> Map<String, Value> {
    let mut projected = Map::new();
    for field in fields {
        if let Some(found) = walk_field_path(value, &field.field_path) {
            projected.insert(field.field_path.clone(), found.clone());
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_serializes_without_bytes_once_promoted() {
        let reference = Binary::reference("abc", 1024, Some("image/png".into()));
        let encoded = serde_json::to_value(&reference).unwrap();
        assert_eq!(
            encoded,
            json!({"file_id": "abc", "size": 1024, "content_type": "image/png"})
        );
    }

    #[test]
    fn revision_sequence_parses_the_tail() {
        assert_eq!(revision_sequence("widget:550e:3"), Some(3));
        assert_eq!(revision_sequence("widget:550e:abc"), None);
    }

    #[test]
    fn projection_walks_dotted_paths_and_omits_missing() {
        let value = json!({"name": "Widget", "user": {"email": "a@b.c"}, "tags": ["a"]});
        let fields = [
            IndexableField::new("name"),
            IndexableField::new("user.email"),
            IndexableField::new("missing.path"),
        ];
        let projected = project_indexed_data(&value, &fields);
        assert_eq!(projected.get("name"), Some(&json!("Widget")));
        assert_eq!(projected.get("user.email"), Some(&json!("a@b.c")));
        assert!(!projected.contains_key("missing.path"));
    }

    #[test]
    fn internal_structs_tolerate_unknown_fields() {
        let raw = json!({
            "uid": Uuid::nil(),
            "resource_id": "r:1",
            "revision_id": "r:1:1",
            "status": "stable",
            "created_time": "2024-01-01T00:00:00Z",
            "updated_time": "2024-01-01T00:00:00Z",
            "created_by": "u",
            "updated_by": "u",
            "some_future_field": true,
        });
        let info: RevisionInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.parent_revision_id, None);
    }
}
