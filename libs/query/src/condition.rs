//! Condition tree data model.
//!
//! A query is a tree of [`ConditionNode`]s (leaves compare one field against
//! one value, groups combine child nodes with a logic operator), an ordered
//! sort list, and pagination. The tree is built at runtime from field-path
//! strings and translated into backend predicates by each meta store; the
//! meta-field/data-field routing decision lives in [`is_meta_field`] so
//! backends resolve it exactly once per leaf.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    InList,
    NotInList,
    /// Key exists and holds JSON null (`value=true`), or exists and holds a
    /// non-null value (`value=false`).
    IsNull,
    /// Key is present at all, null or not.
    Exists,
    /// Extracted value is null or the key is missing.
    Isna,
}

/// Unary transform applied to the indexed value before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    Identity,
    /// Character count for strings, element count for arrays.
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
    Not,
}

/// `(field_path, operator, value)` leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field_path: String,
    pub operator: Operator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<FieldTransform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: LogicOp,
    pub nodes: Vec<ConditionNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
}

impl ConditionNode {
    pub fn leaf(
        field_path: impl Into<String>,
        operator: Operator,
        value: impl Into<Value>,
    ) -> Self {
        ConditionNode::Leaf(Condition {
            field_path: field_path.into(),
            operator,
            value: value.into(),
            transform: None,
        })
    }

    pub fn group(logic: LogicOp, nodes: Vec<ConditionNode>) -> Self {
        ConditionNode::Group(ConditionGroup { logic, nodes })
    }
}

/// Meta columns addressable from a condition leaf. Everything else is a
/// payload field resolved through `indexed_data`.
pub const META_FIELDS: [&str; 7] = [
    "resource_id",
    "created_time",
    "updated_time",
    "created_by",
    "updated_by",
    "is_deleted",
    "schema_version",
];

pub fn is_meta_field(field_path: &str) -> bool {
    META_FIELDS.contains(&field_path)
}

/// Meta keys usable in a meta sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaSortKey {
    CreatedTime,
    UpdatedTime,
    ResourceId,
}

impl MetaSortKey {
    pub fn column(&self) -> &'static str {
        match self {
            MetaSortKey::CreatedTime => "created_time",
            MetaSortKey::UpdatedTime => "updated_time",
            MetaSortKey::ResourceId => "resource_id",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "created_time" => Some(MetaSortKey::CreatedTime),
            "updated_time" => Some(MetaSortKey::UpdatedTime),
            "resource_id" => Some(MetaSortKey::ResourceId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "+")]
    Ascending,
    #[serde(rename = "-")]
    Descending,
}

/// One sort criterion: a meta column or an indexed payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SortSpec {
    Meta { key: MetaSortKey, direction: Direction },
    Data { field_path: String, direction: Direction },
}

impl SortSpec {
    /// Parses `"+field"`, `"-field"` or a bare name (ascending). Names that
    /// match a meta sort key become meta sorts.
    pub fn parse(spec: &str) -> Self {
        let (direction, name) = match spec.as_bytes().first() {
            Some(b'-') => (Direction::Descending, &spec[1..]),
            Some(b'+') => (Direction::Ascending, &spec[1..]),
            _ => (Direction::Ascending, spec),
        };
        match MetaSortKey::from_name(name) {
            Some(key) => SortSpec::Meta { key, direction },
            None => SortSpec::Data {
                field_path: name.to_string(),
                direction,
            },
        }
    }
}

impl From<&str> for SortSpec {
    fn from(spec: &str) -> Self {
        SortSpec::parse(spec)
    }
}

pub const DEFAULT_LIMIT: u32 = 10;

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

/// Full search request against a meta store.
///
/// The explicit shortcut fields (`is_deleted`, the time windows, the actor
/// lists) are additive AND constraints on top of `conditions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub conditions: Option<ConditionNode>,
    pub sorts: Vec<SortSpec>,
    pub limit: u32,
    pub offset: u32,

    pub is_deleted: Option<bool>,
    pub created_time_start: Option<DateTime<Utc>>,
    pub created_time_end: Option<DateTime<Utc>>,
    pub updated_time_start: Option<DateTime<Utc>>,
    pub updated_time_end: Option<DateTime<Utc>>,
    pub created_bys: Option<Vec<String>>,
    pub updated_bys: Option<Vec<String>>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            conditions: None,
            sorts: Vec::new(),
            limit: default_limit(),
            offset: 0,
            is_deleted: None,
            created_time_start: None,
            created_time_end: None,
            updated_time_start: None,
            updated_time_end: None,
            created_bys: None,
            updated_bys: None,
        }
    }
}

impl SearchQuery {
    /// ANDs an extra condition into the tree, keeping the rest of the query.
    pub fn and_condition(mut self, node: ConditionNode) -> Self {
        self.conditions = Some(match self.conditions.take() {
            None => node,
            Some(existing) => ConditionNode::group(LogicOp::And, vec![existing, node]),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_spec_parses_prefixes() {
        assert_eq!(
            SortSpec::parse("-created_time"),
            SortSpec::Meta {
                key: MetaSortKey::CreatedTime,
                direction: Direction::Descending
            }
        );
        assert_eq!(
            SortSpec::parse("+name"),
            SortSpec::Data {
                field_path: "name".into(),
                direction: Direction::Ascending
            }
        );
        assert_eq!(
            SortSpec::parse("age"),
            SortSpec::Data {
                field_path: "age".into(),
                direction: Direction::Ascending
            }
        );
    }

    #[test]
    fn condition_node_wire_shape() {
        let node = ConditionNode::group(
            LogicOp::And,
            vec![
                ConditionNode::leaf("price", Operator::Gte, 40),
                ConditionNode::leaf("name", Operator::StartsWith, "Wid"),
            ],
        );
        let encoded = serde_json::to_value(&node).unwrap();
        assert_eq!(
            encoded,
            json!({
                "logic": "and",
                "nodes": [
                    {"field_path": "price", "operator": "gte", "value": 40},
                    {"field_path": "name", "operator": "starts_with", "value": "Wid"},
                ]
            })
        );
        let decoded: ConditionNode = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn sort_wire_shape_uses_sign_directions() {
        let sort = SortSpec::Meta {
            key: MetaSortKey::UpdatedTime,
            direction: Direction::Descending,
        };
        assert_eq!(
            serde_json::to_value(&sort).unwrap(),
            json!({"type": "meta", "key": "updated_time", "direction": "-"})
        );
    }

    #[test]
    fn meta_field_routing_is_exact() {
        assert!(is_meta_field("created_by"));
        assert!(!is_meta_field("created_by_me"));
        assert!(!is_meta_field("name"));
    }
}
