//! In-process evaluation of the condition AST against a [`ResourceMeta`].
//!
//! The semantics deliberately mirror the SQLite compiler so the memory and
//! SQLite backends agree on every operator: `contains`/`starts_with`/
//! `ends_with` are ASCII-case-insensitive like SQL `LIKE`, ordered
//! comparisons on data fields coerce through `CAST(... AS REAL)` rules, and
//! `ne` on array/object values is NULL-safe.

use crate::types::ResourceMeta;
use serde_json::Value;
use std::cmp::Ordering;
use tresor_query::{
    is_meta_field, Condition, ConditionNode, Direction, FieldTransform, LogicOp, Operator,
    SearchQuery, SortSpec,
};

/// Lookup result for one field of one meta row.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Key absent (data field not in the projection).
    Missing,
    /// Key present and JSON null (or a null meta column).
    Null,
    Value(Value),
}

impl Lookup {
    fn as_value(&self) -> Option<&Value> {
        match self {
            Lookup::Value(v) => Some(v),
            _ => None,
        }
    }
}

fn timestamp(dt: chrono::DateTime<chrono::Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1e6
}

fn lookup(meta: &ResourceMeta, field_path: &str) -> Lookup {
    if is_meta_field(field_path) {
        return match field_path {
            "resource_id" => Lookup::Value(Value::String(meta.resource_id.clone())),
            "created_time" => Lookup::Value(number(timestamp(meta.created_time))),
            "updated_time" => Lookup::Value(number(timestamp(meta.updated_time))),
            "created_by" => Lookup::Value(Value::String(meta.created_by.clone())),
            "updated_by" => Lookup::Value(Value::String(meta.updated_by.clone())),
            "is_deleted" => Lookup::Value(Value::Bool(meta.is_deleted)),
            "schema_version" => match &meta.schema_version {
                Some(v) => Lookup::Value(Value::String(v.clone())),
                None => Lookup::Null,
            },
            _ => Lookup::Missing,
        };
    }
    match meta.indexed_data.get(field_path) {
        None => Lookup::Missing,
        Some(Value::Null) => Lookup::Null,
        Some(v) => Lookup::Value(v.clone()),
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// `CAST(x AS REAL)` semantics: numbers pass through, strings keep their
/// leading numeric prefix (else 0), booleans are 0/1, composites are 0.
fn cast_real(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim_start();
            let mut end = 0;
            let bytes = trimmed.as_bytes();
            let mut seen_dot = false;
            for (i, b) in bytes.iter().enumerate() {
                match b {
                    b'-' | b'+' if i == 0 => end = i + 1,
                    b'0'..=b'9' => end = i + 1,
                    b'.' if !seen_dot => {
                        seen_dot = true;
                        end = i + 1;
                    }
                    _ => break,
                }
            }
            Some(trimmed[..end].parse().unwrap_or(0.0))
        }
        Value::Array(_) | Value::Object(_) => Some(0.0),
        Value::Null => None,
    }
}

/// Text rendering used by the substring operators, matching how SQLite sees
/// a `json_extract` result.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1".into() } else { "0".into() }),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Bool(x), Value::Number(y)) | (Value::Number(y), Value::Bool(x)) => {
            y.as_f64() == Some(if *x { 1.0 } else { 0.0 })
        }
        _ => a == b,
    }
}

fn apply_transform(found: Lookup, transform: Option<FieldTransform>) -> Lookup {
    match transform {
        None | Some(FieldTransform::Identity) => found,
        Some(FieldTransform::Length) => match found {
            Lookup::Value(Value::String(s)) => Lookup::Value(Value::from(s.chars().count() as u64)),
            Lookup::Value(Value::Array(items)) => Lookup::Value(Value::from(items.len() as u64)),
            Lookup::Missing => Lookup::Missing,
            _ => Lookup::Null,
        },
    }
}

fn eval_leaf(meta: &ResourceMeta, leaf: &Condition) -> bool {
    let found = apply_transform(lookup(meta, &leaf.field_path), leaf.transform);
    let value = &leaf.value;

    match leaf.operator {
        Operator::Eq => match found.as_value() {
            Some(v) => values_equal(v, value),
            None => false,
        },
        Operator::Ne => match (found.as_value(), value) {
            // NULL-safe for composite comparison values, like the SQL
            // compiler's `(!= json(?) OR IS NULL)`.
            (None, Value::Array(_) | Value::Object(_)) => true,
            (None, _) => false,
            (Some(v), _) => !values_equal(v, value),
        },
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let (lhs, rhs) = match (found.as_value().and_then(cast_real), cast_real(value)) {
                (Some(l), Some(r)) => (l, r),
                _ => return false,
            };
            match leaf.operator {
                Operator::Gt => lhs > rhs,
                Operator::Gte => lhs >= rhs,
                Operator::Lt => lhs < rhs,
                _ => lhs <= rhs,
            }
        }
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
            let (Some(haystack), Some(needle)) = (
                found.as_value().and_then(|v| as_text(v)),
                as_text(value),
            ) else {
                return false;
            };
            let haystack = haystack.to_ascii_lowercase();
            let needle = needle.to_ascii_lowercase();
            match leaf.operator {
                Operator::Contains => haystack.contains(&needle),
                Operator::StartsWith => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            }
        }
        Operator::Regex => {
            let (Some(text), Value::String(pattern)) =
                (found.as_value().and_then(as_text), value)
            else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&text),
                Err(_) => false,
            }
        }
        Operator::InList => match (found.as_value(), value) {
            (Some(v), Value::Array(items)) => items.iter().any(|item| values_equal(v, item)),
            _ => false,
        },
        Operator::NotInList => match (found.as_value(), value) {
            (Some(v), Value::Array(items)) => !items.iter().any(|item| values_equal(v, item)),
            _ => false,
        },
        // is_null and exists inspect the raw field, never the transformed
        // value, matching the SQL compiler's json_type(...) predicates.
        Operator::IsNull => {
            let raw = lookup(meta, &leaf.field_path);
            let wants_null = value.as_bool().unwrap_or(true);
            if is_meta_field(&leaf.field_path) {
                // Meta columns: plain IS NULL / IS NOT NULL.
                match raw {
                    Lookup::Null => wants_null,
                    Lookup::Value(_) => !wants_null,
                    Lookup::Missing => wants_null,
                }
            } else {
                // Strict on data fields: the key must exist either way.
                match raw {
                    Lookup::Null => wants_null,
                    Lookup::Value(_) => !wants_null,
                    Lookup::Missing => false,
                }
            }
        }
        Operator::Exists => {
            let raw = lookup(meta, &leaf.field_path);
            let wants_present = value.as_bool().unwrap_or(true);
            if is_meta_field(&leaf.field_path) {
                // Meta columns always exist.
                wants_present
            } else {
                let present = !matches!(raw, Lookup::Missing);
                present == wants_present
            }
        }
        Operator::Isna => {
            let wants_na = value.as_bool().unwrap_or(true);
            let na = matches!(found, Lookup::Missing | Lookup::Null);
            na == wants_na
        }
    }
}

pub fn eval_node(meta: &ResourceMeta, node: &ConditionNode) -> bool {
    match node {
        ConditionNode::Leaf(leaf) => eval_leaf(meta, leaf),
        ConditionNode::Group(group) => match group.logic {
            LogicOp::And => group.nodes.iter().all(|n| eval_node(meta, n)),
            LogicOp::Or => group.nodes.iter().any(|n| eval_node(meta, n)),
            LogicOp::Not => !group.nodes.iter().all(|n| eval_node(meta, n)),
        },
    }
}

/// Applies the shortcut filters and the condition tree.
pub fn matches_query(meta: &ResourceMeta, query: &SearchQuery) -> bool {
    if let Some(is_deleted) = query.is_deleted {
        if meta.is_deleted != is_deleted {
            return false;
        }
    }
    if let Some(start) = query.created_time_start {
        if meta.created_time < start {
            return false;
        }
    }
    if let Some(end) = query.created_time_end {
        if meta.created_time > end {
            return false;
        }
    }
    if let Some(start) = query.updated_time_start {
        if meta.updated_time < start {
            return false;
        }
    }
    if let Some(end) = query.updated_time_end {
        if meta.updated_time > end {
            return false;
        }
    }
    if let Some(created_bys) = &query.created_bys {
        if !created_bys.contains(&meta.created_by) {
            return false;
        }
    }
    if let Some(updated_bys) = &query.updated_bys {
        if !updated_bys.contains(&meta.updated_by) {
            return false;
        }
    }
    match &query.conditions {
        Some(node) => eval_node(meta, node),
        None => true,
    }
}

/// SQLite storage-class ordering: NULL < numeric < text < composite.
fn type_rank(lookup: &Lookup) -> u8 {
    match lookup {
        Lookup::Missing | Lookup::Null => 0,
        Lookup::Value(Value::Null) => 0,
        Lookup::Value(Value::Bool(_)) | Lookup::Value(Value::Number(_)) => 1,
        Lookup::Value(Value::String(_)) => 2,
        Lookup::Value(_) => 3,
    }
}

fn compare_lookups(a: &Lookup, b: &Lookup) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a.as_value(), b.as_value()) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => {
            let (x, y) = (cast_real(x), cast_real(y));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        _ => Ordering::Equal,
    }
}

/// Sorts metas in place by the query's sort list.
pub fn sort_metas(metas: &mut [ResourceMeta], sorts: &[SortSpec]) {
    metas.sort_by(|a, b| {
        for sort in sorts {
            let (path, direction) = match sort {
                SortSpec::Meta { key, direction } => (key.column(), direction),
                SortSpec::Data {
                    field_path,
                    direction,
                } => (field_path.as_str(), direction),
            };
            let ordering = compare_lookups(&lookup(a, path), &lookup(b, path));
            let ordering = match direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
