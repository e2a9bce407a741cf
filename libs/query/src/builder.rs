//! Fluent condition and query building.
//!
//! [`Qb`] is the entry point: `Qb::field("price").gt(40) & Qb::field("tags").length().gte(2)`.
//! Field handles produce [`Cond`] values that combine with `&`, `|` and `!`,
//! then flow into a [`QueryBuilder`] for sorting and pagination.

use crate::condition::{
    Condition, ConditionNode, Direction, FieldTransform, LogicOp, MetaSortKey, Operator,
    SearchQuery, SortSpec, DEFAULT_LIMIT,
};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde_json::{json, Value};

/// Converts a timestamp to the numeric form stored in the meta columns.
pub fn time_value(dt: DateTime<Utc>) -> Value {
    json!(dt.timestamp_micros() as f64 / 1e6)
}

/// Query-builder namespace.
pub struct Qb;

impl Qb {
    /// Payload field handle; `name` may be a dotted path (`"user.email"`).
    pub fn field(name: impl Into<String>) -> FieldRef {
        FieldRef {
            name: name.into(),
            transform: None,
        }
    }

    pub fn resource_id() -> FieldRef {
        Qb::field("resource_id")
    }

    /// Handle for the current revision id meta field.
    pub fn revision_id() -> FieldRef {
        Qb::field("current_revision_id")
    }

    pub fn created_time() -> FieldRef {
        Qb::field("created_time")
    }

    pub fn updated_time() -> FieldRef {
        Qb::field("updated_time")
    }

    pub fn created_by() -> FieldRef {
        Qb::field("created_by")
    }

    pub fn updated_by() -> FieldRef {
        Qb::field("updated_by")
    }

    pub fn is_deleted() -> FieldRef {
        Qb::field("is_deleted")
    }

    pub fn schema_version() -> FieldRef {
        Qb::field("schema_version")
    }

    /// ANDs all conditions together. Empty input matches everything.
    pub fn all<I>(conds: I) -> Cond
    where
        I: IntoIterator<Item = Cond>,
    {
        let nodes: Vec<ConditionNode> = conds.into_iter().filter_map(|c| c.node).collect();
        match nodes.len() {
            0 => Cond { node: None },
            1 => Cond {
                node: nodes.into_iter().next(),
            },
            _ => Cond {
                node: Some(ConditionNode::group(LogicOp::And, nodes)),
            },
        }
    }

    /// ORs all conditions together. Empty input matches everything.
    pub fn any<I>(conds: I) -> Cond
    where
        I: IntoIterator<Item = Cond>,
    {
        let nodes: Vec<ConditionNode> = conds.into_iter().filter_map(|c| c.node).collect();
        match nodes.len() {
            0 => Cond { node: None },
            1 => Cond {
                node: nodes.into_iter().next(),
            },
            _ => Cond {
                node: Some(ConditionNode::group(LogicOp::Or, nodes)),
            },
        }
    }
}

/// Handle on one field, optionally carrying a transform (`length()`).
#[derive(Debug, Clone)]
pub struct FieldRef {
    name: String,
    transform: Option<FieldTransform>,
}

impl FieldRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn cond(&self, operator: Operator, value: impl Into<Value>) -> Cond {
        Cond {
            node: Some(ConditionNode::Leaf(Condition {
                field_path: self.name.clone(),
                operator,
                value: value.into(),
                transform: self.transform,
            })),
        }
    }

    pub fn eq(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Eq, value)
    }

    pub fn ne(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Ne, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Gt, value)
    }

    pub fn gte(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Gte, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Lt, value)
    }

    pub fn lte(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Lte, value)
    }

    pub fn contains(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::Contains, value)
    }

    pub fn starts_with(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::StartsWith, value)
    }

    pub fn ends_with(&self, value: impl Into<Value>) -> Cond {
        self.cond(Operator::EndsWith, value)
    }

    pub fn regex(&self, pattern: impl Into<String>) -> Cond {
        self.cond(Operator::Regex, pattern.into())
    }

    /// Alias for [`FieldRef::regex`].
    pub fn matches(&self, pattern: impl Into<String>) -> Cond {
        self.regex(pattern)
    }

    pub fn in_list<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Cond {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.cond(Operator::InList, list)
    }

    /// Alias for [`FieldRef::in_list`].
    pub fn one_of<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Cond {
        self.in_list(values)
    }

    pub fn not_in<V: Into<Value>>(&self, values: impl IntoIterator<Item = V>) -> Cond {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.cond(Operator::NotInList, list)
    }

    pub fn between(&self, min: impl Into<Value>, max: impl Into<Value>) -> Cond {
        self.gte(min) & self.lte(max)
    }

    /// Alias for [`FieldRef::between`].
    pub fn in_range(&self, min: impl Into<Value>, max: impl Into<Value>) -> Cond {
        self.between(min, max)
    }

    pub fn is_null(&self, value: bool) -> Cond {
        self.cond(Operator::IsNull, value)
    }

    pub fn is_not_null(&self) -> Cond {
        self.is_null(false)
    }

    /// Alias for [`FieldRef::is_not_null`].
    pub fn has_value(&self) -> Cond {
        self.is_not_null()
    }

    pub fn is_true(&self) -> Cond {
        self.eq(true)
    }

    pub fn is_false(&self) -> Cond {
        self.eq(false)
    }

    pub fn exists(&self, value: bool) -> Cond {
        self.cond(Operator::Exists, value)
    }

    pub fn isna(&self, value: bool) -> Cond {
        self.cond(Operator::Isna, value)
    }

    /// Not null, not `false`, not `0`, not `""`, not `[]`.
    pub fn is_truthy(&self) -> Cond {
        self.flat_group(
            LogicOp::And,
            [
                self.is_null(false),
                self.ne(false),
                self.ne(0),
                self.ne(""),
                self.ne(Value::Array(vec![])),
            ],
        )
    }

    pub fn is_falsy(&self) -> Cond {
        !self.is_truthy()
    }

    /// Empty string or null.
    pub fn is_empty(&self) -> Cond {
        self.flat_group(LogicOp::Or, [self.eq(""), self.is_null(true)])
    }

    /// Empty string, null, or whitespace only.
    pub fn is_blank(&self) -> Cond {
        self.flat_group(
            LogicOp::Or,
            [self.eq(""), self.is_null(true), self.regex(r"^\s*$")],
        )
    }

    fn flat_group<const N: usize>(&self, logic: LogicOp, conds: [Cond; N]) -> Cond {
        Cond {
            node: Some(ConditionNode::group(
                logic,
                conds.into_iter().filter_map(Cond::into_node).collect(),
            )),
        }
    }

    pub fn icontains(&self, value: &str) -> Cond {
        self.regex(format!("(?i){}", regex::escape(value)))
    }

    pub fn istarts_with(&self, value: &str) -> Cond {
        self.regex(format!("(?i)^{}", regex::escape(value)))
    }

    pub fn iends_with(&self, value: &str) -> Cond {
        self.regex(format!("(?i){}$", regex::escape(value)))
    }

    pub fn not_contains(&self, value: impl Into<Value>) -> Cond {
        !self.contains(value)
    }

    pub fn not_starts_with(&self, value: impl Into<Value>) -> Cond {
        !self.starts_with(value)
    }

    pub fn not_ends_with(&self, value: impl Into<Value>) -> Cond {
        !self.ends_with(value)
    }

    /// SQL LIKE pattern with `%` and `_` wildcards, lowered to the cheapest
    /// operator that still matches (`contains`/`starts_with`/`ends_with`,
    /// falling back to an anchored regex).
    pub fn like(&self, pattern: &str) -> Cond {
        let bytes = pattern.as_bytes();
        let starts = bytes.first() == Some(&b'%');
        let ends = bytes.last() == Some(&b'%');

        if starts && ends && pattern.len() > 2 {
            let inner = &pattern[1..pattern.len() - 1];
            if !inner.contains('_') && !inner.contains('%') {
                return self.contains(inner);
            }
        }
        if ends && !starts {
            let prefix = &pattern[..pattern.len() - 1];
            if !prefix.contains('_') && !prefix.contains('%') {
                return self.starts_with(prefix);
            }
        }
        if starts && !ends {
            let suffix = &pattern[1..];
            if !suffix.contains('_') && !suffix.contains('%') {
                return self.ends_with(suffix);
            }
        }

        let mut regex_pattern = String::with_capacity(pattern.len() + 2);
        regex_pattern.push('^');
        for ch in pattern.chars() {
            match ch {
                '%' => regex_pattern.push_str(".*"),
                '_' => regex_pattern.push('.'),
                other => regex_pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex_pattern.push('$');
        self.regex(regex_pattern)
    }

    /// Virtual field holding this field's length (string chars or array
    /// elements); the transform is evaluated by the storage backend.
    pub fn length(&self) -> FieldRef {
        FieldRef {
            name: self.name.clone(),
            transform: Some(FieldTransform::Length),
        }
    }

    pub fn asc(&self) -> SortSpec {
        self.sort_spec(Direction::Ascending)
    }

    pub fn desc(&self) -> SortSpec {
        self.sort_spec(Direction::Descending)
    }

    fn sort_spec(&self, direction: Direction) -> SortSpec {
        match MetaSortKey::from_name(&self.name) {
            Some(key) => SortSpec::Meta { key, direction },
            None => SortSpec::Data {
                field_path: self.name.clone(),
                direction,
            },
        }
    }

    // Date range helpers. `tz_hours` is a UTC offset in whole hours; `None`
    // means UTC. The `*_at` variants take the reference instant explicitly so
    // the qb parser (and tests) can pin the clock.

    pub fn today(&self, tz_hours: Option<i32>) -> Cond {
        self.today_at(Utc::now(), tz_hours)
    }

    pub fn today_at(&self, now: DateTime<Utc>, tz_hours: Option<i32>) -> Cond {
        let (start, end) = day_bounds(local_date(now, tz_hours), tz_hours);
        self.between(start, end)
    }

    pub fn yesterday(&self, tz_hours: Option<i32>) -> Cond {
        self.yesterday_at(Utc::now(), tz_hours)
    }

    pub fn yesterday_at(&self, now: DateTime<Utc>, tz_hours: Option<i32>) -> Cond {
        let date = local_date(now, tz_hours) - Duration::days(1);
        let (start, end) = day_bounds(date, tz_hours);
        self.between(start, end)
    }

    /// Monday-to-Sunday week containing `now`.
    pub fn this_week(&self, tz_hours: Option<i32>) -> Cond {
        self.this_week_at(Utc::now(), tz_hours)
    }

    pub fn this_week_at(&self, now: DateTime<Utc>, tz_hours: Option<i32>) -> Cond {
        let date = local_date(now, tz_hours);
        let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        let (start, _) = day_bounds(monday, tz_hours);
        let (_, end) = day_bounds(monday + Duration::days(6), tz_hours);
        self.between(start, end)
    }

    pub fn this_month(&self, tz_hours: Option<i32>) -> Cond {
        self.this_month_at(Utc::now(), tz_hours)
    }

    pub fn this_month_at(&self, now: DateTime<Utc>, tz_hours: Option<i32>) -> Cond {
        let date = local_date(now, tz_hours);
        let first = date.with_day(1).unwrap_or(date);
        let next_month = if first.month() == 12 {
            first
                .with_year(first.year() + 1)
                .and_then(|d| d.with_month(1))
        } else {
            first.with_month(first.month() + 1)
        }
        .unwrap_or(first);
        let last = next_month - Duration::days(1);
        let (start, _) = day_bounds(first, tz_hours);
        let (_, end) = day_bounds(last, tz_hours);
        self.between(start, end)
    }

    pub fn this_year(&self, tz_hours: Option<i32>) -> Cond {
        self.this_year_at(Utc::now(), tz_hours)
    }

    pub fn this_year_at(&self, now: DateTime<Utc>, tz_hours: Option<i32>) -> Cond {
        let date = local_date(now, tz_hours);
        let first = date
            .with_month(1)
            .and_then(|d| d.with_day(1))
            .unwrap_or(date);
        let last = date
            .with_month(12)
            .and_then(|d| d.with_day(31))
            .unwrap_or(date);
        let (start, _) = day_bounds(first, tz_hours);
        let (_, end) = day_bounds(last, tz_hours);
        self.between(start, end)
    }

    /// Values from the last `n` days, inclusive of today.
    pub fn last_n_days(&self, n: i64, tz_hours: Option<i32>) -> Cond {
        self.last_n_days_at(Utc::now(), n, tz_hours)
    }

    pub fn last_n_days_at(&self, now: DateTime<Utc>, n: i64, tz_hours: Option<i32>) -> Cond {
        let date = local_date(now, tz_hours) - Duration::days(n.saturating_sub(1));
        let (start, _) = day_bounds(date, tz_hours);
        self.gte(start)
    }
}

fn offset(tz_hours: Option<i32>) -> FixedOffset {
    tz_hours
        .and_then(|h| FixedOffset::east_opt(h * 3600))
        .unwrap_or_else(|| Utc.fix())
}

fn local_date(now: DateTime<Utc>, tz_hours: Option<i32>) -> NaiveDate {
    now.with_timezone(&offset(tz_hours)).date_naive()
}

/// `(start, end)` of the given local date as stored timestamps, end at
/// 23:59:59.999999.
fn day_bounds(date: NaiveDate, tz_hours: Option<i32>) -> (Value, Value) {
    let off = offset(tz_hours);
    let to_value = |naive: chrono::NaiveDateTime| -> Value {
        let dt = off
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| off.from_utc_datetime(&naive));
        time_value(dt.with_timezone(&Utc))
    };
    let start = date.and_hms_opt(0, 0, 0);
    let end = date.and_hms_micro_opt(23, 59, 59, 999_999);
    match (start, end) {
        (Some(s), Some(e)) => (to_value(s), to_value(e)),
        _ => (json!(0.0), json!(0.0)),
    }
}

/// A (possibly empty) condition tree under construction.
#[derive(Debug, Clone, Default)]
pub struct Cond {
    pub(crate) node: Option<ConditionNode>,
}

impl Cond {
    pub fn none() -> Self {
        Cond { node: None }
    }

    pub fn from_node(node: ConditionNode) -> Self {
        Cond { node: Some(node) }
    }

    pub fn into_node(self) -> Option<ConditionNode> {
        self.node
    }

    pub fn and(self, other: impl Into<Cond>) -> Cond {
        self & other.into()
    }

    pub fn or(self, other: impl Into<Cond>) -> Cond {
        self | other.into()
    }

    /// ANDs every condition in. Reads better than chained `&`.
    pub fn filter<I>(self, conds: I) -> Cond
    where
        I: IntoIterator<Item = Cond>,
    {
        conds.into_iter().fold(self, |acc, c| acc & c)
    }

    /// ANDs the negation of every condition in.
    pub fn exclude<I>(self, conds: I) -> Cond
    where
        I: IntoIterator<Item = Cond>,
    {
        conds.into_iter().fold(self, |acc, c| acc & !c)
    }

    pub fn sort(self, sort: impl Into<SortSpec>) -> QueryBuilder {
        QueryBuilder::from(self).sort(sort)
    }

    pub fn order_by(self, sort: impl Into<SortSpec>) -> QueryBuilder {
        self.sort(sort)
    }

    pub fn limit(self, limit: u32) -> QueryBuilder {
        QueryBuilder::from(self).limit(limit)
    }

    pub fn offset(self, offset: u32) -> QueryBuilder {
        QueryBuilder::from(self).offset(offset)
    }

    pub fn page(self, page: u32, size: u32) -> QueryBuilder {
        QueryBuilder::from(self).page(page, size)
    }

    pub fn first(self) -> QueryBuilder {
        QueryBuilder::from(self).first()
    }

    pub fn build(self) -> SearchQuery {
        QueryBuilder::from(self).build()
    }
}

impl From<FieldRef> for Cond {
    /// A bare field used as a condition means "field is truthy".
    fn from(field: FieldRef) -> Self {
        field.is_truthy()
    }
}

impl std::ops::BitAnd for Cond {
    type Output = Cond;

    fn bitand(self, rhs: Cond) -> Cond {
        match (self.node, rhs.node) {
            (None, node) | (node, None) => Cond { node },
            (Some(a), Some(b)) => Cond {
                node: Some(ConditionNode::group(LogicOp::And, vec![a, b])),
            },
        }
    }
}

impl std::ops::BitOr for Cond {
    type Output = Cond;

    fn bitor(self, rhs: Cond) -> Cond {
        match (self.node, rhs.node) {
            (None, node) | (node, None) => Cond { node },
            (Some(a), Some(b)) => Cond {
                node: Some(ConditionNode::group(LogicOp::Or, vec![a, b])),
            },
        }
    }
}

impl std::ops::Not for Cond {
    type Output = Cond;

    fn not(self) -> Cond {
        match self.node {
            None => Cond { node: None },
            Some(node) => Cond {
                node: Some(ConditionNode::group(LogicOp::Not, vec![node])),
            },
        }
    }
}

impl std::ops::Not for FieldRef {
    type Output = Cond;

    fn not(self) -> Cond {
        self.is_falsy()
    }
}

/// Builder for a full [`SearchQuery`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    condition: Option<ConditionNode>,
    sorts: Vec<SortSpec>,
    limit: u32,
    offset: u32,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            condition: None,
            sorts: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl From<Cond> for QueryBuilder {
    fn from(cond: Cond) -> Self {
        QueryBuilder {
            condition: cond.node,
            ..Default::default()
        }
    }
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, sort: impl Into<SortSpec>) -> Self {
        self.sorts.push(sort.into());
        self
    }

    pub fn order_by(self, sort: impl Into<SortSpec>) -> Self {
        self.sort(sort)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// 1-based page selection.
    pub fn page(mut self, page: u32, size: u32) -> Self {
        let page = page.max(1);
        let size = size.max(1);
        self.offset = (page - 1) * size;
        self.limit = size;
        self
    }

    pub fn first(mut self) -> Self {
        self.limit = 1;
        self
    }

    pub fn build(self) -> SearchQuery {
        SearchQuery {
            conditions: self.condition,
            sorts: self.sorts,
            limit: self.limit,
            offset: self.offset,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_or_not_build_groups() {
        let cond = (Qb::field("age").gt(18) & Qb::field("status").eq("active"))
            | !Qb::field("role").eq("guest");
        let node = cond.into_node().unwrap();
        match node {
            ConditionNode::Group(g) => {
                assert_eq!(g.logic, LogicOp::Or);
                assert_eq!(g.nodes.len(), 2);
            }
            _ => panic!("expected group"),
        }
    }

    #[test]
    fn empty_side_collapses() {
        let cond = Cond::none() & Qb::field("x").eq(1);
        assert!(matches!(
            cond.into_node(),
            Some(ConditionNode::Leaf(Condition { ref field_path, .. })) if field_path == "x"
        ));
    }

    #[test]
    fn length_transform_is_carried() {
        let cond = Qb::field("tags").length().gte(2);
        match cond.into_node().unwrap() {
            ConditionNode::Leaf(leaf) => {
                assert_eq!(leaf.transform, Some(FieldTransform::Length));
                assert_eq!(leaf.operator, Operator::Gte);
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn like_lowers_to_cheapest_operator() {
        let contains = Qb::field("desc").like("%urgent%");
        let starts = Qb::field("name").like("Alice%");
        let ends = Qb::field("email").like("%@gmail.com");
        let rx = Qb::field("code").like("A_C");

        let op_of = |c: Cond| match c.into_node().unwrap() {
            ConditionNode::Leaf(l) => (l.operator, l.value),
            _ => panic!("expected leaf"),
        };
        assert_eq!(op_of(contains), (Operator::Contains, "urgent".into()));
        assert_eq!(op_of(starts), (Operator::StartsWith, "Alice".into()));
        assert_eq!(op_of(ends), (Operator::EndsWith, "@gmail.com".into()));
        assert_eq!(op_of(rx), (Operator::Regex, "^A.C$".into()));
    }

    #[test]
    fn meta_names_sort_as_meta_keys() {
        assert_eq!(
            Qb::created_time().desc(),
            SortSpec::Meta {
                key: MetaSortKey::CreatedTime,
                direction: Direction::Descending
            }
        );
        assert_eq!(
            Qb::field("price").asc(),
            SortSpec::Data {
                field_path: "price".into(),
                direction: Direction::Ascending
            }
        );
    }

    #[test]
    fn page_computes_offset() {
        let q = Qb::field("x").eq(1).page(3, 20).build();
        assert_eq!(q.offset, 40);
        assert_eq!(q.limit, 20);
    }

    #[test]
    fn today_at_covers_the_whole_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 0).unwrap();
        let cond = Qb::field("created_time").today_at(now, None);
        let node = cond.into_node().unwrap();
        let (start, end) = match node {
            ConditionNode::Group(g) => {
                let extract = |n: &ConditionNode| match n {
                    ConditionNode::Leaf(l) => l.value.as_f64().unwrap(),
                    _ => panic!("expected leaf"),
                };
                (extract(&g.nodes[0]), extract(&g.nodes[1]))
            }
            _ => panic!("expected group"),
        };
        let day_start = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(start, day_start.timestamp() as f64);
        assert!(end - start > 86_399.0 && end - start < 86_400.0);
    }

    #[test]
    fn today_at_respects_offset() {
        // 2024-03-15T22:00Z is already 2024-03-16 in UTC+8.
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 22, 0, 0).unwrap();
        let cond = Qb::field("created_time").today_at(now, Some(8));
        let node = cond.into_node().unwrap();
        let start = match node {
            ConditionNode::Group(g) => match &g.nodes[0] {
                ConditionNode::Leaf(l) => l.value.as_f64().unwrap(),
                _ => panic!("expected leaf"),
            },
            _ => panic!("expected group"),
        };
        let expected = Utc.with_ymd_and_hms(2024, 3, 15, 16, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp() as f64);
    }
}
