//! Query model for the tresor engine.
//!
//! Three layers:
//!
//! - [`condition`] — the data model: condition trees, sorts, and the
//!   [`SearchQuery`] that meta stores execute.
//! - [`builder`] — fluent construction: [`Qb`] field handles, `& | !`
//!   combinators, sorting and pagination.
//! - [`parser`] — the safe `qb` expression language used on the wire,
//!   parsed over a closed grammar and method allowlist.

pub mod builder;
pub mod condition;
pub mod parser;

pub use builder::{time_value, Cond, FieldRef, Qb, QueryBuilder};
pub use condition::{
    is_meta_field, Condition, ConditionGroup, ConditionNode, Direction, FieldTransform, LogicOp,
    MetaSortKey, Operator, SearchQuery, SortSpec, DEFAULT_LIMIT, META_FIELDS,
};
pub use parser::{parse_qb, ParseError, QbParser};
