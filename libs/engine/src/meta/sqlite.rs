//! SQLite-backed meta store — the reference implementation.
//!
//! One row per resource: the encoded meta blob plus a column per indexed
//! meta field and one JSON column (`indexed_data`) holding the projected
//! payload fields. Condition trees compile to SQL: meta leaves become column
//! predicates, data leaves become `json_extract` predicates, and groups
//! parenthesise. REGEXP is provided by sqlx's `regexp` feature. Field paths
//! are always bound as JSON path parameters, never interpolated.

use super::MetaStore;
use crate::error::{Error, Result};
use crate::types::ResourceMeta;
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tresor_query::{
    is_meta_field, Condition, ConditionNode, Direction, FieldTransform, LogicOp, Operator,
    SearchQuery, SortSpec,
};
use tresor_format::{Format, Serializer};

#[derive(Debug, Clone)]
enum SqlParam {
    I64(i64),
    F64(f64),
    Text(String),
    Null,
}

impl SqlParam {
    fn from_value(value: &Value) -> SqlParam {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::I64(if *b { 1 } else { 0 }),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::I64(i),
                None => SqlParam::F64(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            composite => SqlParam::Text(composite.to_string()),
        }
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_param<'q>(query: SqliteQuery<'q>, param: &SqlParam) -> SqliteQuery<'q> {
    match param {
        SqlParam::I64(v) => query.bind(*v),
        SqlParam::F64(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
        SqlParam::Null => query.bind(Option::<String>::None),
    }
}

/// SQL fragment with its positional parameters in textual order.
#[derive(Debug, Clone, Default)]
struct Frag {
    sql: String,
    params: Vec<SqlParam>,
}

impl Frag {
    fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Frag {
            sql: sql.into(),
            params,
        }
    }
}

/// Quoted JSON path for a flat `indexed_data` key. Rejects keys that would
/// break out of the quoted path.
fn json_path(field_path: &str) -> Option<String> {
    if field_path.contains('"') {
        return None;
    }
    Some(format!("$.\"{field_path}\""))
}

/// `json_extract` over the indexed column, with the optional length
/// transform lowered to a `CASE` so the one operator set works on strings
/// and arrays alike.
fn data_expr(field_path: &str, transform: Option<FieldTransform>) -> Option<Frag> {
    let path = json_path(field_path)?;
    let plain = Frag::new(
        "json_extract(indexed_data, ?)",
        vec![SqlParam::Text(path.clone())],
    );
    match transform {
        None | Some(FieldTransform::Identity) => Some(plain),
        Some(FieldTransform::Length) => Some(Frag::new(
            "CASE \
             WHEN json_type(indexed_data, ?) = 'array' THEN json_array_length(indexed_data, ?) \
             WHEN json_type(indexed_data, ?) = 'text' THEN length(json_extract(indexed_data, ?)) \
             ELSE NULL END",
            vec![
                SqlParam::Text(path.clone()),
                SqlParam::Text(path.clone()),
                SqlParam::Text(path.clone()),
                SqlParam::Text(path),
            ],
        )),
    }
}

/// Time columns store REAL timestamps; accept numbers directly and RFC 3339
/// strings for wire-decoded conditions.
fn meta_time_param(value: &Value) -> SqlParam {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => SqlParam::F64(dt.timestamp_micros() as f64 / 1e6),
            Err(_) => SqlParam::Text(s.clone()),
        },
        other => SqlParam::from_value(other),
    }
}

fn meta_param(column: &str, value: &Value) -> SqlParam {
    if column == "created_time" || column == "updated_time" {
        meta_time_param(value)
    } else {
        SqlParam::from_value(value)
    }
}

fn compile_meta_leaf(leaf: &Condition) -> Option<Frag> {
    let column = leaf.field_path.as_str();
    let value = &leaf.value;

    let frag = match leaf.operator {
        Operator::Eq | Operator::Ne => {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                // A scalar column is never equal to a composite; skip the
                // leaf like the reference compiler does.
                return None;
            }
            let op = if leaf.operator == Operator::Eq { "=" } else { "!=" };
            Frag::new(format!("{column} {op} ?"), vec![meta_param(column, value)])
        }
        Operator::Gt => Frag::new(format!("{column} > ?"), vec![meta_param(column, value)]),
        Operator::Gte => Frag::new(format!("{column} >= ?"), vec![meta_param(column, value)]),
        Operator::Lt => Frag::new(format!("{column} < ?"), vec![meta_param(column, value)]),
        Operator::Lte => Frag::new(format!("{column} <= ?"), vec![meta_param(column, value)]),
        Operator::Contains => Frag::new(
            format!("{column} LIKE ?"),
            vec![SqlParam::Text(format!("%{}%", like_text(value)?))],
        ),
        Operator::StartsWith => Frag::new(
            format!("{column} LIKE ?"),
            vec![SqlParam::Text(format!("{}%", like_text(value)?))],
        ),
        Operator::EndsWith => Frag::new(
            format!("{column} LIKE ?"),
            vec![SqlParam::Text(format!("%{}", like_text(value)?))],
        ),
        Operator::Regex => Frag::new(
            format!("{column} REGEXP ?"),
            vec![SqlParam::from_value(value)],
        ),
        Operator::InList | Operator::NotInList => {
            let Value::Array(items) = value else {
                return None;
            };
            let placeholders = vec!["?"; items.len()].join(",");
            let keyword = if leaf.operator == Operator::InList {
                "IN"
            } else {
                "NOT IN"
            };
            Frag::new(
                format!("{column} {keyword} ({placeholders})"),
                items.iter().map(|v| meta_param(column, v)).collect(),
            )
        }
        Operator::IsNull | Operator::Isna => {
            let wants_null = value.as_bool().unwrap_or(true);
            if wants_null {
                Frag::new(format!("{column} IS NULL"), vec![])
            } else {
                Frag::new(format!("{column} IS NOT NULL"), vec![])
            }
        }
        // Meta columns always exist.
        Operator::Exists => {
            if value.as_bool().unwrap_or(true) {
                Frag::new("1=1", vec![])
            } else {
                Frag::new("1=0", vec![])
            }
        }
    };
    Some(frag)
}

fn like_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn compile_data_leaf(leaf: &Condition) -> Option<Frag> {
    let expr = data_expr(&leaf.field_path, leaf.transform)?;
    let value = &leaf.value;

    let frag = match leaf.operator {
        Operator::Eq => {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                let mut params = expr.params;
                params.push(SqlParam::Text(value.to_string()));
                Frag::new(format!("{} = json(?)", expr.sql), params)
            } else {
                let mut params = expr.params;
                params.push(SqlParam::from_value(value));
                Frag::new(format!("{} = ?", expr.sql), params)
            }
        }
        Operator::Ne => {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                // NULL-safe: a missing field is "not equal" to a composite.
                let mut params = expr.params.clone();
                params.push(SqlParam::Text(value.to_string()));
                params.extend(expr.params.clone());
                Frag::new(
                    format!("({0} != json(?) OR {0} IS NULL)", expr.sql),
                    params,
                )
            } else {
                let mut params = expr.params;
                params.push(SqlParam::from_value(value));
                Frag::new(format!("{} != ?", expr.sql), params)
            }
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let op = match leaf.operator {
                Operator::Gt => ">",
                Operator::Gte => ">=",
                Operator::Lt => "<",
                _ => "<=",
            };
            let mut params = expr.params;
            params.push(SqlParam::from_value(value));
            Frag::new(format!("CAST({} AS REAL) {op} ?", expr.sql), params)
        }
        Operator::Contains => {
            let mut params = expr.params;
            params.push(SqlParam::Text(format!("%{}%", like_text(value)?)));
            Frag::new(format!("{} LIKE ?", expr.sql), params)
        }
        Operator::StartsWith => {
            let mut params = expr.params;
            params.push(SqlParam::Text(format!("{}%", like_text(value)?)));
            Frag::new(format!("{} LIKE ?", expr.sql), params)
        }
        Operator::EndsWith => {
            let mut params = expr.params;
            params.push(SqlParam::Text(format!("%{}", like_text(value)?)));
            Frag::new(format!("{} LIKE ?", expr.sql), params)
        }
        Operator::Regex => {
            let mut params = expr.params;
            params.push(SqlParam::from_value(value));
            Frag::new(format!("{} REGEXP ?", expr.sql), params)
        }
        Operator::InList | Operator::NotInList => {
            let Value::Array(items) = value else {
                return None;
            };
            let placeholders = vec!["?"; items.len()].join(",");
            let keyword = if leaf.operator == Operator::InList {
                "IN"
            } else {
                "NOT IN"
            };
            let mut params = expr.params;
            params.extend(items.iter().map(SqlParam::from_value));
            Frag::new(format!("{} {keyword} ({placeholders})", expr.sql), params)
        }
        Operator::IsNull => {
            let path = json_path(&leaf.field_path)?;
            if value.as_bool().unwrap_or(true) {
                // Strict: the key must exist and hold null.
                Frag::new(
                    "json_type(indexed_data, ?) = 'null'",
                    vec![SqlParam::Text(path)],
                )
            } else {
                Frag::new(
                    "json_type(indexed_data, ?) IS NOT NULL AND json_type(indexed_data, ?) != 'null'",
                    vec![SqlParam::Text(path.clone()), SqlParam::Text(path)],
                )
            }
        }
        Operator::Exists => {
            let path = json_path(&leaf.field_path)?;
            if value.as_bool().unwrap_or(true) {
                Frag::new(
                    "json_type(indexed_data, ?) IS NOT NULL",
                    vec![SqlParam::Text(path)],
                )
            } else {
                Frag::new(
                    "json_type(indexed_data, ?) IS NULL",
                    vec![SqlParam::Text(path)],
                )
            }
        }
        Operator::Isna => {
            if value.as_bool().unwrap_or(true) {
                Frag::new(format!("{} IS NULL", expr.sql), expr.params)
            } else {
                Frag::new(format!("{} IS NOT NULL", expr.sql), expr.params)
            }
        }
    };
    Some(frag)
}

fn compile_node(node: &ConditionNode) -> Option<Frag> {
    match node {
        ConditionNode::Leaf(leaf) => {
            if is_meta_field(&leaf.field_path) {
                compile_meta_leaf(leaf)
            } else {
                compile_data_leaf(leaf)
            }
        }
        ConditionNode::Group(group) => {
            let children: Vec<Frag> = group.nodes.iter().filter_map(compile_node).collect();
            if children.is_empty() {
                return None;
            }
            let params = children
                .iter()
                .flat_map(|c| c.params.iter().cloned())
                .collect();
            let joined: Vec<&str> = children.iter().map(|c| c.sql.as_str()).collect();
            let sql = match group.logic {
                LogicOp::And => format!("({})", joined.join(" AND ")),
                LogicOp::Or => format!("({})", joined.join(" OR ")),
                LogicOp::Not => format!("NOT ({})", joined.join(" AND ")),
            };
            Some(Frag::new(sql, params))
        }
    }
}

fn compile_where(query: &SearchQuery) -> Frag {
    let mut clauses: Vec<Frag> = Vec::new();

    if let Some(is_deleted) = query.is_deleted {
        clauses.push(Frag::new(
            "is_deleted = ?",
            vec![SqlParam::I64(if is_deleted { 1 } else { 0 })],
        ));
    }
    let ts = |dt: chrono::DateTime<chrono::Utc>| dt.timestamp_micros() as f64 / 1e6;
    if let Some(start) = query.created_time_start {
        clauses.push(Frag::new("created_time >= ?", vec![SqlParam::F64(ts(start))]));
    }
    if let Some(end) = query.created_time_end {
        clauses.push(Frag::new("created_time <= ?", vec![SqlParam::F64(ts(end))]));
    }
    if let Some(start) = query.updated_time_start {
        clauses.push(Frag::new("updated_time >= ?", vec![SqlParam::F64(ts(start))]));
    }
    if let Some(end) = query.updated_time_end {
        clauses.push(Frag::new("updated_time <= ?", vec![SqlParam::F64(ts(end))]));
    }
    if let Some(created_bys) = &query.created_bys {
        if !created_bys.is_empty() {
            let placeholders = vec!["?"; created_bys.len()].join(",");
            clauses.push(Frag::new(
                format!("created_by IN ({placeholders})"),
                created_bys.iter().map(|s| SqlParam::Text(s.clone())).collect(),
            ));
        }
    }
    if let Some(updated_bys) = &query.updated_bys {
        if !updated_bys.is_empty() {
            let placeholders = vec!["?"; updated_bys.len()].join(",");
            clauses.push(Frag::new(
                format!("updated_by IN ({placeholders})"),
                updated_bys.iter().map(|s| SqlParam::Text(s.clone())).collect(),
            ));
        }
    }
    if let Some(node) = &query.conditions {
        if let Some(frag) = compile_node(node) {
            clauses.push(frag);
        }
    }

    if clauses.is_empty() {
        return Frag::default();
    }
    let params = clauses
        .iter()
        .flat_map(|c| c.params.iter().cloned())
        .collect();
    let sql = format!(
        "WHERE {}",
        clauses
            .iter()
            .map(|c| c.sql.as_str())
            .collect::<Vec<_>>()
            .join(" AND ")
    );
    Frag::new(sql, params)
}

fn compile_order(sorts: &[SortSpec]) -> Frag {
    if sorts.is_empty() {
        return Frag::default();
    }
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for sort in sorts {
        let direction = |d: &Direction| match d {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        match sort {
            SortSpec::Meta { key, direction: d } => {
                parts.push(format!("{} {}", key.column(), direction(d)));
            }
            SortSpec::Data {
                field_path,
                direction: d,
            } => {
                let Some(path) = json_path(field_path) else {
                    continue;
                };
                parts.push(format!("json_extract(indexed_data, ?) {}", direction(d)));
                params.push(SqlParam::Text(path));
            }
        }
    }
    if parts.is_empty() {
        return Frag::default();
    }
    Frag::new(format!("ORDER BY {}", parts.join(", ")), params)
}

pub struct SqliteMetaStore {
    pool: SqlitePool,
    serializer: Serializer<ResourceMeta>,
}

impl SqliteMetaStore {
    /// Opens (creating if missing) a database file and brings the schema up
    /// to date, back-filling `indexed_data` for rows written by older
    /// engines.
    pub async fn open(path: impl AsRef<Path>, format: Format) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .with_regexp();
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = SqliteMetaStore {
            pool,
            serializer: Serializer::new(format),
        };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database, for tests and ephemeral use. A single
    /// connection keeps every statement on the same database.
    pub async fn in_memory(format: Format) -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true).with_regexp();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = SqliteMetaStore {
            pool,
            serializer: Serializer::new(format),
        };
        store.init().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS resource_meta (
                resource_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                created_time REAL NOT NULL,
                updated_time REAL NOT NULL,
                created_by TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                is_deleted INTEGER NOT NULL,
                schema_version TEXT,
                indexed_data TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        // Schema upgrade for databases written before these columns existed.
        let columns: Vec<String> = sqlx::query("PRAGMA table_info(resource_meta)")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        if !columns.iter().any(|c| c == "indexed_data") {
            sqlx::query("ALTER TABLE resource_meta ADD COLUMN indexed_data TEXT")
                .execute(&self.pool)
                .await?;
        }
        if !columns.iter().any(|c| c == "schema_version") {
            sqlx::query("ALTER TABLE resource_meta ADD COLUMN schema_version TEXT")
                .execute(&self.pool)
                .await?;
        }

        for column in [
            "created_time",
            "updated_time",
            "created_by",
            "updated_by",
            "is_deleted",
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{column} ON resource_meta({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        self.backfill_indexed_data().await?;
        Ok(())
    }

    /// Opportunistic back-fill: decode the stored meta blob and rebuild the
    /// JSON projection column for rows that predate it.
    async fn backfill_indexed_data(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT resource_id, data FROM resource_meta
             WHERE indexed_data IS NULL OR indexed_data = ''",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let resource_id: String = row.try_get("resource_id")?;
            let data: Vec<u8> = row.try_get("data")?;
            let indexed = match self.serializer.decode(&data) {
                Ok(meta) => serde_json::to_string(&meta.indexed_data)
                    .unwrap_or_else(|_| "{}".to_string()),
                Err(err) => {
                    tracing::warn!(resource_id, error = %err, "indexed_data back-fill: meta blob undecodable");
                    "{}".to_string()
                }
            };
            sqlx::query("UPDATE resource_meta SET indexed_data = ? WHERE resource_id = ?")
                .bind(indexed)
                .bind(&resource_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    fn row_values(&self, meta: &ResourceMeta) -> Result<(Vec<u8>, f64, f64, String)> {
        let data = self.serializer.encode(meta)?;
        let created = meta.created_time.timestamp_micros() as f64 / 1e6;
        let updated = meta.updated_time.timestamp_micros() as f64 / 1e6;
        let indexed = serde_json::to_string(&meta.indexed_data)
            .map_err(|e| Error::Internal(format!("indexed_data not serializable: {e}")))?;
        Ok((data, created, updated, indexed))
    }
}

const UPSERT: &str = "INSERT OR REPLACE INTO resource_meta
    (resource_id, data, created_time, updated_time, created_by, updated_by, is_deleted, schema_version, indexed_data)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn get(&self, resource_id: &str) -> Result<Option<ResourceMeta>> {
        let row = sqlx::query("SELECT data FROM resource_meta WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Vec<u8> = row.try_get("data")?;
                Ok(Some(self.serializer.decode(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, meta: &ResourceMeta) -> Result<()> {
        let (data, created, updated, indexed) = self.row_values(meta)?;
        sqlx::query(UPSERT)
            .bind(&meta.resource_id)
            .bind(data)
            .bind(created)
            .bind(updated)
            .bind(&meta.created_by)
            .bind(&meta.updated_by)
            .bind(if meta.is_deleted { 1i64 } else { 0i64 })
            .bind(&meta.schema_version)
            .bind(indexed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, resource_id: &str) -> Result<()> {
        let outcome = sqlx::query("DELETE FROM resource_meta WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        if outcome.rows_affected() == 0 {
            return Err(Error::ResourceIdNotFound(resource_id.to_string()));
        }
        Ok(())
    }

    async fn exists(&self, resource_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM resource_meta WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn iter_search(
        &self,
        query: &SearchQuery,
    ) -> Result<BoxStream<'static, Result<ResourceMeta>>> {
        let where_frag = compile_where(query);
        let order_frag = compile_order(&query.sorts);
        let sql = format!(
            "SELECT data FROM resource_meta {} {} LIMIT ? OFFSET ?",
            where_frag.sql, order_frag.sql
        );
        let mut params = where_frag.params;
        params.extend(order_frag.params);
        params.push(SqlParam::I64(query.limit as i64));
        params.push(SqlParam::I64(query.offset as i64));

        let pool = self.pool.clone();
        let serializer = self.serializer.clone();

        let stream = try_stream! {
            let mut q = sqlx::query(&sql);
            for param in &params {
                q = bind_param(q, param);
            }
            let mut rows = q.fetch(&pool);
            while let Some(row) = rows.try_next().await.map_err(Error::Database)? {
                match decode_row(&serializer, &row) {
                    Ok(meta) => yield meta,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping undecodable meta row in search");
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn count(&self, query: &SearchQuery) -> Result<u64> {
        let where_frag = compile_where(query);
        let sql = format!("SELECT COUNT(*) FROM resource_meta {}", where_frag.sql);
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        for param in &where_frag.params {
            q = match param {
                SqlParam::I64(v) => q.bind(*v),
                SqlParam::F64(v) => q.bind(*v),
                SqlParam::Text(v) => q.bind(v.clone()),
                SqlParam::Null => q.bind(Option::<String>::None),
            };
        }
        let count = q.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn save_many(&self, metas: Vec<ResourceMeta>) -> Result<()> {
        if metas.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for meta in &metas {
            let (data, created, updated, indexed) = self.row_values(meta)?;
            sqlx::query(UPSERT)
                .bind(&meta.resource_id)
                .bind(data)
                .bind(created)
                .bind(updated)
                .bind(&meta.created_by)
                .bind(&meta.updated_by)
                .bind(if meta.is_deleted { 1i64 } else { 0i64 })
                .bind(&meta.schema_version)
                .bind(indexed)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn decode_row(serializer: &Serializer<ResourceMeta>, row: &SqliteRow) -> Result<ResourceMeta> {
    let data: Vec<u8> = row.try_get("data")?;
    Ok(serializer.decode(&data)?)
}
