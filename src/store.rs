//! ObjectStore - CRUD and aggregation over class tables
//!
//! Every operation receives the class schema from the caller, compiles one
//! statement against its storage form, and runs it on the pool or inside a
//! [`TransactionalSession`].

use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::config::AdapterConfig;
use crate::error::{Result, StorageError, has_code, is_code, pg_code};
use crate::query::Query;
use crate::session::{Executor, TransactionalSession};
use crate::sql::sanitize::{auth_data_provider, quote_identifier, transform_dot_field_to_jsonb};
use crate::sql::{
    Binder, WhereClause, build_aggregate, build_update, build_where_clause, column_expr,
    projection,
};
use crate::transform::{
    SqlValue, decode_row, expand_dot_fields, geo_point, polygon_to_sql, to_column_value,
    to_document, to_sql_value, validate_keys,
};
use crate::types::{ClassSchema, FieldType};

/// Options accepted by [`ObjectStore::find`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    /// Field to direction (`1` ascending, anything else descending)
    pub sort: Option<Map<String, Value>>,
    /// Columns to return; `ACL` expands to the permission columns and
    /// `$score` adds the text search rank
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub case_insensitive: bool,
    /// Return the query plan instead of objects
    #[serde(default)]
    pub explain: bool,
}

/// CRUD/aggregate engine over class tables
pub struct ObjectStore {
    pool: PgPool,
    config: AdapterConfig,
}

impl ObjectStore {
    pub fn new(pool: PgPool, config: AdapterConfig) -> Self {
        Self { pool, config }
    }

    fn table(&self, class_name: &str) -> String {
        quote_identifier(&self.config.table_name(class_name))
    }

    fn executor<'a>(&'a self, session: Option<&'a TransactionalSession>) -> Executor<'a> {
        Executor::new(&self.pool, session)
    }

    // =========================================================================
    // Transactional Sessions
    // =========================================================================

    /// Open a transaction that later operations can join
    pub async fn create_transactional_session(&self) -> Result<TransactionalSession> {
        TransactionalSession::begin(&self.pool).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert one object; a unique violation fails with `DuplicateValue`
    #[instrument(skip(self, schema, object, session), fields(class_name = %schema.class_name))]
    pub async fn create_object(
        &self,
        schema: &ClassSchema,
        object: Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Map<String, Value>> {
        let storage = schema.to_storage();
        let insert = build_insert(&storage, &self.table(&schema.class_name), object, false)?;
        match self.executor(session).execute(&insert.sql, &insert.values).await {
            Ok(_) => Ok(insert.document),
            Err(StorageError::Sql(e)) if has_code(&e, pg_code::UNIQUE_VIOLATION) => {
                Err(StorageError::from_unique_violation(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `update` to every object matching `query`, returning the updated objects
    #[instrument(skip(self, schema, query, update, session), fields(class_name = %schema.class_name))]
    pub async fn update_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        self.update(schema, query, update, false, session).await
    }

    /// Apply `update` to the first object matching `query`
    #[instrument(skip(self, schema, query, update, session), fields(class_name = %schema.class_name))]
    pub async fn find_one_and_update(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Option<Value>> {
        Ok(self
            .update(schema, query, update, true, session)
            .await?
            .into_iter()
            .next())
    }

    async fn update(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        single: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        let storage = schema.to_storage();
        let table = self.table(&schema.class_name);
        let update_clause = build_update(&storage, update, 1)?;
        let where_clause =
            build_where_clause(&storage, query, update_clause.next_index(1), false)?;
        let returning = projection(&storage, None);

        let filter = if single {
            format!(
                " WHERE \"objectId\" IN (SELECT \"objectId\" FROM {}{} LIMIT 1)",
                table,
                where_clause.to_sql()
            )
        } else {
            where_clause.to_sql()
        };
        let sql = if update_clause.assignments.is_empty() {
            format!("SELECT {} FROM {}{}", returning, table, filter)
        } else {
            format!(
                "UPDATE {} SET {}{} RETURNING {}",
                table,
                update_clause.to_sql(),
                filter,
                returning
            )
        };

        let mut params = update_clause.values;
        params.extend(where_clause.values);
        let rows = self.executor(session).fetch_all(&sql, &params).await?;
        debug!(rows = rows.len(), "Updated objects");
        rows.iter()
            .map(|row| Ok(Value::Object(to_document(&storage, decode_row(row)?))))
            .collect()
    }

    /// Insert `query` merged with `update`; when that collides with a unique
    /// value, update the existing object instead
    #[instrument(skip(self, schema, query, update, session), fields(class_name = %schema.class_name))]
    pub async fn upsert_one_object(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<()> {
        let mut create = query.equality_fields();
        create.extend(flatten_update_operators_for_create(update)?);

        let storage = schema.to_storage();
        let insert = build_insert(&storage, &self.table(&schema.class_name), create, true)?;
        let inserted = self.executor(session).execute(&insert.sql, &insert.values).await?;
        if inserted > 0 {
            return Ok(());
        }

        debug!("Upsert collided with an existing object, updating");
        let update: Map<String, Value> = update
            .iter()
            .filter(|(_, v)| v.get("__op").and_then(Value::as_str) != Some("SetOnInsert"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.find_one_and_update(schema, query, &update, session).await?;
        Ok(())
    }

    /// Delete every object matching `query`.
    ///
    /// Deleting nothing fails with `ObjectNotFound`; a class without a table
    /// deletes nothing successfully.
    #[instrument(skip(self, schema, query, session), fields(class_name = %schema.class_name))]
    pub async fn delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        session: Option<&TransactionalSession>,
    ) -> Result<u64> {
        let where_clause = build_where_clause(&schema.to_storage(), query, 1, false)?;
        let pattern = if where_clause.is_empty() {
            "TRUE"
        } else {
            where_clause.pattern.as_str()
        };
        let sql = format!(
            "WITH deleted AS (DELETE FROM {} WHERE {} RETURNING *) SELECT count(*) FROM deleted",
            self.table(&schema.class_name),
            pattern
        );

        let rows = match self
            .executor(session)
            .fetch_all_tolerating(&sql, &where_clause.values, &[pg_code::UNDEFINED_TABLE])
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_code(&e, pg_code::UNDEFINED_TABLE) => return Ok(0),
            Err(e) => return Err(e),
        };
        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        if count == 0 {
            return Err(StorageError::ObjectNotFound);
        }
        debug!(count, "Deleted objects");
        Ok(count as u64)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Objects matching `query`; a class without a table has no objects
    #[instrument(skip(self, schema, query, options, session), fields(class_name = %schema.class_name))]
    pub async fn find(
        &self,
        schema: &ClassSchema,
        query: &Query,
        options: &FindOptions,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        let storage = schema.to_storage();
        let where_clause = build_where_clause(&storage, query, 1, options.case_insensitive)?;

        let mut select = projection(&storage, options.keys.as_deref());
        let wants_score = options
            .keys
            .as_ref()
            .is_some_and(|keys| keys.iter().any(|k| k == "$score"));
        if let (true, Some(score)) = (wants_score, &where_clause.score) {
            select.push_str(&format!(", {} AS score", score));
        }

        let mut sql = format!(
            "SELECT {} FROM {}{}{}",
            select,
            self.table(&schema.class_name),
            where_clause.to_sql(),
            order_by(&where_clause, options.sort.as_ref())
        );
        let mut b = Binder::new(where_clause.next_index(1));
        let limit = options
            .limit
            .map(|limit| self.config.max_limit.map_or(limit, |max| limit.min(max)));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", b.bind(SqlValue::Int(limit))));
        }
        if let Some(skip) = options.skip {
            sql.push_str(&format!(" OFFSET {}", b.bind(SqlValue::Int(skip))));
        }
        if options.explain {
            sql = explain(&sql);
        }

        let mut params = where_clause.values.clone();
        params.extend(b.params);
        let rows = match self
            .executor(session)
            .fetch_all_tolerating(&sql, &params, &[pg_code::UNDEFINED_TABLE])
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_code(&e, pg_code::UNDEFINED_TABLE) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if options.explain {
            return rows.iter().map(|row| Ok(Value::Object(decode_row(row)?))).collect();
        }
        rows.iter()
            .map(|row| Ok(Value::Object(to_document(&storage, decode_row(row)?))))
            .collect()
    }

    /// Number of objects matching `query`.
    ///
    /// With `estimate` and no filter, the planner's row estimate is returned
    /// when statistics exist.
    pub async fn count(
        &self,
        schema: &ClassSchema,
        query: &Query,
        estimate: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<i64> {
        let where_clause = build_where_clause(&schema.to_storage(), query, 1, false)?;
        let executor = self.executor(session);

        if where_clause.is_empty() && estimate {
            let estimated = executor
                .fetch_optional(
                    "SELECT reltuples FROM pg_class WHERE relname = $1",
                    &[SqlValue::Text(self.config.table_name(&schema.class_name))],
                )
                .await?;
            match estimated {
                None => return Ok(0),
                Some(row) => {
                    let reltuples: Option<f32> = row.try_get(0)?;
                    if let Some(n) = reltuples.filter(|n| *n >= 0.0) {
                        return Ok(n as i64);
                    }
                }
            }
        }

        let sql = format!(
            "SELECT count(*) FROM {}{}",
            self.table(&schema.class_name),
            where_clause.to_sql()
        );
        let rows = executor
            .fetch_all_tolerating(&sql, &where_clause.values, &[pg_code::UNDEFINED_TABLE])
            .await;
        match rows.map(|rows| rows.into_iter().next()) {
            Ok(Some(row)) => Ok(row.try_get(0)?),
            Ok(None) => Ok(0),
            Err(e) if is_code(&e, pg_code::UNDEFINED_TABLE) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Distinct values of `field_name` among objects matching `query`.
    ///
    /// Array fields yield their distinct elements; a dotted name reads one
    /// level into an object field.
    pub async fn distinct(
        &self,
        schema: &ClassSchema,
        query: &Query,
        field_name: &str,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        let storage = schema.to_storage();
        let where_clause = build_where_clause(&storage, query, 1, false)?;
        let (select, shape) = distinct_select(&storage, field_name);
        let sql = format!(
            "SELECT DISTINCT {} FROM {}{}",
            select,
            self.table(&schema.class_name),
            where_clause.to_sql()
        );

        let rows = match self
            .executor(session)
            .fetch_all_tolerating(
                &sql,
                &where_clause.values,
                &[pg_code::UNDEFINED_COLUMN, pg_code::UNDEFINED_TABLE],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e)
                if is_code(&e, pg_code::UNDEFINED_COLUMN)
                    || is_code(&e, pg_code::UNDEFINED_TABLE) =>
            {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut values = Vec::new();
        for row in &rows {
            let decoded = decode_row(row)?;
            let value = match shape {
                DistinctShape::Column => to_document(&storage, decoded).remove(field_name),
                DistinctShape::Raw => decoded.into_iter().next().map(|(_, v)| v),
            };
            if let Some(value) = value.filter(|v| !v.is_null()) {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Run an aggregation pipeline
    #[instrument(skip(self, schema, pipeline, session), fields(class_name = %schema.class_name))]
    pub async fn aggregate(
        &self,
        schema: &ClassSchema,
        pipeline: &[Value],
        explain_plan: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        let storage = schema.to_storage();
        let aggregate = build_aggregate(
            &storage,
            &self.config.table_name(&schema.class_name),
            pipeline,
        )?;
        let sql = if explain_plan {
            explain(&aggregate.sql)
        } else {
            aggregate.sql.clone()
        };

        let rows = match self
            .executor(session)
            .fetch_all_tolerating(&sql, &aggregate.values, &[pg_code::UNDEFINED_TABLE])
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_code(&e, pg_code::UNDEFINED_TABLE) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if explain_plan {
            return rows.iter().map(|row| Ok(Value::Object(decode_row(row)?))).collect();
        }
        let documents = rows
            .iter()
            .map(|row| Ok(to_document(&storage, decode_row(row)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(aggregate.shape(documents))
    }
}

fn explain(sql: &str) -> String {
    format!("EXPLAIN (FORMAT JSON) {}", sql)
}

// ============================================================================
// Statement Builders
// ============================================================================

#[derive(Debug)]
struct InsertStatement {
    sql: String,
    values: Vec<SqlValue>,
    /// Object as written: dot fields expanded and auth data folded
    document: Map<String, Value>,
}

/// Compile an INSERT of `object` into `table`
fn build_insert(
    schema: &ClassSchema,
    table: &str,
    object: Map<String, Value>,
    ignore_conflicts: bool,
) -> Result<InsertStatement> {
    let mut document = Map::new();
    let mut auth_data = Map::new();
    for (key, value) in expand_dot_fields(object) {
        match auth_data_provider(&key) {
            Some(provider) => {
                auth_data.insert(provider.to_string(), value);
            }
            None => {
                document.insert(key, value);
            }
        }
    }
    if !auth_data.is_empty() {
        let entry = document
            .entry("authData")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = entry {
            existing.extend(auth_data);
        }
    }
    validate_keys(&Value::Object(document.clone()))?;

    let mut b = Binder::new(1);
    let mut columns = Vec::new();
    let mut exprs = Vec::new();
    for (name, value) in &document {
        if value.is_null() {
            continue;
        }
        let field_type = schema.field_type(name).ok_or_else(|| {
            StorageError::invalid_json(format!(
                "Field {} is not defined on {}",
                name, schema.class_name
            ))
        })?;
        let expr = match field_type {
            FieldType::Relation { .. } => continue,
            FieldType::GeoPoint => {
                let (lng, lat) = geo_point(value)?;
                let lng = b.bind(SqlValue::Float(lng));
                let lat = b.bind(SqlValue::Float(lat));
                format!("POINT({}, {})", lng, lat)
            }
            FieldType::Polygon => {
                let coordinates = value.get("coordinates").unwrap_or(value);
                format!("{}::polygon", b.bind(SqlValue::Text(polygon_to_sql(coordinates)?)))
            }
            ft if ft.is_string_array() => {
                format!("{}::text[]", b.bind(to_sql_value(Some(ft), value)?))
            }
            FieldType::Array { .. } | FieldType::Object | FieldType::Bytes => {
                format!("{}::jsonb", b.bind(SqlValue::Json(value.clone())))
            }
            ft => b.bind(to_column_value(Some(ft), value)?),
        };
        columns.push(quote_identifier(name));
        exprs.push(expr);
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        exprs.join(", ")
    );
    if ignore_conflicts {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    Ok(InsertStatement {
        sql,
        values: b.params,
        document,
    })
}

/// Initial values for an object created from an update document
fn flatten_update_operators_for_create(update: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut flattened = Map::new();
    for (key, value) in update {
        let Some(op) = value.get("__op").and_then(Value::as_str) else {
            flattened.insert(key.clone(), value.clone());
            continue;
        };
        match op {
            "Increment" | "SetOnInsert" => {
                flattened.insert(key.clone(), value.get("amount").cloned().unwrap_or(Value::Null));
            }
            "Add" | "AddUnique" => {
                let objects = value.get("objects").cloned().unwrap_or(Value::Array(Vec::new()));
                flattened.insert(key.clone(), objects);
            }
            "Remove" => {
                flattened.insert(key.clone(), Value::Array(Vec::new()));
            }
            "Delete" => {}
            other => {
                return Err(StorageError::operation_forbidden(format!(
                    "The {} operator is not supported yet.",
                    other
                )));
            }
        }
    }
    Ok(flattened)
}

/// `ORDER BY` for a find: proximity sorts win over the requested sort
fn order_by(where_clause: &WhereClause, sort: Option<&Map<String, Value>>) -> String {
    if !where_clause.sorts.is_empty() {
        return format!(" ORDER BY {}", where_clause.sorts.join(", "));
    }
    let Some(sort) = sort else {
        return String::new();
    };
    let terms: Vec<String> = sort
        .iter()
        .filter_map(|(key, direction)| {
            let expr = if key == "$score" {
                where_clause.score.clone()?
            } else if key.contains('.') {
                transform_dot_field_to_jsonb(key)
            } else {
                quote_identifier(key)
            };
            let direction = if direction.as_i64() == Some(1) { "ASC" } else { "DESC" };
            Some(format!("{} {}", expr, direction))
        })
        .collect();
    if terms.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", terms.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DistinctShape {
    /// One column named after the field, shaped through the schema
    Column,
    /// A single anonymous value
    Raw,
}

fn distinct_select(schema: &ClassSchema, field_name: &str) -> (String, DistinctShape) {
    if field_name.contains('.') {
        return (
            format!("{} AS \"value\"", transform_dot_field_to_jsonb(field_name)),
            DistinctShape::Raw,
        );
    }
    let col = quote_identifier(field_name);
    match schema.field_type(field_name) {
        Some(ft) if ft.is_string_array() => {
            (format!("unnest({}) AS \"value\"", col), DistinctShape::Raw)
        }
        Some(ft) if ft.is_array() => (
            format!("jsonb_array_elements({}) AS \"value\"", col),
            DistinctShape::Raw,
        ),
        _ => (column_expr(schema, field_name), DistinctShape::Column),
    }
}
