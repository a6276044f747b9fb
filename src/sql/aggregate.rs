//! Aggregation pipeline translation
//!
//! A pipeline of `$group`, `$project`, `$match`, `$sort`, `$skip` and `$limit`
//! stages is compiled into a single `SELECT`. `$match` accepts comparators and
//! plain equality on declared fields, compiled by the where-clause compiler.

use serde_json::{Map, Value};

use crate::error::{Result, StorageError};
use crate::query::{Clause, Comparator, Constraint, Operator, Query};
use crate::sql::sanitize::quote_identifier;
use crate::sql::{Binder, column_expr, compile_query, projection};
use crate::transform::SqlValue;
use crate::types::ClassSchema;

/// Compiled pipeline plus what is needed to shape its rows
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub sql: String,
    pub values: Vec<SqlValue>,
    /// Output column holding `COUNT(*)`
    pub count_field: Option<String>,
    /// Aliases of a composite group key, folded back into `objectId`
    pub group_aliases: Vec<String>,
}

/// Date part extracted for a `$group` key operator
fn date_part(operator: &str) -> Option<&'static str> {
    Some(match operator {
        "$dayOfMonth" => "DAY",
        "$dayOfWeek" => "DOW",
        "$dayOfYear" => "DOY",
        "$isoDayOfWeek" => "ISODOW",
        "$isoWeekYear" => "ISOYEAR",
        "$hour" => "HOUR",
        "$minute" => "MINUTE",
        "$second" => "SECOND",
        "$millisecond" => "MILLISECONDS",
        "$month" => "MONTH",
        "$week" => "WEEK",
        "$year" => "YEAR",
        _ => return None,
    })
}

/// `$field` reference to column name
pub fn transform_aggregate_field(reference: &str) -> &str {
    match reference {
        "$_created_at" => "createdAt",
        "$_updated_at" => "updatedAt",
        other => other.strip_prefix('$').unwrap_or(other),
    }
}

fn field_reference(value: &Value) -> Option<&str> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(transform_aggregate_field)
}

/// Compile `pipeline` against the class table `table`
pub fn build_aggregate(schema: &ClassSchema, table: &str, pipeline: &[Value]) -> Result<AggregateQuery> {
    let mut b = Binder::new(1);
    let mut columns: Vec<String> = Vec::new();
    let mut select_all = false;
    let mut count_field = None;
    let mut group_aliases = Vec::new();
    let mut match_conditions: Vec<String> = Vec::new();
    let mut group_pattern = String::new();
    let mut sort_pattern = String::new();
    let mut limit_pattern = String::new();
    let mut skip_pattern = String::new();

    for stage in pipeline {
        let Value::Object(stage) = stage else {
            return Err(StorageError::invalid_query(format!(
                "pipeline stage should be an object, got {}",
                stage
            )));
        };
        match stage.get("$group") {
            Some(Value::Object(group)) => {
                for (field, value) in group {
                    match (field.as_str(), value) {
                        (_, Value::Null) => {}
                        ("_id", Value::String(s)) if !s.is_empty() => {
                            let source = quote_identifier(transform_aggregate_field(s));
                            columns.push(format!("{} AS \"objectId\"", source));
                            group_pattern = format!(" GROUP BY {}", source);
                        }
                        ("_id", Value::Object(keys)) if !keys.is_empty() => {
                            let mut group_by: Vec<String> = Vec::new();
                            for (alias, key) in keys {
                                let (source, expr) = match key {
                                    Value::String(_) => match field_reference(key) {
                                        Some(source) => {
                                            let col = quote_identifier(source);
                                            (col.clone(), col)
                                        }
                                        None => continue,
                                    },
                                    Value::Object(op) => {
                                        let Some((operator, reference)) = op.iter().next() else {
                                            continue;
                                        };
                                        let (Some(part), Some(source)) =
                                            (date_part(operator), field_reference(reference))
                                        else {
                                            continue;
                                        };
                                        let col = quote_identifier(source);
                                        let expr = format!(
                                            "EXTRACT({} FROM {} AT TIME ZONE 'UTC')::integer",
                                            part, col
                                        );
                                        (col, expr)
                                    }
                                    _ => continue,
                                };
                                if !group_by.contains(&source) {
                                    group_by.push(source);
                                }
                                columns.push(format!("{} AS {}", expr, quote_identifier(alias)));
                                group_aliases.push(alias.clone());
                            }
                            group_pattern = format!(" GROUP BY {}", group_by.join(", "));
                        }
                        (_, Value::Object(accumulator)) => {
                            let alias = quote_identifier(field);
                            if let Some(sum) = accumulator.get("$sum") {
                                match field_reference(sum) {
                                    Some(source) => columns.push(format!(
                                        "SUM({}) AS {}",
                                        quote_identifier(source),
                                        alias
                                    )),
                                    None => {
                                        count_field = Some(field.clone());
                                        columns.push(format!("COUNT(*) AS {}", alias));
                                    }
                                }
                            }
                            for (key, function) in [("$max", "MAX"), ("$min", "MIN"), ("$avg", "AVG")] {
                                if let Some(source) = accumulator.get(key).and_then(field_reference) {
                                    columns.push(format!(
                                        "{}({}) AS {}",
                                        function,
                                        quote_identifier(source),
                                        alias
                                    ));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some(other) => {
                return Err(StorageError::invalid_query(format!(
                    "$group should be an object, got {}",
                    other
                )));
            }
            None => select_all = true,
        }

        if let Some(Value::Object(project)) = stage.get("$project") {
            select_all = false;
            for (field, value) in project {
                if matches!(value, Value::Bool(true)) || value.as_i64() == Some(1) {
                    columns.push(column_expr(schema, field));
                }
            }
        }

        if let Some(Value::Object(matcher)) = stage.get("$match") {
            if let Some(condition) = compile_match(schema, matcher, &mut b)? {
                match_conditions.push(condition);
            }
        }

        if let Some(limit) = stage.get("$limit").and_then(Value::as_i64) {
            limit_pattern = format!(" LIMIT {}", b.bind(SqlValue::Int(limit)));
        }
        if let Some(skip) = stage.get("$skip").and_then(Value::as_i64) {
            skip_pattern = format!(" OFFSET {}", b.bind(SqlValue::Int(skip)));
        }
        if let Some(Value::Object(sort)) = stage.get("$sort") {
            let terms: Vec<String> = sort
                .iter()
                .map(|(key, direction)| {
                    let key = if key == "_id" { "objectId" } else { key.as_str() };
                    let order = if direction.as_i64() == Some(1) { "ASC" } else { "DESC" };
                    format!("{} {}", quote_identifier(key), order)
                })
                .collect();
            if !terms.is_empty() {
                sort_pattern = format!(" ORDER BY {}", terms.join(", "));
            }
        }
    }

    // Successive `$match` stages narrow the same row set
    let where_pattern = match match_conditions.as_slice() {
        [] => String::new(),
        [single] => format!(" WHERE {}", single),
        several => format!(
            " WHERE {}",
            several
                .iter()
                .map(|condition| format!("({})", condition))
                .collect::<Vec<_>>()
                .join(" AND ")
        ),
    };

    if select_all && group_pattern.is_empty() {
        columns.insert(0, projection(schema, None));
    }
    if columns.is_empty() {
        columns.push(projection(schema, None));
    }

    let sql = format!(
        "SELECT {} FROM {}{}{}{}{}{}",
        columns.join(", "),
        quote_identifier(table),
        where_pattern,
        group_pattern,
        sort_pattern,
        limit_pattern,
        skip_pattern
    );
    Ok(AggregateQuery {
        sql,
        values: b.params,
        count_field,
        group_aliases,
    })
}

/// `$match`: comparators on any field, plain equality on declared fields;
/// `$or` entries are collapsed and joined with OR
fn compile_match(schema: &ClassSchema, matcher: &Map<String, Value>, b: &mut Binder) -> Result<Option<String>> {
    let (fields, joiner) = match matcher.get("$or") {
        Some(Value::Array(alternatives)) => {
            let mut collapsed = Map::new();
            for alternative in alternatives.iter().filter_map(Value::as_object) {
                collapsed.extend(alternative.clone());
            }
            (collapsed, " OR ")
        }
        _ => (matcher.clone(), " AND "),
    };

    let mut patterns = Vec::new();
    for (field, value) in &fields {
        let name = if field == "_id" { "objectId" } else { field.as_str() };
        let comparisons: Vec<Operator> = value
            .as_object()
            .map(|ops| {
                ops.iter()
                    .filter_map(|(key, operand)| {
                        let cmp = Comparator::from_key(key)?;
                        (!operand.is_null()).then(|| Operator::Compare(cmp, operand.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let constraint = if !comparisons.is_empty() {
            Constraint::Operators(comparisons)
        } else if schema.field_type(name).is_some() {
            match Constraint::parse(value)? {
                Constraint::Operators(_) => continue,
                literal => literal,
            }
        } else {
            continue;
        };
        let query = Query {
            clauses: vec![Clause::Field {
                name: name.to_string(),
                constraint,
            }],
        };
        let result = compile_query(schema, &query, b.next, false)?;
        patterns.push(format!("({})", result.fragment));
        b.absorb(result);
    }

    if patterns.is_empty() {
        return Ok(None);
    }
    Ok(Some(patterns.join(joiner)))
}

impl AggregateQuery {
    /// Post-process decoded rows: default `objectId` to null, rebuild a
    /// composite group key, and make the count an integer
    pub fn shape(&self, rows: Vec<Map<String, Value>>) -> Vec<Value> {
        rows.into_iter()
            .map(|mut row| {
                if !row.contains_key("objectId") {
                    row.insert("objectId".to_string(), Value::Null);
                }
                if !self.group_aliases.is_empty() {
                    let key: Map<String, Value> = self
                        .group_aliases
                        .iter()
                        .map(|alias| (alias.clone(), row.remove(alias).unwrap_or(Value::Null)))
                        .collect();
                    row.insert("objectId".to_string(), Value::Object(key));
                }
                if let Some(field) = &self.count_field {
                    if let Some(count) = row.get(field).and_then(Value::as_f64) {
                        row.insert(field.clone(), Value::from(count as i64));
                    }
                }
                Value::Object(row)
            })
            .collect()
    }
}
