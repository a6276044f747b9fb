//! Update operator translation
//!
//! Turns an update document (plain values plus `{__op: ...}` operators) into
//! `SET` assignments. Array and counter operators are computed natively from
//! the current column value, so concurrent updates never lose writes.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::sql::Binder;
use crate::sql::sanitize::{auth_data_provider, quote_identifier};
use crate::transform::{SqlValue, expand_dot_fields, geo_point, polygon_to_sql, to_sql_value, type_tag};
use crate::types::{ClassSchema, FieldType};

/// `SET` assignments and the values they bind
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClause {
    pub assignments: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl UpdateClause {
    /// Comma-separated assignment list
    pub fn to_sql(&self) -> String {
        self.assignments.join(", ")
    }

    pub fn next_index(&self, start_index: usize) -> usize {
        start_index + self.values.len()
    }
}

fn op_of(value: &Value) -> Option<&str> {
    value.get("__op").and_then(Value::as_str)
}

/// Nested keys of `field` carrying operator `op` in the original (dotted) update
fn nested_keys_with_op<'a>(
    update: &'a Map<String, Value>,
    field: &str,
    op: &str,
) -> Vec<(&'a str, &'a Value)> {
    update
        .iter()
        .filter(|(_, v)| op_of(v) == Some(op))
        .filter_map(|(k, v)| match k.split('.').collect::<Vec<_>>().as_slice() {
            [first, nested] if *first == field => Some((*nested, v)),
            _ => None,
        })
        .collect()
}

/// Translate `update` into assignments, numbering placeholders from `start_index`
pub fn build_update(
    schema: &ClassSchema,
    update: &Map<String, Value>,
    start_index: usize,
) -> Result<UpdateClause> {
    // A field written through dot notation is merged, otherwise overwritten
    let merged_fields: Vec<&str> = update
        .keys()
        .filter_map(|k| k.split_once('.').map(|(first, _)| first))
        .collect();

    let mut expanded = Map::new();
    let mut auth_data = Map::new();
    for (key, value) in expand_dot_fields(update.clone()) {
        match auth_data_provider(&key) {
            Some(provider) => {
                auth_data.insert(provider.to_string(), value);
            }
            None => {
                expanded.insert(key, value);
            }
        }
    }
    if !auth_data.is_empty() {
        let entry = expanded
            .entry("authData")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = entry {
            existing.extend(auth_data);
        }
    }

    let mut b = Binder::new(start_index);
    let mut assignments = Vec::new();
    for (name, value) in &expanded {
        let col = quote_identifier(name);
        let field_type = schema.field_type(name);

        if value.is_null() || op_of(value) == Some("Delete") {
            assignments.push(format!("{} = NULL", col));
            continue;
        }

        if name == "authData" {
            let Value::Object(providers) = value else {
                return Err(StorageError::invalid_json("authData should be an object"));
            };
            let mut expr = col.clone();
            for (provider, data) in providers {
                let data = if op_of(data) == Some("Delete") {
                    Value::Null
                } else {
                    data.clone()
                };
                let key = b.bind(SqlValue::text(provider.as_str()));
                let val = b.bind(SqlValue::Json(data));
                expr = format!(
                    "json_object_set_key(COALESCE({}, '{{}}'::jsonb), {}::text, {}::jsonb)::jsonb",
                    expr, key, val
                );
            }
            assignments.push(format!("{} = {}", col, expr));
            continue;
        }

        match op_of(value) {
            Some("Increment") => {
                let amount = value.get("amount").and_then(Value::as_f64).ok_or_else(|| {
                    StorageError::invalid_json("Increment amount should be a number")
                })?;
                let p = b.bind(SqlValue::Float(amount));
                assignments.push(format!("{} = COALESCE({}, 0) + {}", col, col, p));
                continue;
            }
            Some(op @ ("Add" | "Remove" | "AddUnique")) => {
                let objects = value.get("objects").cloned().unwrap_or(Value::Array(vec![]));
                let function = match op {
                    "Add" => "array_add",
                    "Remove" => "array_remove",
                    _ => "array_add_unique",
                };
                let p = b.bind(SqlValue::Json(objects));
                assignments.push(format!(
                    "{} = {}(COALESCE({}, '[]'::jsonb), {}::jsonb)",
                    col, function, col, p
                ));
                continue;
            }
            _ => {}
        }

        let assignment = match value {
            Value::String(_) | Value::Bool(_) | Value::Number(_) => {
                format!("{} = {}", col, b.bind(to_sql_value(field_type, value)?))
            }
            Value::Object(_) => match type_tag(value) {
                Some("Pointer" | "Date" | "File") => {
                    format!("{} = {}", col, b.bind(to_sql_value(field_type, value)?))
                }
                Some("GeoPoint") => {
                    let (lng, lat) = geo_point(value)?;
                    let lng = b.bind(SqlValue::Float(lng));
                    let lat = b.bind(SqlValue::Float(lat));
                    format!("{} = POINT({}, {})", col, lng, lat)
                }
                Some("Polygon") => {
                    let coordinates = value.get("coordinates").cloned().unwrap_or(Value::Null);
                    let p = b.bind(SqlValue::Text(polygon_to_sql(&coordinates)?));
                    format!("{} = {}::polygon", col, p)
                }
                Some("Relation") => continue,
                _ if field_type == Some(&FieldType::Object) => {
                    object_assignment(&col, name, value, update, merged_fields.contains(&name.as_str()), &mut b)?
                }
                Some("Bytes") if field_type == Some(&FieldType::Bytes) => {
                    format!("{} = {}::jsonb", col, b.bind(SqlValue::Json(value.clone())))
                }
                _ => return Err(unsupported(value)),
            },
            Value::Array(_) if field_type.is_some_and(FieldType::is_array) => {
                let cast = if field_type.is_some_and(FieldType::is_string_array) {
                    "text[]"
                } else {
                    "jsonb"
                };
                let p = b.bind(to_sql_value(field_type, value)?);
                format!("{} = {}::{}", col, p, cast)
            }
            _ => return Err(unsupported(value)),
        };
        assignments.push(assignment);
    }

    Ok(UpdateClause {
        assignments,
        values: b.params,
    })
}

/// Object column: start from the current value when merging, drop nested
/// deletes, apply nested increments, then overlay the remaining keys
fn object_assignment(
    col: &str,
    name: &str,
    value: &Value,
    original: &Map<String, Value>,
    merge: bool,
    b: &mut Binder,
) -> Result<String> {
    let mut rest = value.as_object().cloned().unwrap_or_default();
    let mut expr = if merge {
        format!("COALESCE({}, '{{}}'::jsonb)", col)
    } else {
        "'{}'::jsonb".to_string()
    };

    for (key, _) in nested_keys_with_op(original, name, "Delete") {
        rest.remove(key);
        expr = format!("{} - {}::text", expr, b.bind(SqlValue::text(key)));
    }
    for (key, op) in nested_keys_with_op(original, name, "Increment") {
        rest.remove(key);
        let amount = op.get("amount").and_then(Value::as_f64).ok_or_else(|| {
            StorageError::invalid_json("Increment amount should be a number")
        })?;
        let k = b.bind(SqlValue::text(key));
        let a = b.bind(SqlValue::Float(amount));
        expr = format!(
            "{} || jsonb_build_object({}::text, COALESCE(({}->>{}::text)::double precision, 0) + {})",
            expr, k, col, k, a
        );
    }

    let p = b.bind(SqlValue::Json(Value::Object(rest)));
    Ok(format!("{} = ({} || {}::jsonb)", col, expr, p))
}

fn unsupported(value: &Value) -> StorageError {
    debug!(value = %value, "Not supported update");
    StorageError::operation_forbidden(format!("Postgres doesn't support update {} yet", value))
}
