//! Value transformers between the document format and native column values
//!
//! Outbound values become [`SqlValue`] bind parameters typed after the target
//! column; inbound rows are decoded by native type and re-shaped into
//! documents using the owning class schema.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Number, Value, json};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use tracing::warn;

use crate::error::{Result, StorageError};
use crate::types::{ClassSchema, FieldType};

/// Columns that are exposed as plain ISO strings instead of Date objects
const PLAIN_DATE_FIELDS: [&str; 2] = ["createdAt", "updatedAt"];

// ============================================================================
// Bind Parameters
// ============================================================================

/// A typed bind parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }

    /// Bind onto a query
    pub fn bind<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::TextArray(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(v.clone()),
            SqlValue::Timestamp(t) => query.bind(*t),
        }
    }
}

/// Bind every parameter in order
pub fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = param.bind(query);
    }
    query
}

// ============================================================================
// Outbound (document -> native)
// ============================================================================

/// Convert a document value into a bind parameter for a column of `field_type`.
///
/// Tagged `Date`/`Pointer`/`File` objects collapse to their scalar payload;
/// string arrays stay native for `text[]` columns; everything else that is
/// structured is sent as JSON.
pub fn to_sql_value(field_type: Option<&FieldType>, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Bool(b) => SqlValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Int(i),
            None => SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) if field_type == Some(&FieldType::Date) => {
            SqlValue::Timestamp(parse_timestamp(s)?)
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(items) if field_type.is_some_and(FieldType::is_string_array) => {
            SqlValue::TextArray(
                items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            StorageError::invalid_json(format!(
                                "expected an array of strings, got {}",
                                item
                            ))
                        })
                    })
                    .collect::<Result<_>>()?,
            )
        }
        Value::Object(obj) => match type_tag(value) {
            Some("Date") => SqlValue::Timestamp(parse_timestamp(iso_of(obj)?)?),
            Some("Pointer") => SqlValue::Text(string_member(obj, "objectId")?),
            Some("File") => SqlValue::Text(string_member(obj, "name")?),
            _ => SqlValue::Json(value.clone()),
        },
        Value::Array(_) | Value::Null => SqlValue::Json(value.clone()),
    })
}

/// Convert a scalar for comparison against a column of `field_type`.
///
/// Binds are typed, so the value follows the column: numbers compare as
/// doubles, text columns receive the textual form of numbers and booleans.
pub fn to_column_value(field_type: Option<&FieldType>, value: &Value) -> Result<SqlValue> {
    match (field_type, value) {
        (Some(FieldType::Number), Value::Number(n)) => {
            Ok(SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)))
        }
        (Some(FieldType::Number), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(SqlValue::Float)
            .map_err(|_| StorageError::invalid_json(format!("{} is not a number", s))),
        (
            Some(FieldType::String | FieldType::File | FieldType::Pointer { .. }),
            Value::Number(_) | Value::Bool(_),
        ) => Ok(SqlValue::Text(value.to_string())),
        (Some(FieldType::Boolean), Value::String(s)) if s == "true" || s == "false" => {
            Ok(SqlValue::Bool(s == "true"))
        }
        _ => to_sql_value(field_type, value),
    }
}

/// Textual form of a scalar (strings unquoted), as `->>` extraction yields it
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => match type_tag(other) {
            Some("Pointer") => other
                .get("objectId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some("Date") => other
                .get("iso")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => other.to_string(),
        },
    }
}

/// `__type` tag of a tagged object value
pub fn type_tag(value: &Value) -> Option<&str> {
    value.get("__type").and_then(Value::as_str)
}

/// Parse an ISO-8601 timestamp
pub fn parse_timestamp(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::invalid_json(format!("invalid date {}: {}", iso, e)))
}

/// Format a timestamp the way documents carry it
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn iso_of(obj: &Map<String, Value>) -> Result<&str> {
    obj.get("iso")
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::invalid_json("Date object without iso"))
}

fn string_member(obj: &Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StorageError::invalid_json(format!("expected string {}", key)))
}

/// Validate latitude/longitude bounds
pub fn validate_geo_point(latitude: f64, longitude: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(StorageError::invalid_json(format!(
            "GeoPoint latitude out of bounds: {}.",
            latitude
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(StorageError::invalid_json(format!(
            "GeoPoint longitude out of bounds: {}.",
            longitude
        )));
    }
    Ok(())
}

/// `(longitude, latitude)` of a tagged GeoPoint, validated
pub fn geo_point(value: &Value) -> Result<(f64, f64)> {
    if type_tag(value) != Some("GeoPoint") {
        return Err(StorageError::invalid_json(format!(
            "expected GeoPoint, got {}",
            value
        )));
    }
    let coordinate = |key: &str| {
        value.get(key).and_then(Value::as_f64).ok_or_else(|| {
            StorageError::invalid_json(format!("GeoPoint {} should be a number", key))
        })
    };
    let latitude = coordinate("latitude")?;
    let longitude = coordinate("longitude")?;
    validate_geo_point(latitude, longitude)?;
    Ok((longitude, latitude))
}

fn coordinate_pair(value: &Value) -> Result<(f64, f64)> {
    match value.as_array().map(Vec::as_slice) {
        Some([a, b]) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(StorageError::invalid_json("coordinates should be numbers")),
        },
        _ => Err(StorageError::invalid_json(
            "coordinates should be [latitude, longitude] pairs",
        )),
    }
}

/// Render polygon coordinates (`[latitude, longitude]` pairs) as a native
/// polygon literal of `(longitude, latitude)` points.
///
/// The ring is closed when open; fewer than three distinct vertices is an
/// internal error.
pub fn polygon_to_sql(coordinates: &Value) -> Result<String> {
    let pairs = coordinates
        .as_array()
        .ok_or_else(|| StorageError::invalid_json("Polygon coordinates should be an array"))?
        .iter()
        .map(coordinate_pair)
        .collect::<Result<Vec<_>>>()?;
    polygon_points_to_sql(pairs)
}

pub(crate) fn polygon_points_to_sql(mut pairs: Vec<(f64, f64)>) -> Result<String> {
    if pairs.len() < 3 {
        return Err(StorageError::invalid_json(
            "Polygon must have at least 3 values",
        ));
    }
    if pairs.first() != pairs.last() {
        pairs.push(pairs[0]);
    }
    let mut distinct: Vec<(f64, f64)> = Vec::new();
    for pair in &pairs {
        if !distinct.contains(pair) {
            distinct.push(*pair);
        }
    }
    if distinct.len() < 3 {
        return Err(StorageError::internal(
            "GeoJSON: Loop must have at least 3 different vertices",
        ));
    }
    let points = pairs
        .iter()
        .map(|&(latitude, longitude)| {
            validate_geo_point(latitude, longitude)?;
            Ok(format!("({}, {})", longitude, latitude))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", points.join(", ")))
}

// ============================================================================
// Inbound (native -> document)
// ============================================================================

/// Decode every column of a row by its native type.
///
/// Timestamps come back tagged as `{__type: "Date", iso}`; SQL NULLs are kept
/// as JSON null so callers can decide whether to drop them.
pub fn decode_row(row: &PgRow) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_column(row, idx)?);
    }
    Ok(map)
}

fn decode_column(row: &PgRow, idx: usize) -> Result<Value> {
    let type_name = row.column(idx).type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::from(i64::from(v))),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::from(i64::from(v))),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .and_then(|v| number_value(f64::from(v))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)?
            .and_then(number_value),
        "NUMERIC" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)?
            .and_then(|d| d.to_f64())
            .and_then(number_value),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|dt| date_object(&dt)),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)?
            .map(|dt| date_object(&dt.and_utc())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx)?,
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Option<Vec<String>>, _>(idx)?
            .map(Value::from),
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(text) => text.map(Value::String),
            Err(e) => {
                warn!(
                    column = row.column(idx).name(),
                    type_name = %type_name,
                    error = %e,
                    "Unsupported column type, returning null"
                );
                None
            }
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Largest magnitude at which every integer is exactly representable as `f64`
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Numbers stored in double precision columns come back as integers when
/// they have no fractional part
fn number_value(v: f64) -> Option<Value> {
    if v.is_finite() && v.fract() == 0.0 && v.abs() <= MAX_EXACT_INTEGER {
        return Some(Value::from(v as i64));
    }
    Number::from_f64(v).map(Value::Number)
}

fn date_object(dt: &DateTime<Utc>) -> Value {
    json!({ "__type": "Date", "iso": format_timestamp(dt) })
}

/// Parse a native point literal `(x,y)`
fn parse_point(text: &str) -> Option<(f64, f64)> {
    let inner = text.trim().trim_start_matches('(').trim_end_matches(')');
    let (x, y) = inner.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Parse a native polygon literal `((x1,y1),(x2,y2),...)` into points
fn parse_polygon(text: &str) -> Option<Vec<(f64, f64)>> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("((")?.strip_suffix("))")?;
    inner.split("),(").map(parse_point).collect()
}

/// Shape a decoded row into a document for `schema`.
///
/// Pointer, Relation, File, GeoPoint and Polygon columns are re-wrapped using
/// the schema; `createdAt`/`updatedAt` are plain ISO strings; null columns
/// are omitted.
pub fn to_document(schema: &ClassSchema, mut row: Map<String, Value>) -> Map<String, Value> {
    for (name, field) in &schema.fields {
        match &field.field_type {
            FieldType::Relation { target_class } => {
                row.insert(
                    name.clone(),
                    json!({ "__type": "Relation", "className": target_class }),
                );
            }
            FieldType::Pointer { target_class } => {
                if let Some(Value::String(id)) = row.get(name) {
                    let pointer =
                        json!({ "__type": "Pointer", "className": target_class, "objectId": id });
                    row.insert(name.clone(), pointer);
                }
            }
            FieldType::File => {
                if let Some(Value::String(file)) = row.get(name) {
                    let file = json!({ "__type": "File", "name": file });
                    row.insert(name.clone(), file);
                }
            }
            FieldType::GeoPoint => {
                if let Some((x, y)) = row.get(name).and_then(Value::as_str).and_then(parse_point) {
                    row.insert(
                        name.clone(),
                        json!({ "__type": "GeoPoint", "latitude": y, "longitude": x }),
                    );
                }
            }
            FieldType::Polygon => {
                if let Some(points) = row
                    .get(name)
                    .and_then(Value::as_str)
                    .and_then(parse_polygon)
                {
                    let coordinates: Vec<Value> =
                        points.into_iter().map(|(x, y)| json!([y, x])).collect();
                    row.insert(
                        name.clone(),
                        json!({ "__type": "Polygon", "coordinates": coordinates }),
                    );
                }
            }
            _ => {}
        }
    }

    for name in PLAIN_DATE_FIELDS {
        if let Some(iso) = row
            .get(name)
            .filter(|v| type_tag(v) == Some("Date"))
            .and_then(|v| v.get("iso"))
            .cloned()
        {
            row.insert(name.to_string(), iso);
        }
    }

    row.retain(|_, v| !v.is_null());
    row
}

/// Check written keys for `$` and `.`, which would smuggle operators
pub fn validate_keys(value: &Value) -> Result<()> {
    if let Value::Object(obj) = value {
        for (key, nested) in obj {
            validate_keys(nested)?;
            if key.contains('$') || key.contains('.') {
                return Err(StorageError::invalid_nested_key(
                    "Nested keys should not contain the '$' or '.' characters",
                ));
            }
        }
    }
    Ok(())
}

/// Expand dot-notation keys (`a.b.c`) into nested objects. A `Delete`
/// operation on a nested key leaves the key absent.
pub fn expand_dot_fields(object: Map<String, Value>) -> Map<String, Value> {
    let mut expanded = Map::new();
    for (key, value) in object {
        if !key.contains('.') {
            expanded.insert(key, value);
            continue;
        }
        let value = (value.get("__op").and_then(Value::as_str) != Some("Delete")).then_some(value);
        let mut components = key.split('.');
        let Some(first) = components.next() else {
            continue;
        };
        let mut current = expanded
            .entry(first.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let rest: Vec<&str> = components.collect();
        for (i, component) in rest.iter().enumerate() {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let Value::Object(obj) = current else {
                break;
            };
            if i + 1 == rest.len() {
                if let Some(value) = &value {
                    obj.insert(component.to_string(), value.clone());
                }
                break;
            }
            current = obj
                .entry(component.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ClassSchema {
        ClassSchema::new("Place")
            .field("owner", FieldType::pointer("_User"))
            .field("tags", FieldType::relation("Tag"))
            .field("photo", FieldType::File)
            .field("loc", FieldType::GeoPoint)
            .field("area", FieldType::Polygon)
            .field("seen", FieldType::Date)
            .field("labels", FieldType::string_array())
    }

    // =========================================================================
    // Outbound Tests
    // =========================================================================

    #[test]
    fn test_scalar_outbound() {
        assert_eq!(to_sql_value(None, &json!(true)).unwrap(), SqlValue::Bool(true));
        assert_eq!(to_sql_value(None, &json!(3)).unwrap(), SqlValue::Int(3));
        assert_eq!(to_sql_value(None, &json!(2.5)).unwrap(), SqlValue::Float(2.5));
        assert_eq!(
            to_sql_value(Some(&FieldType::String), &json!("x")).unwrap(),
            SqlValue::text("x")
        );
    }

    #[test]
    fn test_tagged_outbound() {
        let date = to_sql_value(
            Some(&FieldType::Date),
            &json!({"__type": "Date", "iso": "2020-01-02T03:04:05.000Z"}),
        )
        .unwrap();
        assert!(matches!(date, SqlValue::Timestamp(_)));

        let pointer = to_sql_value(
            None,
            &json!({"__type": "Pointer", "className": "_User", "objectId": "abc"}),
        )
        .unwrap();
        assert_eq!(pointer, SqlValue::text("abc"));

        let file = to_sql_value(None, &json!({"__type": "File", "name": "a.png"})).unwrap();
        assert_eq!(file, SqlValue::text("a.png"));
    }

    #[test]
    fn test_string_to_date_column() {
        let value = to_sql_value(Some(&FieldType::Date), &json!("2020-01-02T03:04:05Z")).unwrap();
        assert!(matches!(value, SqlValue::Timestamp(_)));
        assert!(to_sql_value(Some(&FieldType::Date), &json!("yesterday")).is_err());
    }

    #[test]
    fn test_array_outbound() {
        let native = to_sql_value(Some(&FieldType::string_array()), &json!(["a", "b"])).unwrap();
        assert_eq!(native, SqlValue::TextArray(vec!["a".into(), "b".into()]));

        let jsonb = to_sql_value(Some(&FieldType::Array { contents: None }), &json!([1, 2])).unwrap();
        assert_eq!(jsonb, SqlValue::Json(json!([1, 2])));

        assert!(to_sql_value(Some(&FieldType::string_array()), &json!(["a", 1])).is_err());
    }

    #[test]
    fn test_column_value_follows_column_type() {
        assert_eq!(
            to_column_value(Some(&FieldType::Number), &json!(3)).unwrap(),
            SqlValue::Float(3.0)
        );
        assert_eq!(
            to_column_value(Some(&FieldType::Number), &json!("2.5")).unwrap(),
            SqlValue::Float(2.5)
        );
        assert!(to_column_value(Some(&FieldType::Number), &json!("abc")).is_err());
        assert_eq!(
            to_column_value(Some(&FieldType::String), &json!(7)).unwrap(),
            SqlValue::text("7")
        );
        assert_eq!(
            to_column_value(Some(&FieldType::Boolean), &json!("true")).unwrap(),
            SqlValue::Bool(true)
        );
        assert_eq!(to_column_value(None, &json!(7)).unwrap(), SqlValue::Int(7));
    }

    #[test]
    fn test_scalar_text() {
        assert_eq!(scalar_text(&json!("a")), "a");
        assert_eq!(scalar_text(&json!(3)), "3");
        assert_eq!(scalar_text(&json!(true)), "true");
        assert_eq!(
            scalar_text(&json!({"__type": "Pointer", "className": "A", "objectId": "x"})),
            "x"
        );
    }

    #[test]
    fn test_geo_point() {
        let point = json!({"__type": "GeoPoint", "latitude": 10.0, "longitude": 20.0});
        assert_eq!(geo_point(&point).unwrap(), (20.0, 10.0));

        let bad = json!({"__type": "GeoPoint", "latitude": 91.0, "longitude": 0.0});
        assert!(matches!(geo_point(&bad), Err(StorageError::InvalidJson(_))));
    }

    // =========================================================================
    // Polygon Tests
    // =========================================================================

    #[test]
    fn test_polygon_closes_ring() {
        let sql = polygon_to_sql(&json!([[0, 0], [0, 1], [1, 1]])).unwrap();
        assert_eq!(sql, "((0, 0), (1, 0), (1, 1), (0, 0))");
    }

    #[test]
    fn test_polygon_already_closed() {
        let sql = polygon_to_sql(&json!([[0, 0], [0, 1], [1, 1], [0, 0]])).unwrap();
        assert_eq!(sql, "((0, 0), (1, 0), (1, 1), (0, 0))");
    }

    #[test]
    fn test_polygon_too_few_values() {
        let err = polygon_to_sql(&json!([[0, 0], [0, 1]])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[test]
    fn test_polygon_degenerate_vertices() {
        let err = polygon_to_sql(&json!([[0, 0], [0, 1], [0, 0], [0, 1]])).unwrap_err();
        assert!(matches!(err, StorageError::InternalServerError(_)));
    }

    #[test]
    fn test_polygon_out_of_bounds() {
        let err = polygon_to_sql(&json!([[0, 0], [95, 1], [1, 1]])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    // =========================================================================
    // Inbound Tests
    // =========================================================================

    #[test]
    fn test_native_literal_parsing() {
        assert_eq!(parse_point("(1.5,-2)"), Some((1.5, -2.0)));
        assert_eq!(
            parse_polygon("((0,0),(1,0),(1,1),(0,0))"),
            Some(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)])
        );
        assert_eq!(parse_point("garbage"), None);
    }

    #[test]
    fn test_to_document_rewraps_types() {
        let mut row = Map::new();
        row.insert("objectId".into(), json!("o1"));
        row.insert("owner".into(), json!("u1"));
        row.insert("photo".into(), json!("p.png"));
        row.insert("loc".into(), json!("(20,10)"));
        row.insert("area".into(), json!("((1,0),(1,1),(0,0),(1,0))"));
        row.insert(
            "createdAt".into(),
            json!({"__type": "Date", "iso": "2020-01-01T00:00:00.000Z"}),
        );
        row.insert(
            "seen".into(),
            json!({"__type": "Date", "iso": "2020-01-01T00:00:00.000Z"}),
        );
        row.insert("labels".into(), Value::Null);

        let doc = to_document(&schema(), row);
        assert_eq!(
            doc["owner"],
            json!({"__type": "Pointer", "className": "_User", "objectId": "u1"})
        );
        assert_eq!(doc["tags"], json!({"__type": "Relation", "className": "Tag"}));
        assert_eq!(doc["photo"], json!({"__type": "File", "name": "p.png"}));
        assert_eq!(
            doc["loc"],
            json!({"__type": "GeoPoint", "latitude": 10.0, "longitude": 20.0})
        );
        assert_eq!(
            doc["area"]["coordinates"],
            json!([[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [0.0, 1.0]])
        );
        assert_eq!(doc["createdAt"], json!("2020-01-01T00:00:00.000Z"));
        assert_eq!(doc["seen"]["__type"], json!("Date"));
        assert!(!doc.contains_key("labels"));
    }

    #[test]
    fn test_polygon_round_trip_preserves_order() {
        let sql = polygon_to_sql(&json!([[10, 20], [30, 40], [50, 60]])).unwrap();
        let native = sql.replace(' ', "");
        let mut row = Map::new();
        row.insert("area".into(), json!(native));
        let doc = to_document(&schema(), row);
        assert_eq!(
            doc["area"]["coordinates"],
            json!([[10.0, 20.0], [30.0, 40.0], [50.0, 60.0], [10.0, 20.0]])
        );
    }

    // =========================================================================
    // Key Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_keys() {
        assert!(validate_keys(&json!({"a": {"b": 1}})).is_ok());
        assert!(matches!(
            validate_keys(&json!({"a": {"$gt": 1}})),
            Err(StorageError::InvalidNestedKey(_))
        ));
        assert!(validate_keys(&json!({"a.b": 1})).is_err());
    }

    #[test]
    fn test_expand_dot_fields() {
        let mut object = Map::new();
        object.insert("name".into(), json!("x"));
        object.insert("meta.size".into(), json!(3));
        object.insert("meta.tag.color".into(), json!("red"));
        object.insert("meta.old".into(), json!({"__op": "Delete"}));

        let expanded = expand_dot_fields(object);
        assert_eq!(expanded["name"], json!("x"));
        assert_eq!(
            expanded["meta"],
            json!({"size": 3, "tag": {"color": "red"}})
        );
    }

    // =========================================================================
    // Numeric Decoding Tests
    // =========================================================================

    #[test]
    fn test_number_value_keeps_integers_integral() {
        assert_eq!(number_value(2.0), Some(json!(2)));
        assert_eq!(number_value(-7.0), Some(json!(-7)));
        assert_eq!(number_value(2.5), Some(json!(2.5)));
        assert_eq!(number_value(1e300), Some(json!(1e300)));
        assert_eq!(number_value(f64::NAN), None);
        assert!(number_value(3.0).unwrap().is_i64());
    }
}
