//! Parsed query representation
//!
//! A JSON query (`{"field": constraint, "$or": [...]}`) is parsed once into a
//! closed set of variants so the compiler can dispatch on them instead of
//! probing operator keys.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError};
use crate::transform::{geo_point, type_tag, validate_geo_point};

/// A parsed query: clauses joined with AND, in key order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

/// One top-level key of a query
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { name: String, constraint: Constraint },
    Or(Vec<Query>),
    And(Vec<Query>),
    Nor(Vec<Query>),
}

/// The constraint attached to a field
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// `null` literal
    IsNull,
    /// String, number or boolean literal
    Equals(Value),
    /// Array literal (containment on array columns)
    Array(Vec<Value>),
    /// Tagged `{__type: ...}` literal
    Tagged(TaggedValue),
    /// Operator map, in key order; empty when no operator was recognized
    Operators(Vec<Operator>),
}

/// Type-tagged literal values
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    Pointer { object_id: String, value: Value },
    Date(String),
    GeoPoint { longitude: f64, latitude: f64 },
    Polygon(Value),
    File(String),
}

/// Ordering comparators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
        }
    }

    pub(crate) fn from_key(key: &str) -> Option<Self> {
        match key {
            "$gt" => Some(Comparator::Gt),
            "$gte" => Some(Comparator::Gte),
            "$lt" => Some(Comparator::Lt),
            "$lte" => Some(Comparator::Lte),
            _ => None,
        }
    }
}

/// `$text.$search` operand
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub term: String,
    pub language: String,
}

/// A single recognized operator
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Compare(Comparator, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    ContainedBy(Vec<Value>),
    Text(TextSearch),
    /// Point as `(longitude, latitude)`; distance in radians
    NearSphere {
        point: (f64, f64),
        max_distance: Option<f64>,
    },
    /// Bottom-left and top-right corners as `(longitude, latitude)`
    WithinBox((f64, f64), (f64, f64)),
    CenterSphere {
        point: (f64, f64),
        distance: f64,
    },
    /// Vertices as `(longitude, latitude)`
    GeoWithinPolygon(Vec<(f64, f64)>),
    GeoIntersects((f64, f64)),
    Regex {
        pattern: String,
        options: String,
    },
}

impl Query {
    /// Parse a JSON query object
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::default()),
            other => Err(StorageError::invalid_json(format!(
                "query should be an object, got {}",
                other
            ))),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let clauses = map
            .iter()
            .map(|(key, value)| match key.as_str() {
                "$or" => Ok(Clause::Or(parse_subqueries(key, value)?)),
                "$and" => Ok(Clause::And(parse_subqueries(key, value)?)),
                "$nor" => Ok(Clause::Nor(parse_subqueries(key, value)?)),
                _ => Ok(Clause::Field {
                    name: key.clone(),
                    constraint: Constraint::parse(value)?,
                }),
            })
            .collect::<Result<_>>()?;
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Top-level fields pinned to a single literal value, as an object
    pub fn equality_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        for clause in &self.clauses {
            let Clause::Field { name, constraint } = clause else {
                continue;
            };
            let value = match constraint {
                Constraint::Equals(value) => value.clone(),
                Constraint::Tagged(TaggedValue::Pointer { value, .. }) => value.clone(),
                Constraint::Tagged(TaggedValue::Date(iso)) => {
                    serde_json::json!({ "__type": "Date", "iso": iso })
                }
                Constraint::Tagged(TaggedValue::File(name)) => {
                    serde_json::json!({ "__type": "File", "name": name })
                }
                _ => continue,
            };
            fields.insert(name.clone(), value);
        }
        fields
    }
}

impl TryFrom<&Value> for Query {
    type Error = StorageError;

    fn try_from(value: &Value) -> Result<Self> {
        Query::parse(value)
    }
}

fn parse_subqueries(key: &str, value: &Value) -> Result<Vec<Query>> {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().map(Query::parse).collect(),
        _ => Err(StorageError::invalid_query(format!(
            "Bad {} format - use an array of at least 1 value.",
            key
        ))),
    }
}

impl Constraint {
    pub fn parse(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Constraint::IsNull,
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Constraint::Equals(value.clone())
            }
            Value::Array(items) => Constraint::Array(items.clone()),
            Value::Object(map) => match type_tag(value) {
                Some(_) => Constraint::Tagged(TaggedValue::parse(value)?),
                None => Constraint::Operators(parse_operators(map)?),
            },
        })
    }

    /// Whether the constraint is exactly an `$exists: false` check
    pub fn is_exists_false(&self) -> bool {
        matches!(self, Constraint::Operators(ops) if ops.contains(&Operator::Exists(false)))
    }
}

impl TaggedValue {
    fn parse(value: &Value) -> Result<Self> {
        let member = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StorageError::invalid_json(format!("bad {} in {}", key, value)))
        };
        Ok(match type_tag(value) {
            Some("Pointer") => TaggedValue::Pointer {
                object_id: member("objectId")?,
                value: value.clone(),
            },
            Some("Date") => TaggedValue::Date(member("iso")?),
            Some("File") => TaggedValue::File(member("name")?),
            Some("GeoPoint") => {
                let (longitude, latitude) = geo_point(value)?;
                TaggedValue::GeoPoint {
                    longitude,
                    latitude,
                }
            }
            Some("Polygon") => TaggedValue::Polygon(
                value
                    .get("coordinates")
                    .cloned()
                    .ok_or_else(|| StorageError::invalid_json("Polygon without coordinates"))?,
            ),
            other => {
                return Err(StorageError::invalid_json(format!(
                    "cannot query on {} values",
                    other.unwrap_or_default()
                )));
            }
        })
    }
}

fn array_operand(key: &str, value: &Value) -> Result<Vec<Value>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| StorageError::invalid_json(format!("bad {} value", key)))
}

fn parse_operators(map: &Map<String, Value>) -> Result<Vec<Operator>> {
    let mut operators = Vec::new();
    for (key, value) in map {
        if let Some(comparator) = Comparator::from_key(key) {
            if !value.is_null() {
                operators.push(Operator::Compare(comparator, value.clone()));
            }
            continue;
        }
        let operator = match key.as_str() {
            "$eq" => Operator::Eq(value.clone()),
            "$ne" => Operator::Ne(value.clone()),
            "$in" => Operator::In(flatten_one_level(array_operand(key, value)?)),
            "$nin" => Operator::Nin(flatten_one_level(array_operand(key, value)?)),
            "$all" => Operator::All(array_operand(key, value)?),
            "$exists" => match value {
                Value::Bool(b) => Operator::Exists(*b),
                Value::Object(obj) if obj.contains_key("$relativeTime") => {
                    return Err(relative_time_misuse());
                }
                _ => return Err(StorageError::invalid_json("bad $exists value")),
            },
            "$containedBy" => Operator::ContainedBy(value.as_array().cloned().ok_or_else(
                || StorageError::invalid_json("bad $containedBy: should be an array"),
            )?),
            "$text" => Operator::Text(parse_text(value)?),
            "$nearSphere" => Operator::NearSphere {
                point: geo_point(value)?,
                max_distance: map.get("$maxDistance").and_then(Value::as_f64),
            },
            "$within" => match value.get("$box") {
                Some(Value::Array(corners)) if corners.len() == 2 => {
                    Operator::WithinBox(geo_point(&corners[0])?, geo_point(&corners[1])?)
                }
                Some(_) => {
                    return Err(StorageError::invalid_json(
                        "bad $within value; $box should contain two GeoPoints",
                    ));
                }
                None => continue,
            },
            "$geoWithin" => parse_geo_within(value)?,
            "$geoIntersects" => match value.get("$point") {
                Some(point) if type_tag(point) == Some("GeoPoint") => {
                    Operator::GeoIntersects(geo_point(point)?)
                }
                Some(_) => {
                    return Err(StorageError::invalid_json(
                        "bad $geoIntersect value; $point should be GeoPoint",
                    ));
                }
                None => continue,
            },
            "$regex" => match value {
                Value::String(pattern) if !pattern.is_empty() => Operator::Regex {
                    pattern: pattern.clone(),
                    options: map
                        .get("$options")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                Value::String(_) => continue,
                _ => return Err(StorageError::invalid_json("bad $regex value")),
            },
            _ => continue,
        };
        operators.push(operator);
    }
    Ok(operators)
}

fn flatten_one_level(items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .flat_map(|item| match item {
            Value::Array(inner) => inner,
            other => vec![other],
        })
        .collect()
}

fn parse_text(value: &Value) -> Result<TextSearch> {
    let search = value
        .get("$search")
        .and_then(Value::as_object)
        .ok_or_else(|| StorageError::invalid_json("bad $text: $search, should be object"))?;
    let term = search
        .get("$term")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StorageError::invalid_json("bad $text: $term, should be string"))?;
    let language = match search.get("$language") {
        None => "english".to_string(),
        Some(Value::String(language)) => language.clone(),
        Some(_) => {
            return Err(StorageError::invalid_json(
                "bad $text: $language, should be string",
            ));
        }
    };
    match search.get("$caseSensitive") {
        None | Some(Value::Bool(false)) => {}
        Some(Value::Bool(true)) => {
            return Err(StorageError::invalid_json(
                "bad $text: $caseSensitive not supported, please use $regex or create a separate lower case column.",
            ));
        }
        Some(_) => {
            return Err(StorageError::invalid_json(
                "bad $text: $caseSensitive, should be boolean",
            ));
        }
    }
    match search.get("$diacriticSensitive") {
        None | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            return Err(StorageError::invalid_json(
                "bad $text: $diacriticSensitive - false not supported, install Postgres Unaccent Extension",
            ));
        }
        Some(_) => {
            return Err(StorageError::invalid_json(
                "bad $text: $diacriticSensitive, should be boolean",
            ));
        }
    }
    Ok(TextSearch {
        term: term.to_string(),
        language,
    })
}

fn parse_geo_within(value: &Value) -> Result<Operator> {
    if let Some(center_sphere) = value.get("$centerSphere") {
        let bad = |what: &str| {
            StorageError::invalid_json(format!("bad $geoWithin value; $centerSphere {}", what))
        };
        let parts = center_sphere
            .as_array()
            .filter(|parts| parts.len() >= 2)
            .ok_or_else(|| bad("should be an array of GeoPoint and distance"))?;
        let point = match &parts[0] {
            Value::Array(pair) if pair.len() == 2 => {
                let longitude = pair[0].as_f64().ok_or_else(|| bad("geo point invalid"))?;
                let latitude = pair[1].as_f64().ok_or_else(|| bad("geo point invalid"))?;
                validate_geo_point(latitude, longitude)?;
                (longitude, latitude)
            }
            point if type_tag(point) == Some("GeoPoint") => geo_point(point)?,
            _ => return Err(bad("geo point invalid")),
        };
        let distance = parts[1]
            .as_f64()
            .filter(|d| *d >= 0.0)
            .ok_or_else(|| bad("distance invalid"))?;
        return Ok(Operator::CenterSphere { point, distance });
    }

    let Some(polygon) = value.get("$polygon") else {
        return Err(StorageError::invalid_json(
            "bad $geoWithin value; expected $centerSphere or $polygon",
        ));
    };
    let points = match polygon {
        Value::Object(obj) if type_tag(polygon) == Some("Polygon") => {
            let coordinates = obj
                .get("coordinates")
                .and_then(Value::as_array)
                .filter(|c| c.len() >= 3)
                .ok_or_else(|| {
                    StorageError::invalid_json(
                        "bad $geoWithin value; Polygon.coordinates should contain at least 3 lon/lat pairs",
                    )
                })?;
            // Polygon objects carry [latitude, longitude] pairs
            coordinates
                .iter()
                .map(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([lat, lng]) => match (lat.as_f64(), lng.as_f64()) {
                        (Some(lat), Some(lng)) => {
                            validate_geo_point(lat, lng)?;
                            Ok((lng, lat))
                        }
                        _ => Err(StorageError::invalid_json("bad $geoWithin value")),
                    },
                    _ => Err(StorageError::invalid_json("bad $geoWithin value")),
                })
                .collect::<Result<Vec<_>>>()?
        }
        Value::Array(items) => {
            if items.len() < 3 {
                return Err(StorageError::invalid_json(
                    "bad $geoWithin value; $polygon should contain at least 3 GeoPoints",
                ));
            }
            // Raw arrays follow GeoJSON [longitude, latitude] order
            items
                .iter()
                .map(|item| match item {
                    Value::Array(pair) if pair.len() == 2 => {
                        match (pair[0].as_f64(), pair[1].as_f64()) {
                            (Some(lng), Some(lat)) => {
                                validate_geo_point(lat, lng)?;
                                Ok((lng, lat))
                            }
                            _ => Err(StorageError::invalid_json("bad $geoWithin value")),
                        }
                    }
                    point if type_tag(point) == Some("GeoPoint") => geo_point(point),
                    _ => Err(StorageError::invalid_json("bad $geoWithin value")),
                })
                .collect::<Result<Vec<_>>>()?
        }
        _ => {
            return Err(StorageError::invalid_json(
                "bad $geoWithin value; $polygon should be Polygon object or Array of GeoPoints",
            ));
        }
    };
    Ok(Operator::GeoWithinPolygon(points))
}

pub(crate) fn relative_time_misuse() -> StorageError {
    StorageError::invalid_json(
        "$relativeTime can only be used with the $lt, $lte, $gt, and $gte operators",
    )
}

/// `$relativeTime` text of a comparator operand, if present
pub fn relative_time(value: &Value) -> Option<&str> {
    value.get("$relativeTime").and_then(Value::as_str)
}

/// Resolve phrases like `"in 2 days"`, `"3 hours ago"` or `"now"` relative to `now`
pub fn resolve_relative_time(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let text = text.to_lowercase();
    let mut parts: Vec<&str> = text.split_whitespace().collect();
    let future = parts.first() == Some(&"in");
    let past = parts.last() == Some(&"ago");
    let invalid = |info: String| StorageError::invalid_json(format!("bad $relativeTime ({}): {}", text, info));

    if text == "now" {
        return Ok(now);
    }
    if !future && !past {
        return Err(invalid(
            "Time should either start with 'in' or end with 'ago'".to_string(),
        ));
    }
    if future && past {
        return Err(invalid("Time cannot have both 'in' and 'ago'".to_string()));
    }
    if future {
        parts.remove(0);
    } else {
        parts.pop();
    }
    if parts.len() % 2 != 0 {
        return Err(invalid(
            "Invalid time string. Dangling unit or number.".to_string(),
        ));
    }

    let mut seconds: i64 = 0;
    for pair in parts.chunks(2) {
        let amount: i64 = pair[0]
            .parse()
            .map_err(|_| invalid(format!("'{}' is not an integer.", pair[0])))?;
        let unit = match pair[1] {
            "yr" | "yrs" | "year" | "years" => 31_536_000,
            "wk" | "wks" | "week" | "weeks" => 604_800,
            "d" | "day" | "days" => 86_400,
            "hr" | "hrs" | "hour" | "hours" => 3_600,
            "min" | "mins" | "minute" | "minutes" => 60,
            "sec" | "secs" | "second" | "seconds" => 1,
            other => return Err(invalid(format!("Invalid interval: '{}'", other))),
        };
        seconds = amount
            .checked_mul(unit)
            .and_then(|delta| seconds.checked_add(delta))
            .ok_or_else(|| invalid("Time interval is out of range".to_string()))?;
    }

    let offset = Duration::try_seconds(seconds)
        .ok_or_else(|| invalid("Time interval is out of range".to_string()))?;
    let resolved = if future {
        now.checked_add_signed(offset)
    } else {
        now.checked_sub_signed(offset)
    };
    resolved.ok_or_else(|| invalid("Resulting date is out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    // =========================================================================
    // Structure Tests
    // =========================================================================

    #[test]
    fn test_parse_literals() {
        let query = Query::parse(&json!({"a": null, "b": "x", "c": 3, "d": [1, 2]})).unwrap();
        assert_eq!(
            query.clauses,
            vec![
                Clause::Field {
                    name: "a".into(),
                    constraint: Constraint::IsNull
                },
                Clause::Field {
                    name: "b".into(),
                    constraint: Constraint::Equals(json!("x"))
                },
                Clause::Field {
                    name: "c".into(),
                    constraint: Constraint::Equals(json!(3))
                },
                Clause::Field {
                    name: "d".into(),
                    constraint: Constraint::Array(vec![json!(1), json!(2)])
                },
            ]
        );
    }

    #[test]
    fn test_parse_logical() {
        let query = Query::parse(&json!({"$or": [{"a": 1}, {"b": 2}]})).unwrap();
        match &query.clauses[0] {
            Clause::Or(subs) => assert_eq!(subs.len(), 2),
            other => panic!("unexpected clause {:?}", other),
        }
    }

    #[test]
    fn test_empty_logical_is_rejected() {
        let err = Query::parse(&json!({"$and": []})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[test]
    fn test_operator_order_follows_keys() {
        let query = Query::parse(&json!({"n": {"$lt": 5, "$gt": 1}})).unwrap();
        let Clause::Field { constraint, .. } = &query.clauses[0] else {
            panic!("expected field clause");
        };
        assert_eq!(
            constraint,
            &Constraint::Operators(vec![
                Operator::Compare(Comparator::Lt, json!(5)),
                Operator::Compare(Comparator::Gt, json!(1)),
            ])
        );
    }

    #[test]
    fn test_unknown_operators_are_dropped() {
        let constraint = Constraint::parse(&json!({"$foo": 1})).unwrap();
        assert_eq!(constraint, Constraint::Operators(vec![]));
    }

    #[test]
    fn test_tagged_literal() {
        let constraint =
            Constraint::parse(&json!({"__type": "Pointer", "className": "A", "objectId": "x"}))
                .unwrap();
        assert!(matches!(
            constraint,
            Constraint::Tagged(TaggedValue::Pointer { ref object_id, .. }) if object_id == "x"
        ));
    }

    #[test]
    fn test_equality_fields() {
        let query = Query::parse(&json!({
            "name": "a",
            "owner": {"__type": "Pointer", "className": "_User", "objectId": "u"},
            "n": {"$gt": 1},
            "$or": [{"x": 1}]
        }))
        .unwrap();
        assert_eq!(
            Value::Object(query.equality_fields()),
            json!({
                "name": "a",
                "owner": {"__type": "Pointer", "className": "_User", "objectId": "u"}
            })
        );
    }

    // =========================================================================
    // Operand Validation Tests
    // =========================================================================

    #[test]
    fn test_bad_in_value() {
        let err = Constraint::parse(&json!({"$in": "x"})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[test]
    fn test_in_is_flattened_one_level() {
        let constraint = Constraint::parse(&json!({"$in": [["a", "b"], "c"]})).unwrap();
        assert_eq!(
            constraint,
            Constraint::Operators(vec![Operator::In(vec![
                json!("a"),
                json!("b"),
                json!("c")
            ])])
        );
    }

    #[test]
    fn test_contained_by_requires_array() {
        let err = Constraint::parse(&json!({"$containedBy": {"a": 1}})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[test]
    fn test_text_validation() {
        assert!(Constraint::parse(&json!({"$text": {"$search": "x"}})).is_err());
        assert!(Constraint::parse(&json!({"$text": {"$search": {"$term": 1}}})).is_err());
        assert!(
            Constraint::parse(&json!({"$text": {"$search": {"$term": "a", "$caseSensitive": true}}}))
                .is_err()
        );
        assert!(
            Constraint::parse(
                &json!({"$text": {"$search": {"$term": "a", "$diacriticSensitive": false}}})
            )
            .is_err()
        );
        let ok = Constraint::parse(&json!({"$text": {"$search": {"$term": "coffee"}}})).unwrap();
        assert_eq!(
            ok,
            Constraint::Operators(vec![Operator::Text(TextSearch {
                term: "coffee".into(),
                language: "english".into()
            })])
        );
    }

    #[test]
    fn test_near_sphere_with_distance() {
        let constraint = Constraint::parse(&json!({
            "$nearSphere": {"__type": "GeoPoint", "latitude": 1.0, "longitude": 2.0},
            "$maxDistance": 0.5
        }))
        .unwrap();
        assert_eq!(
            constraint,
            Constraint::Operators(vec![Operator::NearSphere {
                point: (2.0, 1.0),
                max_distance: Some(0.5)
            }])
        );
    }

    #[test]
    fn test_center_sphere_array_point() {
        let constraint =
            Constraint::parse(&json!({"$geoWithin": {"$centerSphere": [[-10.0, 20.0], 0.1]}}))
                .unwrap();
        assert_eq!(
            constraint,
            Constraint::Operators(vec![Operator::CenterSphere {
                point: (-10.0, 20.0),
                distance: 0.1
            }])
        );
        assert!(
            Constraint::parse(&json!({"$geoWithin": {"$centerSphere": [[0, 0], -1]}})).is_err()
        );
    }

    #[test]
    fn test_geo_within_polygon_needs_three_points() {
        let err = Constraint::parse(&json!({"$geoWithin": {"$polygon": [[0, 0], [1, 1]]}}))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[test]
    fn test_exists_relative_time_rejected() {
        let err = Constraint::parse(&json!({"$exists": {"$relativeTime": "now"}})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }

    #[test]
    fn test_regex_options() {
        let constraint = Constraint::parse(&json!({"$regex": "^a", "$options": "i"})).unwrap();
        assert_eq!(
            constraint,
            Constraint::Operators(vec![Operator::Regex {
                pattern: "^a".into(),
                options: "i".into()
            }])
        );
    }

    #[test]
    fn test_is_exists_false() {
        assert!(Constraint::parse(&json!({"$exists": false})).unwrap().is_exists_false());
        assert!(!Constraint::parse(&json!({"$exists": true})).unwrap().is_exists_false());
    }

    // =========================================================================
    // Relative Time Tests
    // =========================================================================

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_relative_time_future() {
        let resolved = resolve_relative_time("in 2 days 3 hours", now()).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2020, 1, 12, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_relative_time_past() {
        let resolved = resolve_relative_time("1 week ago", now()).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2020, 1, 3, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_relative_time_now() {
        assert_eq!(resolve_relative_time("now", now()).unwrap(), now());
    }

    #[test]
    fn test_relative_time_errors() {
        assert!(resolve_relative_time("2 days", now()).is_err());
        assert!(resolve_relative_time("in 2 days ago", now()).is_err());
        assert!(resolve_relative_time("in 2", now()).is_err());
        assert!(resolve_relative_time("in two days", now()).is_err());
        assert!(resolve_relative_time("in 2 months", now()).is_err());
    }

    #[test]
    fn test_relative_time_out_of_range() {
        let err = resolve_relative_time("in 999999999999 years", now()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));

        let err = resolve_relative_time("in 100000000 years", now()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));

        let err = resolve_relative_time("100000000 years ago", now()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidJson(_)));
    }
}
