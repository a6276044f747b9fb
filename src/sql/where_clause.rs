//! Where-clause compiler
//!
//! Compiles a parsed [`Query`] into a parameterized SQL predicate. Every value
//! is bound; identifiers are quoted inline. Placeholders are numbered left to
//! right in query key order starting at the caller's index, and sub-queries of
//! `$or`/`$and`/`$nor` hand their consumed parameters back as a
//! [`CompileResult`] so numbering stays contiguous.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Result, StorageError};
use crate::query::{
    Clause, Constraint, Operator, Query, TaggedValue, TextSearch, relative_time,
    relative_time_misuse, resolve_relative_time,
};
use crate::sql::Binder;
use crate::sql::regex::{
    is_all_values_regex_or_none, is_any_value_regex_starts_with, process_regex_pattern,
    remove_whitespace,
};
use crate::sql::sanitize::{
    auth_data_provider, quote_identifier, transform_dot_field, transform_dot_field_to_jsonb,
};
use crate::transform::{
    SqlValue, geo_point, parse_timestamp, polygon_to_sql, scalar_text, to_column_value, type_tag,
};
use crate::types::{ClassSchema, FieldType};

/// Mean earth radius in meters
pub const EARTH_RADIUS_METERS: f64 = 6371.0 * 1000.0;

/// Bound in place of a boolean compared against a Number column; no double
/// precision value equals it, so the predicate matches nothing.
const NEVER_MATCHING_NUMBER: f64 = 9_223_372_036_854_775_808.0;

/// Compiled predicate
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WhereClause {
    /// Predicate without the `WHERE` keyword; empty when the query is empty
    pub pattern: String,
    /// Bind parameters, in placeholder order
    pub values: Vec<SqlValue>,
    /// Implicit `ORDER BY` terms from proximity operators
    pub sorts: Vec<String>,
    /// Text search rank expression, when the query carries `$text`
    pub score: Option<String>,
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// ` WHERE <pattern>`, or nothing for an empty predicate
    pub fn to_sql(&self) -> String {
        if self.pattern.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.pattern)
        }
    }

    /// Index of the first placeholder after this clause's parameters
    pub fn next_index(&self, start_index: usize) -> usize {
        start_index + self.values.len()
    }
}

/// Result of compiling one (sub-)query from a given parameter index
#[derive(Debug, Clone, PartialEq)]
pub struct CompileResult {
    pub fragment: String,
    pub next_index: usize,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Default)]
struct Extras {
    sorts: Vec<String>,
    score: Option<String>,
}

/// Compile `query` against `schema`, numbering placeholders from `start_index`.
///
/// `schema` should be the storage schema so permission and auth columns are
/// typed. With `case_insensitive`, string equality on `username` and `email`
/// compares lower-cased values.
pub fn build_where_clause(
    schema: &ClassSchema,
    query: &Query,
    start_index: usize,
    case_insensitive: bool,
) -> Result<WhereClause> {
    let compiler = Compiler {
        schema,
        case_insensitive,
        now: Utc::now(),
    };
    let mut binder = Binder::new(start_index);
    let mut extras = Extras::default();
    let pattern = compiler.compile(query, &mut binder, &mut extras)?;
    Ok(WhereClause {
        pattern,
        values: binder.params,
        sorts: extras.sorts,
        score: extras.score,
    })
}

/// Compile a sub-query; its implicit sorts and score are discarded
pub fn compile_query(
    schema: &ClassSchema,
    query: &Query,
    index: usize,
    case_insensitive: bool,
) -> Result<CompileResult> {
    Compiler {
        schema,
        case_insensitive,
        now: Utc::now(),
    }
    .compile_sub(query, index)
}

struct Compiler<'a> {
    schema: &'a ClassSchema,
    case_insensitive: bool,
    now: DateTime<Utc>,
}

impl Compiler<'_> {
    fn compile(&self, query: &Query, b: &mut Binder, extras: &mut Extras) -> Result<String> {
        let mut patterns = Vec::new();
        for clause in &query.clauses {
            match clause {
                Clause::Field { name, constraint } => {
                    if let Some(fragments) = self.field(name, constraint, b, extras)? {
                        patterns.extend(fragments);
                    }
                }
                Clause::Or(subs) => patterns.push(self.logical(subs, " OR ", b)?),
                Clause::And(subs) => patterns.push(self.logical(subs, " AND ", b)?),
                Clause::Nor(subs) => patterns.push(format!("NOT {}", self.logical(subs, " OR ", b)?)),
            }
        }
        Ok(patterns.join(" AND "))
    }

    fn compile_sub(&self, query: &Query, index: usize) -> Result<CompileResult> {
        let mut binder = Binder::new(index);
        let fragment = self.compile(query, &mut binder, &mut Extras::default())?;
        Ok(CompileResult {
            fragment,
            next_index: binder.next,
            params: binder.params,
        })
    }

    fn logical(&self, subs: &[Query], joiner: &str, b: &mut Binder) -> Result<String> {
        let mut clauses = Vec::new();
        for sub in subs {
            let result = self.compile_sub(sub, b.next)?;
            if !result.fragment.is_empty() {
                clauses.push(format!("({})", result.fragment));
            }
            b.absorb(result);
        }
        if clauses.is_empty() {
            return Ok("(TRUE)".to_string());
        }
        Ok(format!("({})", clauses.join(joiner)))
    }

    fn field(
        &self,
        name: &str,
        constraint: &Constraint,
        b: &mut Binder,
        extras: &mut Extras,
    ) -> Result<Option<Vec<String>>> {
        let field_type = self.schema.field_type(name);
        if field_type.is_none() && constraint.is_exists_false() {
            return Ok(None);
        }
        if auth_data_provider(name).is_some() {
            return Ok(None);
        }

        let col = quote_identifier(name);
        let mut patterns = Vec::new();
        if self.case_insensitive && (name == "username" || name == "email") {
            if let Constraint::Equals(Value::String(s)) = constraint {
                let p = b.bind(SqlValue::text(s.as_str()));
                return Ok(Some(vec![format!("LOWER({}) = LOWER({})", col, p)]));
            }
        }

        if name.contains('.') {
            self.dot_field(name, constraint, b, &mut patterns)?;
        } else {
            match constraint {
                Constraint::Operators(ops) => {
                    for op in ops {
                        self.operator(&col, field_type, op, b, extras, &mut patterns)?;
                    }
                }
                literal => patterns.push(self.literal(&col, field_type, literal, b)?),
            }
        }

        if patterns.is_empty() {
            return Err(StorageError::operation_forbidden(format!(
                "Postgres doesn't support this query type yet on field {}",
                name
            )));
        }
        Ok(Some(patterns))
    }

    // ------------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------------

    fn literal(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        constraint: &Constraint,
        b: &mut Binder,
    ) -> Result<String> {
        match constraint {
            Constraint::IsNull => Ok(format!("{} IS NULL", col)),
            Constraint::Equals(value) => self.equals(col, field_type, value, b),
            Constraint::Array(items) => Ok(match field_type {
                Some(ft) if ft.is_array() => format!(
                    "array_contains_all({}, {}::jsonb)",
                    json_expr(col, ft),
                    b.bind(SqlValue::Json(Value::Array(items.clone())))
                ),
                _ => format!(
                    "{} = {}::jsonb",
                    col,
                    b.bind(SqlValue::Json(Value::Array(items.clone())))
                ),
            }),
            Constraint::Tagged(tagged) => self.tagged(col, field_type, tagged, b),
            Constraint::Operators(_) => Err(StorageError::internal(
                "operator map compiled as a literal",
            )),
        }
    }

    fn equals(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        value: &Value,
        b: &mut Binder,
    ) -> Result<String> {
        if let Some(ft) = field_type.filter(|ft| ft.is_array()) {
            let p = b.bind(SqlValue::Json(Value::Array(vec![value.clone()])));
            return Ok(format!("array_contains({}, {}::jsonb)", json_expr(col, ft), p));
        }
        let param = match (field_type, value) {
            (Some(FieldType::Number), Value::Bool(_)) => SqlValue::Float(NEVER_MATCHING_NUMBER),
            _ => to_column_value(field_type, value)?,
        };
        Ok(format!("{} = {}", col, b.bind(param)))
    }

    fn tagged(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        tagged: &TaggedValue,
        b: &mut Binder,
    ) -> Result<String> {
        Ok(match tagged {
            TaggedValue::Pointer { object_id, value } => match field_type {
                Some(ft) if ft.is_array() => format!(
                    "array_contains({}, {}::jsonb)",
                    json_expr(col, ft),
                    b.bind(SqlValue::Json(Value::Array(vec![value.clone()])))
                ),
                _ => format!("{} = {}", col, b.bind(SqlValue::text(object_id.as_str()))),
            },
            TaggedValue::Date(iso) => {
                format!("{} = {}", col, b.bind(SqlValue::Timestamp(parse_timestamp(iso)?)))
            }
            TaggedValue::File(name) => format!("{} = {}", col, b.bind(SqlValue::text(name.as_str()))),
            TaggedValue::GeoPoint {
                longitude,
                latitude,
            } => {
                let lng = b.bind(SqlValue::Float(*longitude));
                let lat = b.bind(SqlValue::Float(*latitude));
                format!("{} ~= POINT({}, {})", col, lng, lat)
            }
            TaggedValue::Polygon(coordinates) => format!(
                "{} ~= {}::polygon",
                col,
                b.bind(SqlValue::Text(polygon_to_sql(coordinates)?))
            ),
        })
    }

    // ------------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------------

    fn operator(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        op: &Operator,
        b: &mut Binder,
        extras: &mut Extras,
        patterns: &mut Vec<String>,
    ) -> Result<()> {
        let is_array = field_type.is_some_and(FieldType::is_array);
        match op {
            Operator::Eq(value) => patterns.push(self.eq(col, field_type, value, b)?),
            Operator::Ne(value) => patterns.push(self.ne(col, field_type, value, b)?),
            Operator::Compare(cmp, value) => {
                let param = self.comparison_value(field_type, value)?;
                patterns.push(format!("{} {} {}", col, cmp.as_sql(), b.bind(param)));
            }
            Operator::In(list) => patterns.push(self.membership(col, field_type, list, false, b)?),
            Operator::Nin(list) => patterns.push(self.membership(col, field_type, list, true, b)?),
            Operator::All(list) => {
                if let Some(fragment) = self.all(col, field_type, list, b)? {
                    patterns.push(fragment);
                }
            }
            Operator::Exists(exists) => patterns.push(null_check(col, !exists)),
            Operator::ContainedBy(list) => {
                let expr = match field_type {
                    Some(ft) if is_array => json_expr(col, ft),
                    _ => col.to_string(),
                };
                let p = b.bind(SqlValue::Json(Value::Array(list.clone())));
                patterns.push(format!("{} <@ {}::jsonb", expr, p));
            }
            Operator::Text(search) => patterns.push(self.text(col, search, b, extras)),
            Operator::NearSphere {
                point,
                max_distance,
            } => {
                let distance = great_circle_distance(col, *point, b);
                extras.sorts.push(format!("{} ASC", distance));
                patterns.push(match max_distance {
                    Some(radians) => format!(
                        "{} <= {}",
                        distance,
                        b.bind(SqlValue::Float(radians * EARTH_RADIUS_METERS))
                    ),
                    None => format!("{} IS NOT NULL", col),
                });
            }
            Operator::WithinBox((left, bottom), (right, top)) => {
                let bbox = format!("(({}, {}), ({}, {}))", left, bottom, right, top);
                patterns.push(format!("{} <@ {}::box", col, b.bind(SqlValue::Text(bbox))));
            }
            Operator::CenterSphere { point, distance } => {
                let expr = great_circle_distance(col, *point, b);
                let max = b.bind(SqlValue::Float(distance * EARTH_RADIUS_METERS));
                patterns.push(format!("{} <= {}", expr, max));
            }
            Operator::GeoWithinPolygon(points) => {
                let polygon = points
                    .iter()
                    .map(|(lng, lat)| format!("({}, {})", lng, lat))
                    .collect::<Vec<_>>()
                    .join(", ");
                let p = b.bind(SqlValue::Text(format!("({})", polygon)));
                patterns.push(format!("{} <@ {}::polygon", col, p));
            }
            Operator::GeoIntersects((lng, lat)) => {
                let p = b.bind(SqlValue::Text(format!("({}, {})", lng, lat)));
                patterns.push(format!("{} @> {}::point", col, p));
            }
            Operator::Regex { pattern, options } => {
                patterns.push(regex_match(col, pattern, options, b));
            }
        }
        Ok(())
    }

    fn eq(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        value: &Value,
        b: &mut Binder,
    ) -> Result<String> {
        if relative_time(value).is_some() {
            return Err(relative_time_misuse());
        }
        match Constraint::parse(value)? {
            Constraint::Operators(_) => Ok(format!(
                "{} = {}::jsonb",
                col,
                b.bind(SqlValue::Json(value.clone()))
            )),
            literal => self.literal(col, field_type, &literal, b),
        }
    }

    fn ne(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        value: &Value,
        b: &mut Binder,
    ) -> Result<String> {
        if value.is_null() {
            return Ok(format!("{} IS NOT NULL", col));
        }
        if relative_time(value).is_some() {
            return Err(relative_time_misuse());
        }
        if let Some(ft) = field_type.filter(|ft| ft.is_array()) {
            let p = b.bind(SqlValue::Json(Value::Array(vec![value.clone()])));
            return Ok(format!(
                "(NOT array_contains({}, {}::jsonb) OR {} IS NULL)",
                json_expr(col, ft),
                p,
                col
            ));
        }
        if type_tag(value) == Some("GeoPoint") {
            let (lng, lat) = geo_point(value)?;
            let lng = b.bind(SqlValue::Float(lng));
            let lat = b.bind(SqlValue::Float(lat));
            return Ok(format!(
                "(NOT ({} ~= POINT({}, {})) OR {} IS NULL)",
                col, lng, lat, col
            ));
        }
        let p = b.bind(to_column_value(field_type, value)?);
        Ok(format!("({} <> {} OR {} IS NULL)", col, p, col))
    }

    fn comparison_value(&self, field_type: Option<&FieldType>, value: &Value) -> Result<SqlValue> {
        match relative_time(value) {
            Some(text) => {
                if field_type != Some(&FieldType::Date) {
                    return Err(StorageError::invalid_json(
                        "$relativeTime can only be used with Date field",
                    ));
                }
                Ok(SqlValue::Timestamp(resolve_relative_time(text, self.now)?))
            }
            None => to_column_value(field_type, value),
        }
    }

    fn membership(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        list: &[Value],
        negated: bool,
        b: &mut Binder,
    ) -> Result<String> {
        let has_null = list.iter().any(Value::is_null);
        let values: Vec<&Value> = list.iter().filter(|v| !v.is_null()).collect();
        if values.is_empty() {
            return Ok(match (negated, has_null) {
                (false, false) => "FALSE".to_string(),
                (true, false) => "TRUE".to_string(),
                (negated, true) => null_check(col, !negated),
            });
        }

        let (matches, excludes) = match field_type {
            Some(ft) if ft.is_string_array() => {
                let texts = values.iter().map(|v| scalar_text(v)).collect();
                let p = b.bind(SqlValue::TextArray(texts));
                (
                    format!("{} && {}::text[]", col, p),
                    format!("NOT ({} && {}::text[])", col, p),
                )
            }
            Some(ft) if ft.is_array() => {
                let p = b.bind(SqlValue::Json(Value::Array(
                    values.iter().map(|v| (*v).clone()).collect(),
                )));
                (
                    format!("array_contains({}, {}::jsonb)", col, p),
                    format!("NOT array_contains({}, {}::jsonb)", col, p),
                )
            }
            _ => {
                let placeholders = values
                    .iter()
                    .map(|v| Ok(b.bind(to_column_value(field_type, v)?)))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                (
                    format!("{} IN ({})", col, placeholders),
                    format!("{} NOT IN ({})", col, placeholders),
                )
            }
        };

        Ok(match (negated, has_null) {
            (false, false) => matches,
            (false, true) => format!("({} IS NULL OR {})", col, matches),
            (true, false) => format!("({} OR {} IS NULL)", excludes, col),
            (true, true) => format!("({} IS NOT NULL AND {})", col, excludes),
        })
    }

    fn all(
        &self,
        col: &str,
        field_type: Option<&FieldType>,
        list: &[Value],
        b: &mut Binder,
    ) -> Result<Option<String>> {
        let Some(ft) = field_type.filter(|ft| ft.is_array()) else {
            // A single element on a scalar column is plain equality
            return match list {
                [only] => match Constraint::parse(only)? {
                    Constraint::Operators(_) => Ok(None),
                    literal => Ok(Some(self.literal(col, field_type, &literal, b)?)),
                },
                _ => Ok(None),
            };
        };
        let expr = json_expr(col, ft);
        if is_any_value_regex_starts_with(list) {
            if !is_all_values_regex_or_none(list) {
                return Err(StorageError::invalid_json(format!(
                    "All $all values must be of regex type or none: {}",
                    Value::Array(list.to_vec())
                )));
            }
            let prefixes = list
                .iter()
                .map(|v| {
                    let pattern = v.get("$regex").and_then(Value::as_str).unwrap_or_default();
                    let processed = process_regex_pattern(pattern);
                    Value::String(format!("{}%", processed.get(1..).unwrap_or_default()))
                })
                .collect();
            let p = b.bind(SqlValue::Json(Value::Array(prefixes)));
            return Ok(Some(format!("array_contains_all_regex({}, {}::jsonb)", expr, p)));
        }
        let p = b.bind(SqlValue::Json(Value::Array(list.to_vec())));
        Ok(Some(format!("array_contains_all({}, {}::jsonb)", expr, p)))
    }

    fn text(&self, col: &str, search: &TextSearch, b: &mut Binder, extras: &mut Extras) -> String {
        let vector_language = b.bind(SqlValue::text(search.language.as_str()));
        let query_language = b.bind(SqlValue::text(search.language.as_str()));
        let term = b.bind(SqlValue::text(search.term.as_str()));
        let vector = format!("to_tsvector({}::regconfig, {})", vector_language, col);
        let query = format!("to_tsquery({}::regconfig, {})", query_language, term);
        extras.score = Some(format!("ts_rank_cd({}, {}, 32)", vector, query));
        format!("{} @@ {}", vector, query)
    }

    // ------------------------------------------------------------------------
    // Dot notation
    // ------------------------------------------------------------------------

    /// Nested JSON fields support null and scalar equality, `$in` containment,
    /// `$eq`/`$ne`/comparators through a cast, `$exists` and `$regex`.
    fn dot_field(
        &self,
        name: &str,
        constraint: &Constraint,
        b: &mut Binder,
        patterns: &mut Vec<String>,
    ) -> Result<()> {
        let expr = transform_dot_field(name);
        match constraint {
            Constraint::IsNull => patterns.push(format!("{} IS NULL", expr)),
            Constraint::Equals(value) => {
                let p = b.bind(SqlValue::Text(scalar_text(value)));
                patterns.push(format!("{} = {}::text", expr, p));
            }
            Constraint::Operators(ops) => {
                for op in ops {
                    match op {
                        Operator::In(list) => {
                            let p = b.bind(SqlValue::Json(Value::Array(list.clone())));
                            patterns.push(format!(
                                "({})::jsonb @> {}::jsonb",
                                transform_dot_field_to_jsonb(name),
                                p
                            ));
                        }
                        Operator::Eq(Value::Null) => patterns.push(format!("{} IS NULL", expr)),
                        Operator::Eq(value) => {
                            let (cast, param) = dot_cast(&expr, value)?;
                            patterns.push(format!("{} = {}", cast, b.bind(param)));
                        }
                        Operator::Ne(Value::Null) => patterns.push(format!("{} IS NOT NULL", expr)),
                        Operator::Ne(value) => {
                            let (cast, param) = dot_cast(&expr, value)?;
                            let p = b.bind(param);
                            patterns.push(format!("({} <> {} OR {} IS NULL)", cast, p, cast));
                        }
                        Operator::Compare(cmp, value) => {
                            let (cast, param) = dot_cast(&expr, value)?;
                            patterns.push(format!("{} {} {}", cast, cmp.as_sql(), b.bind(param)));
                        }
                        Operator::Exists(exists) => patterns.push(null_check(&expr, !exists)),
                        Operator::Regex { pattern, options } => {
                            patterns.push(regex_match(&expr, pattern, options, b));
                        }
                        // $nin and the remaining operators have no nested form
                        _ => {}
                    }
                }
            }
            Constraint::Array(_) | Constraint::Tagged(_) => {}
        }
        Ok(())
    }
}

/// Column as jsonb: native `text[]` columns are converted
fn json_expr(col: &str, field_type: &FieldType) -> String {
    if field_type.is_string_array() {
        format!("to_jsonb({})", col)
    } else {
        col.to_string()
    }
}

fn null_check(expr: &str, is_null: bool) -> String {
    if is_null {
        format!("{} IS NULL", expr)
    } else {
        format!("{} IS NOT NULL", expr)
    }
}

fn great_circle_distance(col: &str, (lng, lat): (f64, f64), b: &mut Binder) -> String {
    let lng = b.bind(SqlValue::Float(lng));
    let lat = b.bind(SqlValue::Float(lat));
    format!("great_circle_distance({}, POINT({}, {}))", col, lng, lat)
}

fn regex_match(expr: &str, pattern: &str, options: &str, b: &mut Binder) -> String {
    let operator = if options.contains('i') { "~*" } else { "~" };
    let pattern = if options.contains('x') {
        remove_whitespace(pattern)
    } else {
        pattern.to_string()
    };
    let p = b.bind(SqlValue::Text(process_regex_pattern(&pattern)));
    format!("{} {} {}", expr, operator, p)
}

/// Cast applied to a `->>` extraction so it compares like `value`
fn dot_cast(expr: &str, value: &Value) -> Result<(String, SqlValue)> {
    if relative_time(value).is_some() {
        return Err(StorageError::invalid_json(
            "$relativeTime can only be used with Date field",
        ));
    }
    Ok(match value {
        Value::Number(n) => (
            format!("CAST (({}) AS double precision)", expr),
            SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        ),
        Value::Bool(v) => (format!("CAST (({}) AS boolean)", expr), SqlValue::Bool(*v)),
        other => (expr.to_string(), SqlValue::Text(scalar_text(other))),
    })
}
