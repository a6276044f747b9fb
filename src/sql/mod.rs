//! SQL generation for the storage adapter
//!
//! Provides identifier sanitization, the where-clause compiler, update and
//! aggregate translation, and DDL generation.

pub mod aggregate;
pub mod ddl;
pub mod regex;
pub mod sanitize;
pub mod update;
pub mod where_clause;

pub use aggregate::{AggregateQuery, build_aggregate};
pub use ddl::DdlGenerator;
pub use sanitize::{quote_identifier, transform_dot_field, validate_class_name};
pub use update::{UpdateClause, build_update};
pub use where_clause::{CompileResult, WhereClause, build_where_clause, compile_query};

use crate::transform::SqlValue;
use crate::types::{ClassSchema, FieldType};

/// Hands out `$n` placeholders and collects their values in order
#[derive(Debug)]
pub(crate) struct Binder {
    pub(crate) next: usize,
    pub(crate) params: Vec<SqlValue>,
}

impl Binder {
    pub(crate) fn new(start_index: usize) -> Self {
        Self {
            next: start_index,
            params: Vec::new(),
        }
    }

    pub(crate) fn bind(&mut self, value: SqlValue) -> String {
        let placeholder = format!("${}", self.next);
        self.next += 1;
        self.params.push(value);
        placeholder
    }

    /// Take over the parameters a sub-query consumed
    pub(crate) fn absorb(&mut self, result: CompileResult) {
        self.params.extend(result.params);
        self.next = result.next_index;
    }
}

/// Select expression for one column. Geometric columns are read through
/// their text form so they decode without native geometric types.
pub fn column_expr(schema: &ClassSchema, name: &str) -> String {
    let col = quote_identifier(name);
    match schema.field_type(name) {
        Some(FieldType::GeoPoint | FieldType::Polygon) => format!("{}::text AS {}", col, col),
        _ => col,
    }
}

/// Select list for `schema`: every stored column when `keys` is `None`,
/// otherwise the requested keys that name a stored column (plus the
/// bookkeeping columns). `ACL` selects both permission columns.
pub fn projection(schema: &ClassSchema, keys: Option<&[String]>) -> String {
    let has_geo = schema.fields.values().any(|f| {
        matches!(f.field_type, FieldType::GeoPoint | FieldType::Polygon)
    });
    match keys {
        None if !has_geo => "*".to_string(),
        None => schema
            .fields
            .iter()
            .filter(|(_, f)| !f.field_type.is_relation())
            .map(|(name, _)| column_expr(schema, name))
            .collect::<Vec<_>>()
            .join(", "),
        Some(keys) => {
            let mut columns: Vec<String> = Vec::new();
            for key in keys {
                let expanded: &[&str] = match key.as_str() {
                    "ACL" => &["_rperm", "_wperm"],
                    "$score" => &[],
                    other => {
                        let base = other.split('.').next().unwrap_or(other);
                        match schema.field_type(base) {
                            Some(ft) if !ft.is_relation() => {
                                let expr = column_expr(schema, base);
                                if !columns.contains(&expr) {
                                    columns.push(expr);
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }
                };
                for name in expanded {
                    let expr = column_expr(schema, name);
                    if !columns.contains(&expr) {
                        columns.push(expr);
                    }
                }
            }
            for name in ["objectId", "createdAt", "updatedAt"] {
                let expr = quote_identifier(name);
                if !columns.contains(&expr) {
                    columns.push(expr);
                }
            }
            columns.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Projection Tests
    // =========================================================================

    #[test]
    fn test_projection_star_without_geo() {
        let schema = ClassSchema::new("Item").field("name", FieldType::String);
        assert_eq!(projection(&schema, None), "*");
    }

    #[test]
    fn test_projection_geo_as_text() {
        let schema = ClassSchema::new("Place")
            .field("loc", FieldType::GeoPoint)
            .field("tags", FieldType::relation("Tag"));
        let select = projection(&schema, None);
        assert!(select.contains("\"loc\"::text AS \"loc\""));
        assert!(select.contains("\"objectId\""));
        assert!(!select.contains("\"tags\""));
    }

    #[test]
    fn test_projection_keys() {
        let schema = ClassSchema::new("Item")
            .field("name", FieldType::String)
            .field("tags", FieldType::relation("Tag"))
            .to_storage();
        let keys = vec![
            "name".to_string(),
            "ACL".to_string(),
            "$score".to_string(),
            "tags".to_string(),
            "ghost".to_string(),
        ];
        assert_eq!(
            projection(&schema, Some(&keys)),
            "\"name\", \"_rperm\", \"_wperm\", \"objectId\", \"createdAt\", \"updatedAt\""
        );
    }

    #[test]
    fn test_projection_dot_key_selects_column() {
        let schema = ClassSchema::new("Item").field("meta", FieldType::Object);
        let keys = vec!["meta.size".to_string()];
        assert!(projection(&schema, Some(&keys)).starts_with("\"meta\""));
    }

    #[test]
    fn test_binder_numbering() {
        let mut binder = Binder::new(3);
        assert_eq!(binder.bind(SqlValue::Int(1)), "$3");
        assert_eq!(binder.bind(SqlValue::Int(2)), "$4");
        assert_eq!(binder.next, 5);
        assert_eq!(binder.params.len(), 2);
    }
}
