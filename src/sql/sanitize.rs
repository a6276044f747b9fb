//! SQL Identifier Sanitization Utilities
//!
//! Class and field names become quoted identifiers; values never do. Dot
//! notation fields are rendered as JSON path expressions over the owning column.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, StorageError};

static CLASS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(_Join:[A-Za-z0-9_]+:)?_?[A-Za-z][A-Za-z0-9_]*$").expect("valid class pattern")
});
static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_?[A-Za-z][A-Za-z0-9_]*$").expect("valid field pattern"));
static AUTH_DATA_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_auth_data_([a-zA-Z0-9_]+)$").expect("valid auth pattern"));

/// Quote a SQL identifier to make it safe for use in queries
///
/// # Example
/// ```
/// use postgres_storage_adapter::sql::quote_identifier;
///
/// let quoted = quote_identifier("_User");
/// assert_eq!(quoted, "\"_User\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    // Escape any double quotes in the identifier by doubling them
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Validate a class name
///
/// Rules:
/// - Optional leading underscore, then a letter
/// - Letters, digits and underscores only
/// - Join tables (`_Join:<field>:<class>`) are accepted
pub fn validate_class_name(name: &str) -> Result<()> {
    if CLASS_NAME.is_match(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidClassName(format!(
            "Invalid classname: {}, classnames can only have alphanumeric characters and _, and must start with an alpha character ",
            name
        )))
    }
}

/// Validate a top-level field name (same alphabet as class names)
pub fn validate_field_name(name: &str) -> Result<()> {
    if FIELD_NAME.is_match(name) {
        Ok(())
    } else {
        Err(StorageError::invalid_json(format!(
            "invalid field name: {}",
            name
        )))
    }
}

/// Provider of an `_auth_data_<provider>` key
pub fn auth_data_provider(field_name: &str) -> Option<&str> {
    AUTH_DATA_FIELD
        .captures(field_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Path components of a dot-notation field: the column is quoted, nested keys
/// are literals, and numeric components are array indexes
pub fn dot_field_components(field_name: &str) -> Vec<String> {
    field_name
        .split('.')
        .enumerate()
        .map(|(idx, component)| {
            if idx == 0 {
                quote_identifier(component)
            } else if !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit()) {
                component.to_string()
            } else {
                quote_literal(component)
            }
        })
        .collect()
}

/// Render `a.b.c` as `"a"->'b'->>'c'` (text extraction of the leaf)
pub fn transform_dot_field(field_name: &str) -> String {
    let mut components = dot_field_components(field_name);
    let Some(leaf) = components.pop() else {
        return quote_identifier(field_name);
    };
    if components.is_empty() {
        return leaf;
    }
    format!("{}->>{}", components.join("->"), leaf)
}

/// Render `a.b.c` as `"a"->'b'->'c'` (jsonb extraction of the leaf)
pub fn transform_dot_field_to_jsonb(field_name: &str) -> String {
    dot_field_components(field_name).join("->")
}
