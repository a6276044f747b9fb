//! Error types for storage adapter operations

use thiserror::Error;

/// PostgreSQL SQLSTATE codes the adapter reacts to
pub mod pg_code {
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const DUPLICATE_RELATION: &str = "42P07";
    pub const DUPLICATE_COLUMN: &str = "42701";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const UNIQUE_VIOLATION: &str = "23505";
}

/// Errors that can occur during storage adapter operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid nested key: {0}")]
    InvalidNestedKey(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid class name: {0}")]
    InvalidClassName(String),

    #[error("{message}")]
    DuplicateValue {
        message: String,
        /// Field whose unique constraint fired, parsed from the constraint name
        duplicated_field: Option<String>,
        #[source]
        underlying: Option<sqlx::Error>,
    },

    #[error("Class {0} already exists.")]
    DuplicateClass(String),

    #[error("Object not found.")]
    ObjectNotFound,

    #[error("Operation forbidden: {0}")]
    OperationForbidden(String),

    #[error("Incorrect type: {0}")]
    IncorrectType(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Class {0} does not exist.")]
    UndefinedClass(String),

    #[error("Transactional session is already finished")]
    SessionClosed,

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Self::InvalidJson(msg.into())
    }

    pub fn invalid_nested_key(msg: impl Into<String>) -> Self {
        Self::InvalidNestedKey(msg.into())
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn operation_forbidden(msg: impl Into<String>) -> Self {
        Self::OperationForbidden(msg.into())
    }

    pub fn unsupported_type(msg: impl Into<String>) -> Self {
        Self::UnsupportedType(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalServerError(msg.into())
    }

    /// Unique-constraint violation without a known field
    pub fn duplicate_value() -> Self {
        Self::DuplicateValue {
            message: "A duplicate value for a field with unique values was provided".to_string(),
            duplicated_field: None,
            underlying: None,
        }
    }

    /// Wrap a native unique violation, recovering the field from a
    /// `<class>_unique_<field>` constraint name when present.
    pub fn from_unique_violation(err: sqlx::Error) -> Self {
        let duplicated_field = err
            .as_database_error()
            .and_then(|db| db.constraint())
            .and_then(field_from_constraint);
        Self::DuplicateValue {
            message: "A duplicate value for a field with unique values was provided".to_string(),
            duplicated_field,
            underlying: Some(err),
        }
    }

    /// Numeric error code understood by the rest of the platform
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidJson(_) => 107,
            Self::InvalidNestedKey(_) => 121,
            Self::InvalidQuery(_) => 102,
            Self::InvalidClassName(_) => 103,
            Self::DuplicateValue { .. } | Self::DuplicateClass(_) => 137,
            Self::ObjectNotFound => 101,
            Self::OperationForbidden(_) => 119,
            Self::IncorrectType(_) => 111,
            Self::UndefinedClass(_) => 103,
            Self::UnsupportedType(_)
            | Self::InternalServerError(_)
            | Self::SessionClosed
            | Self::Sql(_)
            | Self::Json(_) => 1,
        }
    }
}

/// SQLSTATE of a database error, if the error came from the server
pub fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// Whether `err` is a server error carrying `code`
pub fn has_code(err: &sqlx::Error, code: &str) -> bool {
    sqlstate(err).as_deref() == Some(code)
}

/// Whether a [`StorageError`] wraps a server error carrying `code`
pub(crate) fn is_code(err: &StorageError, code: &str) -> bool {
    matches!(err, StorageError::Sql(e) if has_code(e, code))
}

fn field_from_constraint(constraint: &str) -> Option<String> {
    let (_, rest) = constraint.split_once("_unique_")?;
    let field: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    (!field.is_empty()).then_some(field)
}

pub type Result<T> = std::result::Result<T, StorageError>;
