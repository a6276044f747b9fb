//! Core type definitions for the storage adapter
//!
//! Includes field types, class schemas, and the mapping from field types to
//! native PostgreSQL column types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Result, StorageError};

/// Index name -> ordered field descriptor (`{"field": 1}` or `{"__op": "Delete"}`)
pub type Indexes = BTreeMap<String, Map<String, Value>>;

/// Class that carries the auth/security columns
pub const USER_CLASS: &str = "_User";

/// Columns every table carries for read/write ACLs
pub const PERMISSION_COLUMNS: [&str; 2] = ["_rperm", "_wperm"];

/// Hidden `_User` columns created with the table
pub const USER_AUTH_COLUMNS: &[(&str, FieldKind)] = &[
    ("_hashed_password", FieldKind::String),
    ("_email_verify_token_expires_at", FieldKind::Date),
    ("_email_verify_token", FieldKind::String),
    ("_account_lockout_expires_at", FieldKind::Date),
    ("_failed_login_count", FieldKind::Number),
    ("_perishable_token", FieldKind::String),
    ("_perishable_token_expires_at", FieldKind::Date),
    ("_password_changed_at", FieldKind::Date),
    ("_password_history", FieldKind::Array),
];

// ============================================================================
// Field Types
// ============================================================================

/// Abstract field type declared in a class schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array {
        /// Element type, when declared
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<Box<FieldType>>,
    },
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    GeoPoint,
    Polygon,
    Bytes,
    File,
}

/// Payload-free discriminant of [`FieldType`], used for constant tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Date,
    Array,
}

impl From<FieldKind> for FieldType {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::String => FieldType::String,
            FieldKind::Number => FieldType::Number,
            FieldKind::Date => FieldType::Date,
            FieldKind::Array => FieldType::Array { contents: None },
        }
    }
}

impl FieldType {
    /// Array whose elements are strings
    pub fn string_array() -> Self {
        FieldType::Array {
            contents: Some(Box::new(FieldType::String)),
        }
    }

    pub fn pointer(target_class: impl Into<String>) -> Self {
        FieldType::Pointer {
            target_class: target_class.into(),
        }
    }

    pub fn relation(target_class: impl Into<String>) -> Self {
        FieldType::Relation {
            target_class: target_class.into(),
        }
    }

    /// Parse a field type descriptor, rejecting unknown type tags
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|_| StorageError::unsupported_type(format!("no type for {} yet", value)))
    }

    /// Type tag as written in schemas
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Boolean => "Boolean",
            FieldType::Date => "Date",
            FieldType::Object => "Object",
            FieldType::Array { .. } => "Array",
            FieldType::Pointer { .. } => "Pointer",
            FieldType::Relation { .. } => "Relation",
            FieldType::GeoPoint => "GeoPoint",
            FieldType::Polygon => "Polygon",
            FieldType::Bytes => "Bytes",
            FieldType::File => "File",
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array { .. })
    }

    /// Array stored as a native `text[]` column
    pub fn is_string_array(&self) -> bool {
        matches!(self, FieldType::Array { contents: Some(c) } if **c == FieldType::String)
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::Relation { .. })
    }

    /// Target class of a Pointer or Relation
    pub fn target_class(&self) -> Option<&str> {
        match self {
            FieldType::Pointer { target_class } | FieldType::Relation { target_class } => {
                Some(target_class)
            }
            _ => None,
        }
    }
}

/// Map a field type to its native column type.
///
/// Relations have no column on the owning table and are rejected.
pub fn native_column_type(field_type: &FieldType) -> Result<&'static str> {
    Ok(match field_type {
        FieldType::String | FieldType::File | FieldType::Pointer { .. } => "text",
        FieldType::Date => "timestamp with time zone",
        FieldType::Object | FieldType::Bytes => "jsonb",
        FieldType::Boolean => "boolean",
        FieldType::Number => "double precision",
        FieldType::GeoPoint => "point",
        FieldType::Polygon => "polygon",
        FieldType::Array { .. } if field_type.is_string_array() => "text[]",
        FieldType::Array { .. } => "jsonb",
        FieldType::Relation { .. } => {
            return Err(StorageError::unsupported_type(
                "Relation fields have no native column",
            ));
        }
    })
}

/// A declared field: its type plus optional constraints carried through the metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaField {
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(
        rename = "defaultValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<Value>,
}

impl From<FieldType> for SchemaField {
    fn from(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: None,
            default_value: None,
        }
    }
}

// ============================================================================
// Class Schema
// ============================================================================

/// One object class: fields, class-level permissions and indexes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassSchema {
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, SchemaField>,
    #[serde(
        rename = "classLevelPermissions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub class_level_permissions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Indexes>,
}

impl ClassSchema {
    /// Create a schema carrying the default `objectId`/`createdAt`/`updatedAt` fields
    pub fn new(class_name: impl Into<String>) -> Self {
        Self::empty(class_name)
            .field("objectId", FieldType::String)
            .field("createdAt", FieldType::Date)
            .field("updatedAt", FieldType::Date)
    }

    /// Create a schema without any fields
    pub fn empty(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            fields: BTreeMap::new(),
            class_level_permissions: None,
            indexes: None,
        }
    }

    /// Add a field
    pub fn field(mut self, name: impl Into<String>, field: impl Into<SchemaField>) -> Self {
        self.fields.insert(name.into(), field.into());
        self
    }

    /// Set class-level permissions
    pub fn with_class_level_permissions(mut self, clps: Value) -> Self {
        self.class_level_permissions = Some(clps);
        self
    }

    /// Add an index over `fields` (ascending)
    pub fn index(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        let key = fields
            .iter()
            .map(|f| (f.to_string(), json!(1)))
            .collect::<Map<_, _>>();
        self.indexes
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), key);
        self
    }

    /// Declared type of `name`
    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name).map(|f| &f.field_type)
    }

    pub fn is_user_class(&self) -> bool {
        self.class_name == USER_CLASS
    }

    /// Fields as stored: declared fields plus permission columns and, for
    /// `_User`, the hidden auth columns.
    pub fn to_storage(&self) -> ClassSchema {
        let mut schema = self.clone();
        for column in PERMISSION_COLUMNS {
            schema
                .fields
                .insert(column.to_string(), FieldType::string_array().into());
        }
        if schema.is_user_class() {
            for (column, kind) in USER_AUTH_COLUMNS {
                schema
                    .fields
                    .entry(column.to_string())
                    .or_insert_with(|| FieldType::from(*kind).into());
            }
        }
        schema
    }

    /// Schema as exposed to callers: storage-only columns stripped and
    /// class-level permissions defaulted.
    pub fn to_public(&self) -> ClassSchema {
        let mut schema = self.clone();
        for column in PERMISSION_COLUMNS {
            schema.fields.remove(column);
        }
        if schema.is_user_class() {
            for (column, _) in USER_AUTH_COLUMNS {
                schema.fields.remove(*column);
            }
        }
        schema.class_level_permissions = Some(match schema.class_level_permissions.take() {
            Some(Value::Object(clps)) => {
                let mut merged = empty_class_level_permissions();
                if let Value::Object(target) = &mut merged {
                    target.extend(clps);
                }
                merged
            }
            _ => default_class_level_permissions(),
        });
        schema.indexes.get_or_insert_with(BTreeMap::new);
        schema
    }

    /// Relation fields, each backed by a join table
    pub fn relation_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.field_type.is_relation())
            .map(|(name, _)| name.as_str())
    }
}

const CLP_OPERATIONS: [&str; 7] = [
    "find", "count", "get", "create", "update", "delete", "addField",
];

/// Public access for every operation
pub fn default_class_level_permissions() -> Value {
    let mut clps: Map<String, Value> = CLP_OPERATIONS
        .iter()
        .map(|op| (op.to_string(), json!({ "*": true })))
        .collect();
    clps.insert("protectedFields".to_string(), json!({ "*": [] }));
    Value::Object(clps)
}

/// No access for any operation
pub fn empty_class_level_permissions() -> Value {
    let mut clps: Map<String, Value> = CLP_OPERATIONS
        .iter()
        .map(|op| (op.to_string(), json!({})))
        .collect();
    clps.insert("protectedFields".to_string(), json!({}));
    Value::Object(clps)
}
