//! # postgres-storage-adapter
//!
//! A PostgreSQL storage adapter for a schema-driven document platform.
//!
//! Classes are described by a [`ClassSchema`] kept in a reserved metadata
//! table (`_SCHEMA` by default). Each class gets its own table with one column
//! per field; relation fields get a join table. Documents go in and come out
//! as JSON objects in the platform's tagged format (`{"__type": "Pointer", ...}`),
//! and queries use the platform's operator language (`$in`, `$regex`,
//! `$nearSphere`, ...), compiled to parameterized SQL.
//!
//! ## Features
//!
//! - **Schema Management**: Classes, fields, class-level permissions and indexes
//!   kept in sync between the metadata table and the native catalog
//! - **Query Compilation**: Comparisons, containment, regex, full-text and geo
//!   operators compiled to parameterized SQL with typed binds
//! - **Updates**: Increment, array add/remove, deletes and dot-notation writes
//!   into object fields
//! - **Aggregation**: `$group`, `$match`, `$project`, `$sort`, `$limit` and `$skip`
//! - **Transactional Sessions**: Several writes committed or rolled back together
//! - **Schema Hooks**: Cross-process schema change notifications over LISTEN/NOTIFY
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use postgres_storage_adapter::{
//!     AdapterConfig, ClassSchema, FieldType, FindOptions, PostgresStorageAdapter, Query,
//!     StorageAdapter,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::builder("postgres://localhost/mydb").build();
//!     let adapter = PostgresStorageAdapter::connect(config).await?;
//!     adapter.perform_initialization(&[]).await?;
//!
//!     // Create a class
//!     let schema = adapter
//!         .create_class(
//!             &ClassSchema::new("Product")
//!                 .field("name", FieldType::String)
//!                 .field("price", FieldType::Number),
//!         )
//!         .await?;
//!
//!     // Create an object
//!     let object = json!({"objectId": "p1", "name": "Lamp", "price": 30});
//!     adapter
//!         .create_object(&schema, object.as_object().cloned().unwrap_or_default(), None)
//!         .await?;
//!
//!     // Query objects
//!     let cheap = adapter
//!         .find(
//!             &schema,
//!             &Query::parse(&json!({"price": {"$lt": 50}}))?,
//!             &FindOptions::default(),
//!             None,
//!         )
//!         .await?;
//!     println!("{:?}", cheap);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use postgres_storage_adapter::AdapterConfig;
//!
//! let config = AdapterConfig::builder("postgres://localhost/mydb")
//!     .schema_table("_SCHEMA")      // Metadata table name (default)
//!     .table_prefix("app_")         // Prefix for every class table
//!     .enable_schema_hooks(true)    // Publish/receive schema changes
//!     .max_limit(1000)              // Clamp find limits
//!     .build();
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod notify;
pub mod query;
pub mod schema_store;
pub mod session;
pub mod sql;
pub mod store;
pub mod transform;
pub mod types;

// Re-export main types for convenience
pub use adapter::{PostgresStorageAdapter, StorageAdapter};
pub use config::{AdapterConfig, AdapterConfigBuilder};
pub use error::{Result, StorageError};
pub use notify::{SchemaChange, SchemaNotifier};
pub use query::Query;
pub use schema_store::SchemaStore;
pub use session::TransactionalSession;
pub use store::{FindOptions, ObjectStore};
pub use types::{ClassSchema, FieldType, Indexes, SchemaField};

// Re-export SQL utilities for advanced users
pub use sql::ddl::DdlGenerator;
pub use sql::sanitize::{quote_identifier, validate_class_name};
pub use sql::where_clause::{WhereClause, build_where_clause};
