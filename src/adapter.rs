//! Storage adapter contract and its PostgreSQL implementation
//!
//! [`StorageAdapter`] is the surface the rest of the platform programs
//! against. [`PostgresStorageAdapter`] implements it by composing a
//! [`SchemaStore`] and an [`ObjectStore`] over one connection pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::notify::{SchemaChange, SchemaNotifier};
use crate::query::Query;
use crate::schema_store::SchemaStore;
use crate::session::TransactionalSession;
use crate::store::{FindOptions, ObjectStore};
use crate::types::{ClassSchema, FieldType, Indexes, SchemaField};

/// Operations a storage backend provides to the platform
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // Lifecycle

    /// Schema changes published by other instances
    fn watch(&self) -> broadcast::Receiver<SchemaChange>;

    /// Stop listening for schema changes and close every connection
    async fn handle_shutdown(&self);

    // Schema

    async fn class_exists(&self, class_name: &str) -> Result<bool>;

    async fn set_class_level_permissions(&self, class_name: &str, clps: &Value) -> Result<()>;

    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: Option<&Indexes>,
        fields: &BTreeMap<String, SchemaField>,
    ) -> Result<()>;

    async fn create_class(&self, schema: &ClassSchema) -> Result<ClassSchema>;

    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: &SchemaField,
    ) -> Result<()>;

    /// Drop a class; true when the class was a regular class (not a join table)
    async fn delete_class(&self, class_name: &str) -> Result<bool>;

    async fn delete_all_classes(&self) -> Result<()>;

    async fn delete_fields(&self, schema: &ClassSchema, field_names: &[&str]) -> Result<()>;

    async fn get_all_classes(&self) -> Result<Vec<ClassSchema>>;

    async fn get_class(&self, class_name: &str) -> Result<ClassSchema>;

    async fn create_indexes(&self, class_name: &str, indexes: &Indexes) -> Result<()>;

    async fn create_indexes_if_needed(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: Option<&FieldType>,
    ) -> Result<()>;

    async fn drop_indexes(&self, index_names: &[&str]) -> Result<()>;

    async fn get_indexes(&self, class_name: &str) -> Result<Vec<Map<String, Value>>>;

    async fn update_schema_with_indexes(&self) -> Result<()>;

    async fn ensure_index(
        &self,
        class_name: &str,
        fields: &[&str],
        index_name: Option<&str>,
        case_insensitive: bool,
    ) -> Result<()>;

    async fn ensure_uniqueness(&self, class_name: &str, fields: &[&str]) -> Result<()>;

    async fn schema_upgrade(&self, schema: &ClassSchema) -> Result<()>;

    async fn perform_initialization(&self, volatile_schemas: &[ClassSchema]) -> Result<()>;

    // Objects

    async fn create_object(
        &self,
        schema: &ClassSchema,
        object: Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Map<String, Value>>;

    async fn delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        session: Option<&TransactionalSession>,
    ) -> Result<u64>;

    async fn find_one_and_update(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Option<Value>>;

    async fn update_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>>;

    async fn upsert_one_object(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<()>;

    async fn find(
        &self,
        schema: &ClassSchema,
        query: &Query,
        options: &FindOptions,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>>;

    async fn count(
        &self,
        schema: &ClassSchema,
        query: &Query,
        estimate: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<i64>;

    async fn distinct(
        &self,
        schema: &ClassSchema,
        query: &Query,
        field_name: &str,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>>;

    async fn aggregate(
        &self,
        schema: &ClassSchema,
        pipeline: &[Value],
        explain: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>>;

    async fn update_estimated_count(&self, class_name: &str) -> Result<()>;

    // Transactions

    async fn create_transactional_session(&self) -> Result<TransactionalSession>;

    async fn commit_transactional_session(&self, session: TransactionalSession) -> Result<()>;

    async fn abort_transactional_session(&self, session: TransactionalSession) -> Result<()>;
}

/// PostgreSQL storage adapter
///
/// Class metadata lives in the schema table (default `_SCHEMA`); every class
/// gets its own table, and every relation field its own join table.
pub struct PostgresStorageAdapter {
    pool: PgPool,
    config: AdapterConfig,
    notifier: Arc<SchemaNotifier>,
    schemas: SchemaStore,
    objects: ObjectStore,
}

impl PostgresStorageAdapter {
    /// Open a connection pool and build the adapter
    pub async fn connect(config: AdapterConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool, config))
    }

    /// Build the adapter over an existing pool
    pub fn from_pool(pool: PgPool, config: AdapterConfig) -> Self {
        let notifier = Arc::new(SchemaNotifier::new(pool.clone(), &config));
        Self {
            schemas: SchemaStore::new(pool.clone(), config.clone(), notifier.clone()),
            objects: ObjectStore::new(pool.clone(), config.clone()),
            pool,
            config,
            notifier,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn notifier(&self) -> &SchemaNotifier {
        &self.notifier
    }
}

#[async_trait]
impl StorageAdapter for PostgresStorageAdapter {
    fn watch(&self) -> broadcast::Receiver<SchemaChange> {
        self.notifier.subscribe()
    }

    async fn handle_shutdown(&self) {
        self.notifier.shutdown().await;
        self.pool.close().await;
        info!("Storage adapter shut down");
    }

    // =========================================================================
    // Schema Operations
    // =========================================================================

    async fn class_exists(&self, class_name: &str) -> Result<bool> {
        self.schemas.class_exists(class_name).await
    }

    async fn set_class_level_permissions(&self, class_name: &str, clps: &Value) -> Result<()> {
        self.schemas.set_class_level_permissions(class_name, clps).await
    }

    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: Option<&Indexes>,
        fields: &BTreeMap<String, SchemaField>,
    ) -> Result<()> {
        self.schemas
            .set_indexes_with_schema_format(class_name, submitted, existing, fields)
            .await
    }

    async fn create_class(&self, schema: &ClassSchema) -> Result<ClassSchema> {
        self.schemas.create_class(schema).await
    }

    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: &SchemaField,
    ) -> Result<()> {
        self.schemas
            .add_field_if_not_exists(class_name, field_name, field)
            .await
    }

    async fn delete_class(&self, class_name: &str) -> Result<bool> {
        self.schemas.delete_class(class_name).await
    }

    async fn delete_all_classes(&self) -> Result<()> {
        self.schemas.delete_all_classes().await
    }

    async fn delete_fields(&self, schema: &ClassSchema, field_names: &[&str]) -> Result<()> {
        self.schemas.delete_fields(schema, field_names).await
    }

    async fn get_all_classes(&self) -> Result<Vec<ClassSchema>> {
        self.schemas.get_all_classes().await
    }

    async fn get_class(&self, class_name: &str) -> Result<ClassSchema> {
        self.schemas.get_class(class_name).await
    }

    async fn create_indexes(&self, class_name: &str, indexes: &Indexes) -> Result<()> {
        self.schemas.create_indexes(class_name, indexes).await
    }

    async fn create_indexes_if_needed(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: Option<&FieldType>,
    ) -> Result<()> {
        self.schemas
            .create_indexes_if_needed(class_name, field_name, field_type)
            .await
    }

    async fn drop_indexes(&self, index_names: &[&str]) -> Result<()> {
        self.schemas.drop_indexes(index_names).await
    }

    async fn get_indexes(&self, class_name: &str) -> Result<Vec<Map<String, Value>>> {
        self.schemas.get_indexes(class_name).await
    }

    async fn update_schema_with_indexes(&self) -> Result<()> {
        self.schemas.update_schema_with_indexes().await
    }

    async fn ensure_index(
        &self,
        class_name: &str,
        fields: &[&str],
        index_name: Option<&str>,
        case_insensitive: bool,
    ) -> Result<()> {
        self.schemas
            .ensure_index(class_name, fields, index_name, case_insensitive)
            .await
    }

    async fn ensure_uniqueness(&self, class_name: &str, fields: &[&str]) -> Result<()> {
        self.schemas.ensure_uniqueness(class_name, fields).await
    }

    async fn schema_upgrade(&self, schema: &ClassSchema) -> Result<()> {
        self.schemas.schema_upgrade(schema).await
    }

    async fn perform_initialization(&self, volatile_schemas: &[ClassSchema]) -> Result<()> {
        self.schemas.perform_initialization(volatile_schemas).await
    }

    // =========================================================================
    // Object Operations
    // =========================================================================

    async fn create_object(
        &self,
        schema: &ClassSchema,
        object: Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Map<String, Value>> {
        self.objects.create_object(schema, object, session).await
    }

    async fn delete_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        session: Option<&TransactionalSession>,
    ) -> Result<u64> {
        self.objects.delete_objects_by_query(schema, query, session).await
    }

    async fn find_one_and_update(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Option<Value>> {
        self.objects
            .find_one_and_update(schema, query, update, session)
            .await
    }

    async fn update_objects_by_query(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        self.objects
            .update_objects_by_query(schema, query, update, session)
            .await
    }

    async fn upsert_one_object(
        &self,
        schema: &ClassSchema,
        query: &Query,
        update: &Map<String, Value>,
        session: Option<&TransactionalSession>,
    ) -> Result<()> {
        self.objects
            .upsert_one_object(schema, query, update, session)
            .await
    }

    async fn find(
        &self,
        schema: &ClassSchema,
        query: &Query,
        options: &FindOptions,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        self.objects.find(schema, query, options, session).await
    }

    async fn count(
        &self,
        schema: &ClassSchema,
        query: &Query,
        estimate: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<i64> {
        self.objects.count(schema, query, estimate, session).await
    }

    async fn distinct(
        &self,
        schema: &ClassSchema,
        query: &Query,
        field_name: &str,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        self.objects
            .distinct(schema, query, field_name, session)
            .await
    }

    async fn aggregate(
        &self,
        schema: &ClassSchema,
        pipeline: &[Value],
        explain: bool,
        session: Option<&TransactionalSession>,
    ) -> Result<Vec<Value>> {
        self.objects
            .aggregate(schema, pipeline, explain, session)
            .await
    }

    async fn update_estimated_count(&self, class_name: &str) -> Result<()> {
        self.schemas.update_estimated_count(class_name).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    async fn create_transactional_session(&self) -> Result<TransactionalSession> {
        self.objects.create_transactional_session().await
    }

    async fn commit_transactional_session(&self, session: TransactionalSession) -> Result<()> {
        session.commit().await
    }

    async fn abort_transactional_session(&self, session: TransactionalSession) -> Result<()> {
        session.abort().await
    }
}
