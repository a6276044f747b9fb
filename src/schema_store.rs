//! Schema Store
//!
//! Keeps one metadata row per class in the schema table and the native
//! tables, columns and indexes in step with it. Every mutation that touches
//! both DDL and metadata runs in one transaction and publishes a schema
//! change notification afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use sqlx::{Connection, PgConnection, PgPool, Row};
use tracing::{debug, info, instrument, warn};

use crate::config::AdapterConfig;
use crate::error::{Result, StorageError, has_code, is_code, pg_code};
use crate::notify::SchemaNotifier;
use crate::sql::ddl::DdlGenerator;
use crate::sql::sanitize::{quote_identifier, validate_class_name};
use crate::transform::decode_row;
use crate::types::{ClassSchema, FieldType, Indexes, SchemaField};

/// Platform classes dropped by a full wipe even when not registered
pub const SYSTEM_CLASSES: &[&str] = &[
    "_PushStatus",
    "_JobStatus",
    "_JobSchedule",
    "_Hooks",
    "_GlobalConfig",
    "_GraphQLConfig",
    "_Audience",
    "_Idempotency",
];

/// Index implicitly present on every class
const PRIMARY_INDEX_NAME: &str = "_id_";

/// Metadata and DDL operations over class tables
pub struct SchemaStore {
    pool: PgPool,
    config: AdapterConfig,
    notifier: Arc<SchemaNotifier>,
}

impl SchemaStore {
    pub fn new(pool: PgPool, config: AdapterConfig, notifier: Arc<SchemaNotifier>) -> Self {
        Self {
            pool,
            config,
            notifier,
        }
    }

    fn ddl(&self) -> DdlGenerator<'_> {
        DdlGenerator::new(&self.config)
    }

    fn schema_table(&self) -> String {
        quote_identifier(&self.config.schema_table)
    }

    /// Create the schema table if it does not exist yet
    pub async fn ensure_schema_table(&self) -> Result<()> {
        match sqlx::query(&self.ddl().generate_schema_table())
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            // concurrent creation races on the catalog
            Err(e)
                if has_code(&e, pg_code::DUPLICATE_RELATION)
                    || has_code(&e, pg_code::UNIQUE_VIOLATION) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Whether a native table backs `class_name`
    pub async fn class_exists(&self, class_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(self.config.table_name(class_name))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Every registered class, in public form
    pub async fn get_all_classes(&self) -> Result<Vec<ClassSchema>> {
        self.ensure_schema_table().await?;
        let rows = sqlx::query(&format!(
            "SELECT \"className\", \"schema\" FROM {}",
            self.schema_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_schema_row).collect()
    }

    /// One class in public form; `UndefinedClass` when it is not registered
    pub async fn get_class(&self, class_name: &str) -> Result<ClassSchema> {
        let row = sqlx::query(&format!(
            "SELECT \"className\", \"schema\" FROM {} WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .fetch_optional(&self.pool)
        .await;
        match row {
            Ok(Some(row)) => parse_schema_row(&row),
            Ok(None) => Err(StorageError::UndefinedClass(class_name.to_string())),
            Err(e) if has_code(&e, pg_code::UNDEFINED_TABLE) => {
                Err(StorageError::UndefinedClass(class_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Native indexes of a class table, as `pg_indexes` rows
    pub async fn get_indexes(&self, class_name: &str) -> Result<Vec<Map<String, Value>>> {
        let rows = sqlx::query("SELECT * FROM pg_indexes WHERE tablename = $1")
            .bind(self.config.table_name(class_name))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    // =========================================================================
    // Class Lifecycle
    // =========================================================================

    /// Create the table, join tables, metadata row and indexes of a class.
    ///
    /// A class that is already registered fails with `DuplicateClass`, even
    /// when the submitted body is identical.
    #[instrument(skip(self, schema), fields(class_name = %schema.class_name))]
    pub async fn create_class(&self, schema: &ClassSchema) -> Result<ClassSchema> {
        validate_class_name(&schema.class_name)?;
        self.ensure_schema_table().await?;

        let mut tx = self.pool.begin().await?;
        if let Err(e) = self.create_class_in(&mut *tx, schema).await {
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await?;

        info!("Created class");
        self.notifier.publish().await;
        Ok(schema.to_public())
    }

    async fn create_class_in(&self, conn: &mut PgConnection, schema: &ClassSchema) -> Result<()> {
        self.create_table(conn, schema).await?;

        let insert = sqlx::query(&format!(
            "INSERT INTO {} (\"className\", \"schema\", \"isParseClass\") VALUES ($1, $2, true)",
            self.schema_table()
        ))
        .bind(&schema.class_name)
        .bind(serde_json::to_value(schema)?)
        .execute(&mut *conn)
        .await;
        match insert {
            Ok(_) => {}
            Err(e) if has_code(&e, pg_code::UNIQUE_VIOLATION) => {
                return Err(StorageError::DuplicateClass(schema.class_name.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(indexes) = &schema.indexes {
            let submitted: Map<String, Value> = indexes
                .iter()
                .map(|(name, key)| (name.clone(), Value::Object(key.clone())))
                .collect();
            self.apply_index_changes(conn, &schema.class_name, &submitted, None, &schema.fields)
                .await?;
        }
        Ok(())
    }

    /// Create the native table and relation join tables; already existing
    /// tables are left alone
    async fn create_table(&self, conn: &mut PgConnection, schema: &ClassSchema) -> Result<()> {
        let ddl = self.ddl();
        match sqlx::query(&ddl.generate_create_table(schema)?)
            .execute(&mut *conn)
            .await
        {
            Ok(_) => {}
            Err(e) if has_code(&e, pg_code::DUPLICATE_RELATION) => {}
            Err(e) => return Err(e.into()),
        }
        for field in schema.relation_fields() {
            sqlx::query(&ddl.generate_join_table(field, &schema.class_name))
                .execute(&mut *conn)
                .await?;
        }
        debug!(class_name = %schema.class_name, "Created table");
        Ok(())
    }

    /// Drop the class table and its metadata row.
    ///
    /// Returns `false` when the class was a relation join table.
    #[instrument(skip(self))]
    pub async fn delete_class(&self, class_name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&self.ddl().generate_drop_table(class_name))
            .execute(&mut *tx)
            .await?;
        match sqlx::query(&format!(
            "DELETE FROM {} WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .execute(&mut *tx)
        .await
        {
            Ok(_) => tx.commit().await?,
            Err(e) if has_code(&e, pg_code::UNDEFINED_TABLE) => {
                tx.rollback().await?;
                sqlx::query(&self.ddl().generate_drop_table(class_name))
                    .execute(&self.pool)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        info!("Deleted class");
        self.notifier.publish().await;
        Ok(!class_name.starts_with("_Join:"))
    }

    /// Drop every class, join table, system table and the schema table.
    /// Intended for tests.
    #[instrument(skip(self))]
    pub async fn delete_all_classes(&self) -> Result<()> {
        let rows = match sqlx::query(&format!(
            "SELECT \"className\", \"schema\" FROM {}",
            self.schema_table()
        ))
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) if has_code(&e, pg_code::UNDEFINED_TABLE) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut tables = vec![self.config.schema_table.clone()];
        tables.extend(SYSTEM_CLASSES.iter().map(|c| self.config.table_name(c)));
        for row in &rows {
            let schema = parse_schema_row(row)?;
            tables.push(self.config.table_name(&schema.class_name));
            tables.extend(
                schema
                    .relation_fields()
                    .map(|field| self.config.join_table_name(field, &schema.class_name)),
            );
        }

        let mut tx = self.pool.begin().await?;
        for table in &tables {
            sqlx::query(&DdlGenerator::generate_drop_raw_table(table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(tables = tables.len(), "Deleted all classes");
        Ok(())
    }

    // =========================================================================
    // Field Lifecycle
    // =========================================================================

    /// Add a field to a class.
    ///
    /// Adding a field already declared with the same type is a no-op; a
    /// different type fails with `IncorrectType`. A missing table is created
    /// through the class creation path.
    #[instrument(skip(self, field))]
    pub async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field: &SchemaField,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let created = self
            .add_field_in(&mut *tx, class_name, field_name, field)
            .await?;
        tx.commit().await?;
        if created {
            debug!("Added field");
        }
        self.notifier.publish().await;
        Ok(())
    }

    /// Returns whether the metadata changed
    async fn add_field_in(
        &self,
        conn: &mut PgConnection,
        class_name: &str,
        field_name: &str,
        field: &SchemaField,
    ) -> Result<bool> {
        let ddl = self.ddl();
        if let FieldType::Relation { .. } = field.field_type {
            sqlx::query(&ddl.generate_join_table(field_name, class_name))
                .execute(&mut *conn)
                .await?;
        } else {
            let statement = ddl.generate_add_column(class_name, field_name, &field.field_type)?;
            let mut savepoint = Connection::begin(&mut *conn).await?;
            match sqlx::query(&statement).execute(&mut *savepoint).await {
                Ok(_) => savepoint.commit().await?,
                Err(e) if has_code(&e, pg_code::UNDEFINED_TABLE) => {
                    savepoint.rollback().await?;
                    let schema = ClassSchema::new(class_name).field(field_name, field.clone());
                    self.create_class_in(conn, &schema).await?;
                    return Ok(true);
                }
                Err(e) if has_code(&e, pg_code::DUPLICATE_COLUMN) => savepoint.rollback().await?,
                Err(e) => return Err(e.into()),
            }
        }

        let declared: Option<Value> = sqlx::query_scalar(&format!(
            "SELECT \"schema\"->'fields'->$2 FROM {} WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .bind(field_name)
        .fetch_optional(&mut *conn)
        .await?
        .flatten();

        if let Some(declared) = declared.filter(|v| !v.is_null()) {
            let existing = FieldType::from_value(&declared)?;
            if existing == field.field_type {
                return Ok(false);
            }
            return Err(StorageError::IncorrectType(format!(
                "schema mismatch for {}.{}; expected {} but got {}",
                class_name,
                field_name,
                existing.name(),
                field.field_type.name()
            )));
        }

        sqlx::query(&format!(
            "UPDATE {} SET \"schema\" = jsonb_set(\"schema\", $2::text[], $3::jsonb) WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .bind(vec!["fields".to_string(), field_name.to_string()])
        .bind(serde_json::to_value(field)?)
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }

    /// Drop fields from a class; relation fields only leave the metadata
    #[instrument(skip(self, schema), fields(class_name = %schema.class_name))]
    pub async fn delete_fields(&self, schema: &ClassSchema, field_names: &[&str]) -> Result<()> {
        let mut updated = schema.clone();
        let mut columns = Vec::new();
        for name in field_names {
            if let Some(field) = updated.fields.remove(*name) {
                if !field.field_type.is_relation() {
                    columns.push(*name);
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "UPDATE {} SET \"schema\" = $2 WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(&schema.class_name)
        .bind(serde_json::to_value(&updated)?)
        .execute(&mut *tx)
        .await?;
        if !columns.is_empty() {
            sqlx::query(&self.ddl().generate_drop_columns(&schema.class_name, &columns))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(fields = ?field_names, "Deleted fields");
        self.notifier.publish().await;
        Ok(())
    }

    /// Add every declared field missing from the native table
    pub async fn schema_upgrade(&self, schema: &ClassSchema) -> Result<()> {
        let columns: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns WHERE table_name = $1",
        )
        .bind(self.config.table_name(&schema.class_name))
        .fetch_all(&self.pool)
        .await?;

        for (name, field) in &schema.fields {
            if columns.iter().any(|c| c == name) {
                continue;
            }
            self.add_field_if_not_exists(&schema.class_name, name, field)
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Permissions & Indexes
    // =========================================================================

    #[instrument(skip(self, clps))]
    pub async fn set_class_level_permissions(&self, class_name: &str, clps: &Value) -> Result<()> {
        self.ensure_schema_table().await?;
        sqlx::query(&format!(
            "UPDATE {} SET \"schema\" = jsonb_set(\"schema\", '{{classLevelPermissions}}', $2::jsonb) WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .bind(clps)
        .execute(&self.pool)
        .await?;
        self.notifier.publish().await;
        Ok(())
    }

    /// Apply index additions and `{"__op": "Delete"}` removals given in
    /// schema format, then record the resulting index map.
    #[instrument(skip(self, submitted, existing, fields))]
    pub async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: Option<&Indexes>,
        fields: &BTreeMap<String, SchemaField>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.apply_index_changes(&mut *tx, class_name, submitted, existing, fields)
            .await?;
        tx.commit().await?;
        self.notifier.publish().await;
        Ok(())
    }

    async fn apply_index_changes(
        &self,
        conn: &mut PgConnection,
        class_name: &str,
        submitted: &Map<String, Value>,
        existing: Option<&Indexes>,
        fields: &BTreeMap<String, SchemaField>,
    ) -> Result<()> {
        let mut indexes = existing.cloned().unwrap_or_default();
        if indexes.is_empty() {
            indexes.insert(
                PRIMARY_INDEX_NAME.to_string(),
                [("_id".to_string(), json!(1))].into_iter().collect(),
            );
        }

        let mut inserted = Indexes::new();
        let mut deleted = Vec::new();
        for (name, spec) in submitted {
            let is_delete = spec.get("__op").and_then(Value::as_str) == Some("Delete");
            match (indexes.contains_key(name), is_delete) {
                (true, false) => {
                    return Err(StorageError::invalid_query(format!(
                        "Index {} exists, cannot update.",
                        name
                    )));
                }
                (false, true) => {
                    return Err(StorageError::invalid_query(format!(
                        "Index {} does not exist, cannot delete.",
                        name
                    )));
                }
                (true, true) => {
                    indexes.remove(name);
                    deleted.push(name.as_str());
                }
                (false, false) => {
                    let key = spec.as_object().cloned().unwrap_or_default();
                    if let Some(missing) = key.keys().find(|k| !fields.contains_key(*k)) {
                        return Err(StorageError::invalid_query(format!(
                            "Field {} does not exist, cannot add index.",
                            missing
                        )));
                    }
                    indexes.insert(name.clone(), key.clone());
                    inserted.insert(name.clone(), key);
                }
            }
        }

        let ddl = self.ddl();
        for (name, key) in &inserted {
            let columns: Vec<&str> = key.keys().map(String::as_str).collect();
            sqlx::query(&ddl.generate_create_index(class_name, name, &columns, false))
                .execute(&mut *conn)
                .await?;
        }
        for name in &deleted {
            sqlx::query(&ddl.generate_drop_index(name))
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query(&format!(
            "UPDATE {} SET \"schema\" = jsonb_set(\"schema\", '{{indexes}}', $2::jsonb) WHERE \"className\" = $1",
            self.schema_table()
        ))
        .bind(class_name)
        .bind(serde_json::to_value(&indexes)?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Create named indexes in one transaction
    pub async fn create_indexes(&self, class_name: &str, indexes: &Indexes) -> Result<()> {
        let ddl = self.ddl();
        let mut tx = self.pool.begin().await?;
        for (name, key) in indexes {
            let columns: Vec<&str> = key.keys().map(String::as_str).collect();
            sqlx::query(&ddl.generate_create_index(class_name, name, &columns, false))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Index a single field, named after the table and field
    pub async fn create_indexes_if_needed(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: Option<&FieldType>,
    ) -> Result<()> {
        sqlx::query(&self.ddl().generate_field_index(class_name, field_name, field_type))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop indexes by name in one transaction
    pub async fn drop_indexes(&self, index_names: &[&str]) -> Result<()> {
        let ddl = self.ddl();
        let mut tx = self.pool.begin().await?;
        for name in index_names {
            sqlx::query(&ddl.generate_drop_index(name))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Re-create any index recorded in the metadata but missing natively
    pub async fn update_schema_with_indexes(&self) -> Result<()> {
        for schema in self.get_all_classes().await? {
            let Some(indexes) = &schema.indexes else {
                continue;
            };
            let declared: Indexes = indexes
                .iter()
                .filter(|(name, key)| {
                    name.as_str() != PRIMARY_INDEX_NAME
                        && key.keys().all(|k| schema.fields.contains_key(k))
                })
                .map(|(name, key)| (name.clone(), key.clone()))
                .collect();
            if !declared.is_empty() {
                self.create_indexes(&schema.class_name, &declared).await?;
            }
        }
        Ok(())
    }

    /// Index `fields`, by default as `<table>_default_<fields>`
    pub async fn ensure_index(
        &self,
        class_name: &str,
        fields: &[&str],
        index_name: Option<&str>,
        case_insensitive: bool,
    ) -> Result<()> {
        let ddl = self.ddl();
        let name = index_name
            .map(str::to_string)
            .unwrap_or_else(|| ddl.default_index_name(class_name, fields));
        let statement = ddl.generate_create_index(class_name, &name, fields, case_insensitive);
        index_result(sqlx::query(&statement).execute(&self.pool).await)
    }

    /// Enforce uniqueness over `fields`; existing duplicates fail with `DuplicateValue`
    pub async fn ensure_uniqueness(&self, class_name: &str, fields: &[&str]) -> Result<()> {
        let statement = self.ddl().generate_unique_index(class_name, fields);
        index_result(sqlx::query(&statement).execute(&self.pool).await)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Refresh planner statistics, which back approximate counts
    pub async fn update_estimated_count(&self, class_name: &str) -> Result<()> {
        sqlx::query(&format!(
            "ANALYZE {}",
            quote_identifier(&self.config.table_name(class_name))
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Prepare the database: schema table, volatile class tables and their
    /// columns, the change listener, and the SQL helper functions.
    #[instrument(skip(self, volatile_schemas))]
    pub async fn perform_initialization(&self, volatile_schemas: &[ClassSchema]) -> Result<()> {
        self.ensure_schema_table().await?;

        for schema in volatile_schemas {
            let mut conn = self.pool.acquire().await?;
            match self.create_table(&mut *conn, schema).await {
                Ok(()) => {}
                Err(e) if is_code(&e, pg_code::UNIQUE_VIOLATION) => {
                    warn!(class_name = %schema.class_name, "Volatile table created concurrently");
                }
                Err(e) => return Err(e),
            }
            drop(conn);
            self.schema_upgrade(schema).await?;
        }

        self.notifier.start().await?;

        let mut tx = self.pool.begin().await?;
        for function in DdlGenerator::helper_functions() {
            sqlx::query(function).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(volatile = volatile_schemas.len(), "Storage initialized");
        Ok(())
    }
}

/// Swallow "already exists"; report constraint violations as duplicates
fn index_result(result: std::result::Result<sqlx::postgres::PgQueryResult, sqlx::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if has_code(&e, pg_code::DUPLICATE_RELATION) => Ok(()),
        Err(e) if has_code(&e, pg_code::UNIQUE_VIOLATION) => {
            Err(StorageError::from_unique_violation(e))
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_schema_row(row: &sqlx::postgres::PgRow) -> Result<ClassSchema> {
    let class_name: String = row.try_get("className")?;
    let mut document: Value = row.try_get("schema")?;
    if let Value::Object(obj) = &mut document {
        obj.insert("className".to_string(), Value::String(class_name));
    }
    let schema: ClassSchema = serde_json::from_value(document)?;
    Ok(schema.to_public())
}
