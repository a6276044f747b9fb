//! Configuration for the storage adapter
//!
//! Provides a builder pattern for configuring the adapter.

/// Default name of the reserved metadata table
pub const DEFAULT_SCHEMA_TABLE: &str = "_SCHEMA";

/// Default LISTEN/NOTIFY channel for schema changes
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "schema.change";

/// Configuration for the storage adapter
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Name of the metadata table (default: "_SCHEMA")
    pub schema_table: String,
    /// Prefix prepended to every class and join table name
    pub table_prefix: String,
    /// Publish and listen for cross-process schema changes
    pub enable_schema_hooks: bool,
    /// Channel used for schema change notifications
    pub notification_channel: String,
    /// Maximum pool size
    pub max_connections: u32,
    /// Upper bound applied to `find` limits
    pub max_limit: Option<i64>,
}

impl AdapterConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> AdapterConfigBuilder {
        AdapterConfigBuilder::new(database_url)
    }

    /// Native table name backing a class
    pub fn table_name(&self, class_name: &str) -> String {
        format!("{}{}", self.table_prefix, class_name)
    }

    /// Native join table name backing a Relation field
    pub fn join_table_name(&self, field_name: &str, class_name: &str) -> String {
        format!("{}_Join:{}:{}", self.table_prefix, field_name, class_name)
    }
}

/// Builder for AdapterConfig
#[derive(Debug)]
pub struct AdapterConfigBuilder {
    database_url: String,
    schema_table: String,
    table_prefix: String,
    enable_schema_hooks: bool,
    notification_channel: String,
    max_connections: u32,
    max_limit: Option<i64>,
}

impl AdapterConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            schema_table: DEFAULT_SCHEMA_TABLE.to_string(),
            table_prefix: String::new(),
            enable_schema_hooks: false,
            notification_channel: DEFAULT_NOTIFICATION_CHANNEL.to_string(),
            max_connections: 10,
            max_limit: None,
        }
    }

    /// Set the metadata table name (default: "_SCHEMA")
    pub fn schema_table(mut self, name: impl Into<String>) -> Self {
        self.schema_table = name.into();
        self
    }

    /// Set the table name prefix (default: none)
    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Enable or disable schema change hooks (default: false)
    pub fn enable_schema_hooks(mut self, enabled: bool) -> Self {
        self.enable_schema_hooks = enabled;
        self
    }

    /// Set the notification channel (default: "schema.change")
    pub fn notification_channel(mut self, channel: impl Into<String>) -> Self {
        self.notification_channel = channel.into();
        self
    }

    /// Set the maximum number of pooled connections (default: 10)
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Clamp every `find` limit to `max`
    pub fn max_limit(mut self, max: i64) -> Self {
        self.max_limit = Some(max);
        self
    }

    /// Build the configuration
    pub fn build(self) -> AdapterConfig {
        AdapterConfig {
            database_url: self.database_url,
            schema_table: self.schema_table,
            table_prefix: self.table_prefix,
            enable_schema_hooks: self.enable_schema_hooks,
            notification_channel: self.notification_channel,
            max_connections: self.max_connections,
            max_limit: self.max_limit,
        }
    }
}
