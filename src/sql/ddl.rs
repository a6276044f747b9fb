//! DDL Generation for Class Tables
//!
//! Generates PostgreSQL DDL for class tables, relation join tables, the schema
//! metadata table, indexes, and the helper functions the query compiler calls.

use crate::config::AdapterConfig;
use crate::error::Result;
use crate::sql::sanitize::quote_identifier;
use crate::types::{ClassSchema, FieldType, native_column_type};

/// DDL generator for class tables
pub struct DdlGenerator<'a> {
    config: &'a AdapterConfig,
}

impl<'a> DdlGenerator<'a> {
    /// Create a new DDL generator with the given configuration
    pub fn new(config: &'a AdapterConfig) -> Self {
        Self { config }
    }

    /// Generate the metadata table holding one schema document per class
    pub fn generate_schema_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"className\" varChar(120), \"schema\" jsonb, \"isParseClass\" bool, PRIMARY KEY (\"className\"))",
            quote_identifier(&self.config.schema_table)
        )
    }

    /// Generate CREATE TABLE for a class
    ///
    /// Columns come from the storage form of the schema, so permission
    /// columns and the `_User` auth columns are always present. Relation
    /// fields get no column; see [`Self::generate_join_table`].
    pub fn generate_create_table(&self, schema: &ClassSchema) -> Result<String> {
        let storage = schema.to_storage();
        let mut column_defs = Vec::new();
        for (name, field) in &storage.fields {
            if field.field_type.is_relation() {
                continue;
            }
            column_defs.push(Self::format_column_definition(name, &field.field_type)?);
            if name == "objectId" {
                column_defs.push(format!("PRIMARY KEY ({})", quote_identifier(name)));
            }
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.config.table_name(&schema.class_name)),
            column_defs.join(", ")
        ))
    }

    /// Generate the join table backing a relation field
    pub fn generate_join_table(&self, field_name: &str, class_name: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\"relatedId\" varChar(120), \"owningId\" varChar(120), PRIMARY KEY(\"relatedId\", \"owningId\"))",
            quote_identifier(&self.config.join_table_name(field_name, class_name))
        )
    }

    /// Generate ALTER TABLE ADD COLUMN for a new field
    pub fn generate_add_column(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            quote_identifier(&self.config.table_name(class_name)),
            Self::format_column_definition(field_name, field_type)?
        ))
    }

    /// Generate one ALTER TABLE dropping every listed column
    pub fn generate_drop_columns(&self, class_name: &str, field_names: &[&str]) -> String {
        let drops: Vec<String> = field_names
            .iter()
            .map(|name| format!("DROP COLUMN IF EXISTS {}", quote_identifier(name)))
            .collect();
        format!(
            "ALTER TABLE {} {}",
            quote_identifier(&self.config.table_name(class_name)),
            drops.join(", ")
        )
    }

    /// Generate DROP TABLE for a class
    pub fn generate_drop_table(&self, class_name: &str) -> String {
        Self::generate_drop_raw_table(&self.config.table_name(class_name))
    }

    /// Generate DROP TABLE for an already prefixed table name
    pub fn generate_drop_raw_table(table_name: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_identifier(table_name))
    }

    /// Generate CREATE INDEX over `fields`
    ///
    /// With `case_insensitive`, each column is indexed as
    /// `lower(col) varchar_pattern_ops` to serve case-folded lookups.
    pub fn generate_create_index(
        &self,
        class_name: &str,
        index_name: &str,
        fields: &[&str],
        case_insensitive: bool,
    ) -> String {
        let columns: Vec<String> = fields
            .iter()
            .map(|field| {
                if case_insensitive {
                    format!("lower({}) varchar_pattern_ops", quote_identifier(field))
                } else {
                    quote_identifier(field)
                }
            })
            .collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(index_name),
            quote_identifier(&self.config.table_name(class_name)),
            columns.join(", ")
        )
    }

    /// Generate a single-column index, using GiST for geometric columns
    pub fn generate_field_index(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: Option<&FieldType>,
    ) -> String {
        let table = self.config.table_name(class_name);
        let method = match field_type {
            Some(FieldType::GeoPoint | FieldType::Polygon) => " USING GIST",
            _ => "",
        };
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}{} ({})",
            quote_identifier(&format!("{}_{}_index", table, field_name)),
            quote_identifier(&table),
            method,
            quote_identifier(field_name)
        )
    }

    /// Generate CREATE UNIQUE INDEX over `fields`
    pub fn generate_unique_index(&self, class_name: &str, fields: &[&str]) -> String {
        let columns: Vec<String> = fields.iter().map(|f| quote_identifier(f)).collect();
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_identifier(&self.unique_index_name(class_name, fields)),
            quote_identifier(&self.config.table_name(class_name)),
            columns.join(", ")
        )
    }

    /// Generate DROP INDEX
    pub fn generate_drop_index(&self, index_name: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", quote_identifier(index_name))
    }

    /// `<table>_unique_<sorted fields>`
    pub fn unique_index_name(&self, class_name: &str, fields: &[&str]) -> String {
        format!(
            "{}_unique_{}",
            self.config.table_name(class_name),
            sorted_join(fields)
        )
    }

    /// `<table>_default_<sorted fields>`
    pub fn default_index_name(&self, class_name: &str, fields: &[&str]) -> String {
        format!(
            "{}_default_{}",
            self.config.table_name(class_name),
            sorted_join(fields)
        )
    }

    /// Format a single column definition for CREATE TABLE or ALTER TABLE ADD COLUMN
    pub fn format_column_definition(name: &str, field_type: &FieldType) -> Result<String> {
        Ok(format!(
            "{} {}",
            quote_identifier(name),
            native_column_type(field_type)?
        ))
    }

    /// Helper functions used by generated predicates and updates
    pub fn helper_functions() -> &'static [&'static str] {
        HELPER_FUNCTIONS
    }
}

fn sorted_join(fields: &[&str]) -> String {
    let mut sorted = fields.to_vec();
    sorted.sort_unstable();
    sorted.join("_")
}

const HELPER_FUNCTIONS: &[&str] = &[
    r#"CREATE OR REPLACE FUNCTION "json_object_set_key"("json" jsonb, "key_to_set" text, "value_to_set" anyelement)
RETURNS jsonb LANGUAGE sql IMMUTABLE AS $function$
SELECT COALESCE("json", '{}'::jsonb) || jsonb_build_object("key_to_set", to_jsonb("value_to_set"))
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_add"("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT "array" || "values"
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_add_unique"("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT "array" || COALESCE((
  SELECT jsonb_agg(v ORDER BY o) FROM (
    SELECT v, min(o) AS o FROM jsonb_array_elements("values") WITH ORDINALITY AS t(v, o)
    WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements("array") e WHERE e = v)
    GROUP BY v
  ) fresh
), '[]'::jsonb)
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_remove"("array" jsonb, "values" jsonb)
RETURNS jsonb LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT COALESCE(jsonb_agg(e ORDER BY o), '[]'::jsonb)
FROM jsonb_array_elements("array") WITH ORDINALITY AS t(e, o)
WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements("values") v WHERE v = e)
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_contains"("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT EXISTS (
  SELECT 1 FROM jsonb_array_elements("array") e
  WHERE e IN (SELECT jsonb_array_elements("values"))
)
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_contains_all"("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT jsonb_array_length("values") > 0 AND NOT EXISTS (
  SELECT 1 FROM jsonb_array_elements("values") v
  WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements("array") e WHERE e = v)
)
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "array_contains_all_regex"("array" jsonb, "values" jsonb)
RETURNS boolean LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT jsonb_array_length("values") > 0 AND NOT EXISTS (
  SELECT 1 FROM jsonb_array_elements_text("values") p
  WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements_text("array") e WHERE e LIKE p)
)
$function$"#,
    r#"CREATE OR REPLACE FUNCTION "great_circle_distance"("a" point, "b" point)
RETURNS double precision LANGUAGE sql IMMUTABLE STRICT AS $function$
SELECT 2 * 6371000 * asin(sqrt(
  power(sin(radians(("b")[1] - ("a")[1]) / 2), 2)
  + cos(radians(("a")[1])) * cos(radians(("b")[1]))
  * power(sin(radians(("b")[0] - ("a")[0]) / 2), 2)
))
$function$"#,
];
