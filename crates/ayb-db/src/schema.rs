//! Introspection snapshot of the user-visible database schema.
//!
//! The cache is copy-on-refresh: readers grab an `Arc` to the current
//! snapshot and keep using it even while a refresh swaps the pointer.
//! Internal tables (`_ayb_*`, `_sqlx_*`) never appear in a snapshot.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::error::DbError;

/// PostgreSQL type classification used for parameter casts and search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PgType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Uuid,
    Timestamp,
    Timestamptz,
    Date,
    Time,
    Json,
    Jsonb,
    Bytea,
    Other(String),
}

impl PgType {
    pub fn from_udt(udt: &str) -> Self {
        match udt {
            "bool" => PgType::Bool,
            "int2" => PgType::Int2,
            "int4" => PgType::Int4,
            "int8" => PgType::Int8,
            "float4" => PgType::Float4,
            "float8" => PgType::Float8,
            "numeric" => PgType::Numeric,
            "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => PgType::Text,
            "uuid" => PgType::Uuid,
            "timestamp" => PgType::Timestamp,
            "timestamptz" => PgType::Timestamptz,
            "date" => PgType::Date,
            "time" | "timetz" => PgType::Time,
            "json" => PgType::Json,
            "jsonb" => PgType::Jsonb,
            "bytea" => PgType::Bytea,
            other => PgType::Other(other.to_owned()),
        }
    }

    /// Cast target appended to bound parameters (`$1::uuid`).
    pub fn cast_name(&self) -> &str {
        match self {
            PgType::Bool => "bool",
            PgType::Int2 => "int2",
            PgType::Int4 => "int4",
            PgType::Int8 => "int8",
            PgType::Float4 => "float4",
            PgType::Float8 => "float8",
            PgType::Numeric => "numeric",
            PgType::Text => "text",
            PgType::Uuid => "uuid",
            PgType::Timestamp => "timestamp",
            PgType::Timestamptz => "timestamptz",
            PgType::Date => "date",
            PgType::Time => "time",
            PgType::Json => "json",
            PgType::Jsonb => "jsonb",
            PgType::Bytea => "bytea",
            PgType::Other(name) => name,
        }
    }

    /// Columns included in the `?search=` tsvector.
    pub fn is_searchable_text(&self) -> bool {
        matches!(self, PgType::Text)
    }

    pub fn is_json(&self) -> bool {
        matches!(self, PgType::Json | PgType::Jsonb)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub pg_type: PgType,
    pub nullable: bool,
    pub has_default: bool,
    pub ordinal: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct UniqueIndex {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub is_view: bool,
    pub rls_enabled: bool,
    pub columns: Vec<ColumnDescriptor>,
    /// Single-column primary key; `None` for views and multi-column keys.
    pub primary_key: Option<String>,
    pub unique_indexes: Vec<UniqueIndex>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDescriptor {
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Identifier-quoted `"schema"."table"` for SQL interpolation.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchemaSnapshot {
    /// Keyed by `schema.table`.
    pub tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaSnapshot {
    /// Resolves `name` either as `schema.table` or as a bare table name in
    /// `public`.
    pub fn resolve(&self, name: &str) -> Option<&TableDescriptor> {
        if name.contains('.') {
            self.tables.get(name)
        } else {
            self.tables.get(&format!("public.{name}"))
        }
    }
}

pub struct SchemaCache {
    pool: PgPool,
    snapshot: RwLock<Arc<SchemaSnapshot>>,
}

impl SchemaCache {
    pub async fn load(pool: PgPool) -> Result<Self, DbError> {
        let snapshot = introspect(&pool).await?;
        Ok(Self {
            pool,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.read().clone()
    }

    pub async fn refresh(&self) -> Result<(), DbError> {
        let fresh = introspect(&self.pool).await?;
        *self.snapshot.write() = Arc::new(fresh);
        Ok(())
    }
}

fn hidden(name: &str) -> bool {
    name.starts_with("_ayb_") || name.starts_with("_sqlx_")
}

async fn introspect(pool: &PgPool) -> Result<SchemaSnapshot, DbError> {
    let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();

    let relations = sqlx::query(
        r#"
        SELECT n.nspname AS schema,
               c.relname AS name,
               c.relkind::text AS relkind,
               c.relrowsecurity AS rls_enabled
        FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relkind IN ('r', 'p', 'v', 'm')
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
        ORDER BY n.nspname, c.relname
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in relations {
        let schema: String = row.try_get("schema").map_err(DbError::from)?;
        let name: String = row.try_get("name").map_err(DbError::from)?;
        if hidden(&name) {
            continue;
        }
        let relkind: String = row.try_get("relkind").map_err(DbError::from)?;
        let rls_enabled: bool = row.try_get("rls_enabled").map_err(DbError::from)?;
        let descriptor = TableDescriptor {
            schema: schema.clone(),
            name: name.clone(),
            is_view: matches!(relkind.as_str(), "v" | "m"),
            rls_enabled,
            columns: Vec::new(),
            primary_key: None,
            unique_indexes: Vec::new(),
            foreign_keys: Vec::new(),
        };
        tables.insert(format!("{schema}.{name}"), descriptor);
    }

    let columns = sqlx::query(
        r#"
        SELECT table_schema, table_name, column_name, udt_name,
               is_nullable = 'YES' AS nullable,
               column_default IS NOT NULL AS has_default,
               ordinal_position::int4 AS ordinal
        FROM information_schema.columns
        WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
        ORDER BY table_schema, table_name, ordinal_position
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in columns {
        let schema: String = row.try_get("table_schema").map_err(DbError::from)?;
        let table: String = row.try_get("table_name").map_err(DbError::from)?;
        let Some(descriptor) = tables.get_mut(&format!("{schema}.{table}")) else {
            continue;
        };
        descriptor.columns.push(ColumnDescriptor {
            name: row.try_get("column_name").map_err(DbError::from)?,
            pg_type: PgType::from_udt(row.try_get::<String, _>("udt_name").map_err(DbError::from)?.as_str()),
            nullable: row.try_get("nullable").map_err(DbError::from)?,
            has_default: row.try_get("has_default").map_err(DbError::from)?,
            ordinal: row.try_get("ordinal").map_err(DbError::from)?,
        });
    }

    let pk_columns = sqlx::query(
        r#"
        SELECT n.nspname AS schema, c.relname AS table, a.attname AS column
        FROM pg_catalog.pg_index i
        JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_catalog.pg_attribute a
          ON a.attrelid = c.oid AND a.attnum = ANY (i.indkey)
        WHERE i.indisprimary
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut pk_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in pk_columns {
        let schema: String = row.try_get("schema").map_err(DbError::from)?;
        let table: String = row.try_get("table").map_err(DbError::from)?;
        let column: String = row.try_get("column").map_err(DbError::from)?;
        pk_map.entry(format!("{schema}.{table}")).or_default().push(column);
    }
    for (key, cols) in pk_map {
        if let Some(descriptor) = tables.get_mut(&key) {
            // Collections item routes only support single-column keys.
            if cols.len() == 1 {
                descriptor.primary_key = Some(cols.into_iter().next().unwrap_or_default());
            }
        }
    }

    let unique_columns = sqlx::query(
        r#"
        SELECT n.nspname AS schema, t.relname AS table,
               ic.relname AS index, a.attname AS column
        FROM pg_catalog.pg_index i
        JOIN pg_catalog.pg_class t ON t.oid = i.indrelid
        JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_catalog.pg_attribute a
          ON a.attrelid = t.oid AND a.attnum = ANY (i.indkey)
        WHERE i.indisunique AND NOT i.indisprimary
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
        ORDER BY ic.relname
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut index_map: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for row in unique_columns {
        let schema: String = row.try_get("schema").map_err(DbError::from)?;
        let table: String = row.try_get("table").map_err(DbError::from)?;
        let index: String = row.try_get("index").map_err(DbError::from)?;
        let column: String = row.try_get("column").map_err(DbError::from)?;
        index_map
            .entry((format!("{schema}.{table}"), index))
            .or_default()
            .push(column);
    }
    for ((table_key, index), columns) in index_map {
        if let Some(descriptor) = tables.get_mut(&table_key) {
            descriptor.unique_indexes.push(UniqueIndex { name: index, columns });
        }
    }

    let fks = sqlx::query(
        r#"
        SELECT n.nspname AS schema, c.relname AS table,
               a.attname AS column,
               fn.nspname AS ref_schema, fc.relname AS ref_table,
               fa.attname AS ref_column,
               cardinality(ct.conkey) AS key_width
        FROM pg_catalog.pg_constraint ct
        JOIN pg_catalog.pg_class c ON c.oid = ct.conrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_catalog.pg_class fc ON fc.oid = ct.confrelid
        JOIN pg_catalog.pg_namespace fn ON fn.oid = fc.relnamespace
        JOIN pg_catalog.pg_attribute a
          ON a.attrelid = c.oid AND a.attnum = ct.conkey[1]
        JOIN pg_catalog.pg_attribute fa
          ON fa.attrelid = fc.oid AND fa.attnum = ct.confkey[1]
        WHERE ct.contype = 'f'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in fks {
        let key_width: i32 = row.try_get("key_width").map_err(DbError::from)?;
        // Expand follows single-column foreign keys only.
        if key_width != 1 {
            continue;
        }
        let schema: String = row.try_get("schema").map_err(DbError::from)?;
        let table: String = row.try_get("table").map_err(DbError::from)?;
        let ref_schema: String = row.try_get("ref_schema").map_err(DbError::from)?;
        let ref_table: String = row.try_get("ref_table").map_err(DbError::from)?;
        if hidden(&ref_table) {
            continue;
        }
        if let Some(descriptor) = tables.get_mut(&format!("{schema}.{table}")) {
            descriptor.foreign_keys.push(ForeignKey {
                column: row.try_get("column").map_err(DbError::from)?,
                references_table: format!("{ref_schema}.{ref_table}"),
                references_column: row.try_get("ref_column").map_err(DbError::from)?,
            });
        }
    }

    Ok(SchemaSnapshot { tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: &str, name: &str, pk: Option<&str>) -> TableDescriptor {
        TableDescriptor {
            schema: schema.into(),
            name: name.into(),
            is_view: false,
            rls_enabled: false,
            columns: vec![],
            primary_key: pk.map(str::to_owned),
            unique_indexes: vec![],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn resolve_bare_names_against_public() {
        let mut tables = BTreeMap::new();
        tables.insert("public.posts".to_string(), table("public", "posts", Some("id")));
        tables.insert("app.posts".to_string(), table("app", "posts", Some("id")));
        let snapshot = SchemaSnapshot { tables };

        assert_eq!(snapshot.resolve("posts").unwrap().schema, "public");
        assert_eq!(snapshot.resolve("app.posts").unwrap().schema, "app");
        assert!(snapshot.resolve("missing").is_none());
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn internal_tables_are_hidden() {
        assert!(hidden("_ayb_users"));
        assert!(hidden("_sqlx_migrations"));
        assert!(!hidden("users"));
    }

    #[test]
    fn type_classification_covers_aliases() {
        assert_eq!(PgType::from_udt("varchar"), PgType::Text);
        assert_eq!(PgType::from_udt("int8"), PgType::Int8);
        assert!(PgType::from_udt("jsonb").is_json());
        assert!(PgType::from_udt("text").is_searchable_text());
        assert!(!PgType::from_udt("int4").is_searchable_text());
        assert_eq!(PgType::from_udt("vector").cast_name(), "vector");
    }
}
