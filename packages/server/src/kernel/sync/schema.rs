//! Structure replication for a single table.
//!
//! Given source and destination pools, reproduces the source table in the
//! destination when it does not exist yet: sequences backing column
//! defaults, columns, the primary-key constraint, the table itself, and the
//! source's secondary indexes. Existing destination tables are left
//! untouched; the engine never alters them.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use sqlx::PgPool;
use tracing::{info, warn};

use super::error::SyncError;

/// Introspected source column.
#[derive(Debug, Clone)]
struct SourceColumn {
    name: String,
    data_type: String,
    udt_name: String,
    nullable: bool,
    default: Option<String>,
    char_max_length: Option<i32>,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
}

#[derive(Debug, Clone)]
struct SourceIndex {
    name: String,
    unique: bool,
    columns: Vec<String>,
}

pub struct SchemaReplicator<'a> {
    source: &'a PgPool,
    dest: &'a PgPool,
}

impl<'a> SchemaReplicator<'a> {
    pub fn new(source: &'a PgPool, dest: &'a PgPool) -> Self {
        Self { source, dest }
    }

    /// Replicate `schema.table` into the destination. Idempotent: an
    /// existing destination table short-circuits with success.
    pub async fn replicate(&self, schema: &str, table: &str) -> Result<(), SyncError> {
        if table_exists(self.dest, schema, table).await? {
            info!(table = %format!("{schema}.{table}"), "destination table already exists");
            return Ok(());
        }

        if !table_exists(self.source, schema, table).await? {
            return Err(SyncError::SourceMissing {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }

        let columns = load_columns(self.source, schema, table).await?;
        let pk_columns = load_primary_key(self.source, schema, table).await?;
        let indexes = load_indexes(self.source, schema, table).await?;

        self.create_structure(schema, table, &columns, &pk_columns, &indexes)
            .await
            .map_err(|e| SyncError::Schema {
                schema: schema.to_string(),
                table: table.to_string(),
                message: e.to_string(),
            })
    }

    /// Sequences, table and indexes in one destination transaction;
    /// individual sequence/index failures roll back to a savepoint so they
    /// stay warnings instead of poisoning the transaction.
    async fn create_structure(
        &self,
        schema: &str,
        table: &str,
        columns: &[SourceColumn],
        pk_columns: &[String],
        indexes: &[SourceIndex],
    ) -> anyhow::Result<()> {
        let mut tx = self.dest.begin().await?;

        let mut failed_sequences: HashSet<String> = HashSet::new();
        for col in columns {
            let Some(default) = col.default.as_deref() else {
                continue;
            };
            if !default.to_lowercase().contains("nextval") {
                continue;
            }

            let (seq_schema, seq_name) = sequence_name(default, schema, table, &col.name);

            let exists: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM information_schema.sequences
                    WHERE sequence_schema = $1 AND sequence_name = $2
                )
                "#,
            )
            .bind(&seq_schema)
            .bind(&seq_name)
            .fetch_one(&mut *tx)
            .await?;

            if exists {
                continue;
            }

            sqlx::query("SAVEPOINT create_seq").execute(&mut *tx).await?;
            match sqlx::query(&format!("CREATE SEQUENCE {seq_schema}.{seq_name}"))
                .execute(&mut *tx)
                .await
            {
                Ok(_) => {
                    info!(sequence = %format!("{seq_schema}.{seq_name}"), "sequence created");
                    sqlx::query("RELEASE SAVEPOINT create_seq")
                        .execute(&mut *tx)
                        .await?;
                }
                Err(e) => {
                    warn!(
                        column = %col.name,
                        sequence = %format!("{seq_schema}.{seq_name}"),
                        error = %e,
                        "sequence creation failed, column falls back to BIGSERIAL"
                    );
                    sqlx::query("ROLLBACK TO SAVEPOINT create_seq")
                        .execute(&mut *tx)
                        .await?;
                    failed_sequences.insert(col.name.clone());
                }
            }
        }

        let ddl = render_create_table(schema, table, columns, pk_columns, &failed_sequences);
        sqlx::query(&ddl).execute(&mut *tx).await?;
        info!(table = %format!("{schema}.{table}"), "destination table created");

        let column_types: BTreeMap<&str, String> = columns
            .iter()
            .map(|c| (c.name.as_str(), display_type(c)))
            .collect();

        for index in indexes {
            let types: Vec<String> = index
                .columns
                .iter()
                .filter_map(|c| column_types.get(c.as_str()).cloned())
                .collect();

            if types
                .iter()
                .any(|t| t.contains("unknown") || t.contains("void"))
            {
                warn!(index = %index.name, ?types, "skipping index on unindexable column types");
                continue;
            }

            let index_name = if index.name.starts_with(table) {
                index.name.clone()
            } else {
                format!("{table}_{}", index.name)
            };
            let unique = if index.unique { "UNIQUE " } else { "" };
            let method = if should_use_gin(&types) { "gin" } else { "btree" };
            let sql = format!(
                "CREATE {unique}INDEX IF NOT EXISTS {index_name} ON {schema}.{table} USING {method} ({})",
                index.columns.join(", ")
            );

            sqlx::query("SAVEPOINT create_idx").execute(&mut *tx).await?;
            match sqlx::query(&sql).execute(&mut *tx).await {
                Ok(_) => {
                    info!(index = %index_name, method, "index created");
                    sqlx::query("RELEASE SAVEPOINT create_idx")
                        .execute(&mut *tx)
                        .await?;
                }
                Err(e) => {
                    warn!(index = %index_name, error = %e, "index creation failed");
                    sqlx::query("ROLLBACK TO SAVEPOINT create_idx")
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn table_exists(pool: &PgPool, schema: &str, table: &str) -> Result<bool, SyncError> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        )
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

async fn load_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<SourceColumn>, SyncError> {
    let rows: Vec<(String, String, String, String, Option<String>, Option<i32>, Option<i32>, Option<i32>)> =
        sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, udt_name::text, is_nullable::text,
                   column_default::text, character_maximum_length::int4,
                   numeric_precision::int4, numeric_scale::int4
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(name, data_type, udt_name, is_nullable, default, len, prec, scale)| SourceColumn {
                name,
                data_type,
                udt_name,
                nullable: is_nullable == "YES",
                default,
                char_max_length: len,
                numeric_precision: prec,
                numeric_scale: scale,
            },
        )
        .collect())
}

async fn load_primary_key(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<String>, SyncError> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT kcu.column_name::text
        FROM information_schema.key_column_usage kcu
        JOIN information_schema.table_constraints tc
          ON kcu.constraint_name = tc.constraint_name
         AND kcu.table_schema = tc.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND kcu.table_schema = $1
          AND kcu.table_name = $2
        ORDER BY kcu.ordinal_position
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await?;
    Ok(columns)
}

async fn load_indexes(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<SourceIndex>, SyncError> {
    let rows: Vec<(String, bool, String)> = sqlx::query_as(
        r#"
        SELECT i.relname::text AS index_name,
               ix.indisunique AS is_unique,
               a.attname::text AS column_name
        FROM pg_class t
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_index ix ON ix.indrelid = t.oid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY (ix.indkey)
        WHERE n.nspname = $1
          AND t.relname = $2
          AND NOT ix.indisprimary
        ORDER BY i.relname, array_position(ix.indkey, a.attnum)
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await?;

    let mut grouped: BTreeMap<String, SourceIndex> = BTreeMap::new();
    for (name, unique, column) in rows {
        grouped
            .entry(name.clone())
            .or_insert_with(|| SourceIndex {
                name,
                unique,
                columns: Vec::new(),
            })
            .columns
            .push(column);
    }
    Ok(grouped.into_values().collect())
}

// ============================================================================
// DDL rendering
// ============================================================================

fn render_create_table(
    schema: &str,
    table: &str,
    columns: &[SourceColumn],
    pk_columns: &[String],
    failed_sequences: &HashSet<String>,
) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|col| render_column(col, schema, table, failed_sequences))
        .collect();

    if !pk_columns.is_empty() {
        parts.push(format!(
            "CONSTRAINT {table}_pkey PRIMARY KEY ({})",
            pk_columns.join(", ")
        ));
    }

    format!(
        "CREATE TABLE {schema}.{table} (\n    {}\n)",
        parts.join(",\n    ")
    )
}

fn render_column(
    col: &SourceColumn,
    schema: &str,
    table: &str,
    failed_sequences: &HashSet<String>,
) -> String {
    // A column whose backing sequence could not be created becomes a plain
    // 64-bit auto-increment column with the original default dropped.
    if failed_sequences.contains(&col.name) {
        return format!("{} BIGSERIAL", col.name);
    }

    let mut sql = format!("{} {}", col.name, render_type(col));
    if !col.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        if default.to_lowercase().contains("nextval") {
            // Rewrite the generator to reference the destination-local
            // sequence in canonical, unquoted form.
            let (seq_schema, seq_name) = sequence_name(default, schema, table, &col.name);
            sql.push_str(&format!(
                " DEFAULT nextval('{seq_schema}.{seq_name}'::regclass)"
            ));
        } else {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
    }
    sql
}

fn render_type(col: &SourceColumn) -> String {
    match col.data_type.as_str() {
        "ARRAY" => format!(
            "{}[]",
            col.udt_name.strip_prefix('_').unwrap_or(&col.udt_name)
        ),
        "USER-DEFINED" => col.udt_name.clone(),
        "character varying" => match col.char_max_length {
            Some(len) => format!("varchar({len})"),
            None => "varchar".to_string(),
        },
        "character" => match col.char_max_length {
            Some(len) => format!("char({len})"),
            None => "char".to_string(),
        },
        "numeric" => match (col.numeric_precision, col.numeric_scale) {
            (Some(p), Some(s)) => format!("numeric({p},{s})"),
            _ => "numeric".to_string(),
        },
        other => other.to_string(),
    }
}

/// Index-type column rendering used by the GIN heuristic.
fn display_type(col: &SourceColumn) -> String {
    render_type(col).to_lowercase()
}

/// Inverted indexes for container-ish column types, B-tree otherwise.
fn should_use_gin(column_types: &[String]) -> bool {
    column_types.iter().any(|t| {
        t.contains("[]")
            || t.contains("array")
            || t.contains("json")
            || t.contains("tsvector")
            || t.contains("tsquery")
    })
}

// ============================================================================
// Sequence-name extraction
// ============================================================================

/// Parse `(schema, name)` out of a `nextval(...)` default. Accepts quoted,
/// unquoted, schema-qualified and unqualified spellings; falls back to the
/// conventional `<table>_<column>_seq`.
fn sequence_name(
    default_str: &str,
    schema: &str,
    table: &str,
    column: &str,
) -> (String, String) {
    let re = Regex::new(r#"nextval\(\s*'([^']+)'"#).expect("static regex");

    if let Some(captures) = re.captures(default_str) {
        let raw = captures[1].replace('\\', "").replace('"', "");
        let trimmed = raw.trim();
        if let Some((seq_schema, seq_name)) = trimmed.split_once('.') {
            return (seq_schema.to_string(), seq_name.to_string());
        }
        return (schema.to_string(), trimmed.to_string());
    }

    (schema.to_string(), format!("{table}_{column}_seq"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str, udt: &str) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt.to_string(),
            nullable: true,
            default: None,
            char_max_length: None,
            numeric_precision: None,
            numeric_scale: None,
        }
    }

    #[test]
    fn extracts_plain_sequence_names() {
        assert_eq!(
            sequence_name("nextval('t_id_seq'::regclass)", "public", "t", "id"),
            ("public".to_string(), "t_id_seq".to_string())
        );
    }

    #[test]
    fn extracts_schema_qualified_sequence_names() {
        assert_eq!(
            sequence_name("nextval('billing.invoice_id_seq'::regclass)", "public", "t", "id"),
            ("billing".to_string(), "invoice_id_seq".to_string())
        );
    }

    #[test]
    fn strips_quotes_from_sequence_names() {
        assert_eq!(
            sequence_name(
                r#"nextval('"public"."t_id_seq"'::regclass)"#,
                "public",
                "t",
                "id"
            ),
            ("public".to_string(), "t_id_seq".to_string())
        );
    }

    #[test]
    fn falls_back_to_conventional_sequence_name() {
        assert_eq!(
            sequence_name("nextval(pg_get_serial_sequence())", "sales", "orders", "order_id"),
            ("sales".to_string(), "orders_order_id_seq".to_string())
        );
    }

    #[test]
    fn gin_selection_covers_container_types() {
        assert!(should_use_gin(&["jsonb".to_string()]));
        assert!(should_use_gin(&["text[]".to_string()]));
        assert!(should_use_gin(&["tsvector".to_string()]));
        assert!(!should_use_gin(&[
            "integer".to_string(),
            "varchar(100)".to_string()
        ]));
    }

    #[test]
    fn renders_types_from_catalog_metadata() {
        assert_eq!(render_type(&col("a", "integer", "int4")), "integer");
        assert_eq!(render_type(&col("a", "ARRAY", "_text")), "text[]");
        assert_eq!(render_type(&col("a", "USER-DEFINED", "mood")), "mood");

        let mut varchar = col("a", "character varying", "varchar");
        varchar.char_max_length = Some(100);
        assert_eq!(render_type(&varchar), "varchar(100)");

        let mut num = col("a", "numeric", "numeric");
        num.numeric_precision = Some(10);
        num.numeric_scale = Some(2);
        assert_eq!(render_type(&num), "numeric(10,2)");
    }

    #[test]
    fn create_table_ddl_includes_pk_and_bigserial_fallback() {
        let mut id = col("id", "integer", "int4");
        id.nullable = false;
        id.default = Some("nextval('public.t_id_seq'::regclass)".to_string());
        let mut name = col("name", "text", "text");
        name.nullable = false;

        let failed = HashSet::new();
        let ddl = render_create_table(
            "public",
            "t",
            &[id.clone(), name.clone()],
            &["id".to_string()],
            &failed,
        );
        assert!(ddl.starts_with("CREATE TABLE public.t ("));
        assert!(ddl.contains("id integer NOT NULL DEFAULT nextval('public.t_id_seq'::regclass)"));
        assert!(ddl.contains("name text NOT NULL"));
        assert!(ddl.contains("CONSTRAINT t_pkey PRIMARY KEY (id)"));

        let failed: HashSet<String> = ["id".to_string()].into_iter().collect();
        let ddl = render_create_table("public", "t", &[id, name], &["id".to_string()], &failed);
        assert!(ddl.contains("id BIGSERIAL"));
        assert!(!ddl.contains("nextval"));
    }
}
