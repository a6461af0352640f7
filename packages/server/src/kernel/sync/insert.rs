//! Row-batch INSERT transfer strategy.
//!
//! Streams the extraction query, accumulates rows into batches and writes
//! them with conflict handling:
//!
//! - ERROR:   plain multi-row insert, any conflict aborts the batch
//! - IGNORE:  `INSERT ... ON CONFLICT DO NOTHING`
//! - REPLACE: upsert on the destination primary key (degrades to IGNORE
//!            with a warning when the table has no PK)
//! - SKIP:    row-at-a-time inserts counting skipped conflicts
//!
//! Values are bound as text with explicit casts derived from the
//! destination catalog, so encoding follows the destination column types.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::domains::jobs::ConflictStrategy;

use super::error::SyncError;
use super::query::SyncPlan;
use super::transfer::{
    prepare_destination, report_table_progress, CancelProbe, DataTransfer, ProgressReporter,
    TableSync, WatermarkTracker,
};
use super::value::{decode_row, encode_for_column, SqlValue};

/// PostgreSQL parameter slots are a u16; chunk multi-row statements under
/// this many binds.
const MAX_BIND_PARAMS: usize = 65_535;

const UNIQUE_VIOLATION: &str = "23505";
const EXCLUSION_VIOLATION: &str = "23P01";

pub struct InsertTransfer;

#[async_trait]
impl DataTransfer for InsertTransfer {
    async fn sync_table(
        &self,
        ctx: &TableSync<'_>,
        plan: &SyncPlan,
        progress: &ProgressReporter,
        cancel: &CancelProbe,
    ) -> Result<u64, SyncError> {
        prepare_destination(ctx).await?;

        let mut inserter = BatchInserter::prepare(ctx).await?;
        let mut watermark = WatermarkTracker::new(plan.incremental_field.clone());

        let mut stream = sqlx::query(&plan.sql).fetch(ctx.source);
        let mut columns: Vec<String> = Vec::new();
        let mut batch: Vec<Vec<(String, SqlValue)>> = Vec::new();
        let mut written: u64 = 0;

        while let Some(row) = stream.try_next().await.map_err(|e| SyncError::Transfer {
            table: ctx.qualified_name(),
            message: format!("source read failed: {e}"),
        })? {
            let decoded = decode_row(&row);
            if columns.is_empty() {
                columns = decoded.iter().map(|(name, _)| name.clone()).collect();
            }
            watermark.observe(&decoded);
            batch.push(decoded);

            if batch.len() >= ctx.settings.batch_size {
                cancel.check().await?;
                written += inserter.write(ctx, &columns, &batch).await?;
                report_table_progress(progress, written).await;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            cancel.check().await?;
            written += inserter.write(ctx, &columns, &batch).await?;
            report_table_progress(progress, written).await;
        }

        watermark.persist(ctx).await?;

        if inserter.skipped > 0 {
            info!(
                table = %ctx.qualified_name(),
                inserted = written,
                skipped = inserter.skipped,
                "insert transfer finished with skipped conflicts"
            );
        }
        Ok(written)
    }
}

/// Conflict clause of the generated statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConflictClause {
    Abort,
    DoNothing,
    Upsert(Vec<String>),
}

impl ConflictClause {
    fn render(&self, columns: &[String]) -> String {
        match self {
            ConflictClause::Abort => String::new(),
            ConflictClause::DoNothing => " ON CONFLICT DO NOTHING".to_string(),
            ConflictClause::Upsert(pk) => {
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !pk.contains(*c))
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect();
                if updates.is_empty() {
                    // Every column is part of the key; nothing to update.
                    return " ON CONFLICT DO NOTHING".to_string();
                }
                format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    pk.join(", "),
                    updates.join(", ")
                )
            }
        }
    }
}

/// Batch writer shared by the INSERT strategy and the COPY fallback path.
pub(crate) struct BatchInserter {
    strategy: ConflictStrategy,
    conflict: ConflictClause,
    pub(crate) skipped: u64,
}

impl BatchInserter {
    /// Resolve the conflict clause, discovering the destination PK for
    /// REPLACE and degrading to IGNORE when there is none.
    pub(crate) async fn prepare(ctx: &TableSync<'_>) -> Result<Self, SyncError> {
        let strategy = ctx.job.conflict_strategy;
        let conflict = match strategy {
            ConflictStrategy::Error | ConflictStrategy::Skip => ConflictClause::Abort,
            ConflictStrategy::Ignore => ConflictClause::DoNothing,
            ConflictStrategy::Replace => {
                let pk = destination_primary_keys(
                    ctx.dest,
                    &ctx.table.schema_name,
                    &ctx.table.table_name,
                )
                .await?;
                if pk.is_empty() {
                    warn!(
                        table = %ctx.qualified_name(),
                        "replace strategy requires a primary key, degrading to ignore"
                    );
                    ConflictClause::DoNothing
                } else {
                    ConflictClause::Upsert(pk)
                }
            }
        };
        Ok(Self {
            strategy,
            conflict,
            skipped: 0,
        })
    }

    /// Write one batch; returns rows actually inserted or updated.
    pub(crate) async fn write(
        &mut self,
        ctx: &TableSync<'_>,
        columns: &[String],
        batch: &[Vec<(String, SqlValue)>],
    ) -> Result<u64, SyncError> {
        if batch.is_empty() {
            return Ok(0);
        }
        if self.strategy == ConflictStrategy::Skip {
            return self.write_row_at_a_time(ctx, columns, batch).await;
        }

        let casts = column_casts(ctx, columns);
        let rows_per_stmt = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        let mut written = 0u64;

        let mut tx = ctx.dest.begin().await.map_err(|e| SyncError::Transfer {
            table: ctx.qualified_name(),
            message: e.to_string(),
        })?;

        for chunk in batch.chunks(rows_per_stmt) {
            let sql = multi_row_insert_sql(
                &ctx.qualified_name(),
                columns,
                &casts,
                chunk.len(),
                &self.conflict,
            );
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for (idx, column) in columns.iter().enumerate() {
                    query = query.bind(encode_cell(ctx, row, idx, column));
                }
            }
            let result = query
                .execute(&mut *tx)
                .await
                .map_err(|e| self.classify(ctx, e))?;
            written += result.rows_affected();
        }

        tx.commit().await.map_err(|e| SyncError::Transfer {
            table: ctx.qualified_name(),
            message: e.to_string(),
        })?;
        Ok(written)
    }

    /// SKIP path: one row per statement, deliberately slow, counting
    /// conflicts instead of failing.
    async fn write_row_at_a_time(
        &mut self,
        ctx: &TableSync<'_>,
        columns: &[String],
        batch: &[Vec<(String, SqlValue)>],
    ) -> Result<u64, SyncError> {
        let casts = column_casts(ctx, columns);
        let sql = multi_row_insert_sql(
            &ctx.qualified_name(),
            columns,
            &casts,
            1,
            &ConflictClause::Abort,
        );
        let mut written = 0u64;

        for row in batch {
            let mut query = sqlx::query(&sql);
            for (idx, column) in columns.iter().enumerate() {
                query = query.bind(encode_cell(ctx, row, idx, column));
            }
            match query.execute(ctx.dest).await {
                Ok(_) => written += 1,
                Err(e) if is_conflict(&e) => {
                    self.skipped += 1;
                    debug!(table = %ctx.qualified_name(), error = %e, "skipped conflicted record");
                }
                Err(e) => {
                    return Err(SyncError::Transfer {
                        table: ctx.qualified_name(),
                        message: format!("row insert failed: {e}"),
                    })
                }
            }
        }
        Ok(written)
    }

    fn classify(&self, ctx: &TableSync<'_>, e: sqlx::Error) -> SyncError {
        if self.strategy == ConflictStrategy::Error && is_conflict(&e) {
            SyncError::Conflict {
                table: ctx.qualified_name(),
                message: e.to_string(),
            }
        } else {
            SyncError::Transfer {
                table: ctx.qualified_name(),
                message: format!("batch insert failed: {e}"),
            }
        }
    }
}

fn encode_cell(
    ctx: &TableSync<'_>,
    row: &[(String, SqlValue)],
    idx: usize,
    column: &str,
) -> Option<String> {
    let value = row
        .get(idx)
        .map(|(_, v)| v)
        .unwrap_or(&SqlValue::Null);
    match ctx.dest_column(column) {
        Some(col) => encode_for_column(value, col),
        None => value.to_text(),
    }
}

/// Cast targets per column; columns unknown to the destination fall back to
/// text and fail naturally on insert.
fn column_casts(ctx: &TableSync<'_>, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            ctx.dest_column(c)
                .map(|col| col.cast_type())
                .unwrap_or_else(|| "text".to_string())
        })
        .collect()
}

fn is_conflict(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION || code == EXCLUSION_VIOLATION)
        .unwrap_or(false)
}

/// `INSERT INTO t (a, b) VALUES ($1::int8, $2::text), ($3::int8, $4::text)`
fn multi_row_insert_sql(
    table: &str,
    columns: &[String],
    casts: &[String],
    rows: usize,
    conflict: &ConflictClause,
) -> String {
    let mut values = Vec::with_capacity(rows);
    let mut placeholder = 1usize;
    for _ in 0..rows {
        let row: Vec<String> = casts
            .iter()
            .map(|cast| {
                let p = format!("${placeholder}::{cast}");
                placeholder += 1;
                p
            })
            .collect();
        values.push(format!("({})", row.join(", ")));
    }

    format!(
        "INSERT INTO {table} ({}) VALUES {}{}",
        columns.join(", "),
        values.join(", "),
        conflict.render(columns)
    )
}

/// Primary-key columns of the destination table, in key order.
pub(crate) async fn destination_primary_keys(
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

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn renders_plain_multi_row_insert() {
        let sql = multi_row_insert_sql(
            "public.t",
            &cols(&["name", "n"]),
            &cols(&["text", "int4"]),
            2,
            &ConflictClause::Abort,
        );
        assert_eq!(
            sql,
            "INSERT INTO public.t (name, n) VALUES ($1::text, $2::int4), ($3::text, $4::int4)"
        );
    }

    #[test]
    fn renders_do_nothing_clause() {
        let sql = multi_row_insert_sql(
            "public.t",
            &cols(&["id"]),
            &cols(&["int8"]),
            1,
            &ConflictClause::DoNothing,
        );
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn renders_upsert_excluding_key_columns() {
        let sql = multi_row_insert_sql(
            "public.t",
            &cols(&["id", "name", "n"]),
            &cols(&["int8", "text", "int4"]),
            1,
            &ConflictClause::Upsert(cols(&["id"])),
        );
        assert!(sql.ends_with(
            "ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, n = EXCLUDED.n"
        ));
    }

    #[test]
    fn upsert_of_key_only_table_degrades_to_do_nothing() {
        let clause = ConflictClause::Upsert(cols(&["id"]));
        assert_eq!(clause.render(&cols(&["id"])), " ON CONFLICT DO NOTHING");
    }

    #[test]
    fn composite_keys_render_in_order() {
        let clause = ConflictClause::Upsert(cols(&["tenant_id", "id"]));
        let rendered = clause.render(&cols(&["tenant_id", "id", "payload"]));
        assert_eq!(
            rendered,
            " ON CONFLICT (tenant_id, id) DO UPDATE SET payload = EXCLUDED.payload"
        );
    }
}
