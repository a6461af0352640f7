//! Extraction-query construction.
//!
//! Builds the `SELECT * FROM schema.table` statement with AND-joined
//! predicates from the table's incremental strategy, the stored watermark
//! and the job's global WHERE clause, auto-detecting the incremental field
//! when none is configured.

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;

use crate::domains::jobs::{IncrementalStrategy, SyncJob, SyncMode, TargetTable};

/// A built extraction plan for one table.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub sql: String,
    /// Field whose max value becomes the next watermark (AUTO_* only).
    pub incremental_field: Option<String>,
}

/// Resolve the incremental field and assemble the extraction SQL.
pub async fn build_sync_plan(
    job: &SyncJob,
    table: &TargetTable,
    source: &PgPool,
) -> Result<SyncPlan> {
    let incremental = job.sync_mode == SyncMode::Incremental
        && table.incremental_strategy != IncrementalStrategy::None;

    let field = if incremental {
        match table.incremental_strategy {
            IncrementalStrategy::AutoId => match configured_field(table) {
                Some(f) => Some(f),
                None => detect_id_field(source, &table.schema_name, &table.table_name).await?,
            },
            IncrementalStrategy::AutoTimestamp => match configured_field(table) {
                Some(f) => Some(f),
                None => {
                    detect_timestamp_field(source, &table.schema_name, &table.table_name).await?
                }
            },
            _ => None,
        }
    } else {
        None
    };

    if incremental
        && matches!(
            table.incremental_strategy,
            IncrementalStrategy::AutoId | IncrementalStrategy::AutoTimestamp
        )
        && field.is_none()
    {
        warn!(
            table = %table.qualified_name(),
            strategy = ?table.incremental_strategy,
            "no incremental field found, falling back to unfiltered extraction"
        );
    }

    let (conditions, order_by) = plan_conditions(
        incremental.then_some(table.incremental_strategy),
        field.as_deref(),
        watermark(table),
        table.custom_condition.as_deref(),
        job.where_condition.as_deref(),
    );

    Ok(SyncPlan {
        sql: assemble_sql(
            &table.schema_name,
            &table.table_name,
            &conditions,
            order_by.as_deref(),
        ),
        incremental_field: field,
    })
}

fn configured_field(table: &TargetTable) -> Option<String> {
    table
        .incremental_field
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}

fn watermark(table: &TargetTable) -> Option<&str> {
    table
        .last_sync_value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Pure predicate assembly; separated from field detection so it is
/// testable without a live source.
fn plan_conditions(
    strategy: Option<IncrementalStrategy>,
    field: Option<&str>,
    watermark: Option<&str>,
    custom_condition: Option<&str>,
    global_where: Option<&str>,
) -> (Vec<String>, Option<String>) {
    let mut conditions = Vec::new();
    let mut order_by = None;

    match strategy {
        Some(IncrementalStrategy::CustomCondition) => {
            match custom_condition.map(str::trim).filter(|c| !c.is_empty()) {
                Some(cond) => conditions.push(cond.to_string()),
                None => warn!("custom-condition strategy configured without a condition"),
            }
        }
        Some(IncrementalStrategy::AutoId) => {
            if let Some(field) = field {
                match watermark {
                    Some(mark) => conditions.push(format!("{field} > {}", numeric_literal(mark))),
                    None => conditions.push(format!("{field} IS NOT NULL")),
                }
                order_by = Some(field.to_string());
            }
        }
        Some(IncrementalStrategy::AutoTimestamp) => {
            if let Some(field) = field {
                match watermark {
                    Some(mark) => {
                        conditions.push(format!("{field} > '{}'", mark.replace('\'', "''")))
                    }
                    None => conditions.push(format!("{field} >= NOW() - INTERVAL '24 hours'")),
                }
                order_by = Some(field.to_string());
            }
        }
        _ => {}
    }

    if let Some(global) = global_where.map(str::trim).filter(|w| !w.is_empty()) {
        conditions.push(format!("({global})"));
    }

    (conditions, order_by)
}

fn assemble_sql(
    schema: &str,
    table: &str,
    conditions: &[String],
    order_by: Option<&str>,
) -> String {
    let mut sql = format!("SELECT * FROM {schema}.{table}");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if let Some(field) = order_by {
        sql.push_str(&format!(" ORDER BY {field}"));
    }
    sql
}

/// Numeric watermarks compare numerically; anything else is quoted.
fn numeric_literal(mark: &str) -> String {
    if mark.parse::<f64>().is_ok() {
        mark.to_string()
    } else {
        format!("'{}'", mark.replace('\'', "''"))
    }
}

const ID_CANDIDATES: [&str; 6] = ["id", "ID", "Id", "pk_id", "primary_id", "uid"];

const TIMESTAMP_CANDIDATES: [&str; 11] = [
    "updated_at",
    "created_at",
    "modified_at",
    "timestamp",
    "last_modified",
    "date_modified",
    "update_time",
    "create_time",
    "last_update",
    "date_created",
    "date_updated",
];

/// Best integer id column of a table, favouring `id` spellings and then
/// `%_id` / `id_%` names.
pub async fn detect_id_field(
    source: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Option<String>> {
    let field: Option<String> = sqlx::query_scalar(
        r#"
        SELECT column_name::text
        FROM information_schema.columns
        WHERE table_schema = $1
          AND table_name = $2
          AND (column_name::text = ANY($3)
               OR column_name LIKE '%_id'
               OR column_name LIKE 'id_%')
          AND data_type IN ('integer', 'bigint', 'smallint')
        ORDER BY
            CASE column_name::text
                WHEN 'id' THEN 1
                WHEN 'ID' THEN 2
                WHEN 'Id' THEN 3
                ELSE 4
            END,
            ordinal_position
        LIMIT 1
        "#,
    )
    .bind(schema)
    .bind(table)
    .bind(ID_CANDIDATES.map(String::from).to_vec())
    .fetch_optional(source)
    .await?;
    Ok(field)
}

/// Best timestamp column of a table, favouring `updated_at`-style names and
/// then `%_at` / `%_time` / `date_%` names.
pub async fn detect_timestamp_field(
    source: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Option<String>> {
    let field: Option<String> = sqlx::query_scalar(
        r#"
        SELECT column_name::text
        FROM information_schema.columns
        WHERE table_schema = $1
          AND table_name = $2
          AND (column_name::text = ANY($3)
               OR column_name LIKE '%_at'
               OR column_name LIKE '%_time'
               OR column_name LIKE 'date_%')
          AND data_type IN ('timestamp without time zone', 'timestamp with time zone')
        ORDER BY
            CASE column_name::text
                WHEN 'updated_at' THEN 1
                WHEN 'created_at' THEN 2
                WHEN 'modified_at' THEN 3
                WHEN 'timestamp' THEN 4
                ELSE 5
            END,
            ordinal_position
        LIMIT 1
        "#,
    )
    .bind(schema)
    .bind(table)
    .bind(TIMESTAMP_CANDIDATES.map(String::from).to_vec())
    .fetch_optional(source)
    .await?;
    Ok(field)
}

/// Wrap an extraction query for a row count (progress totals and the
/// COPY/INSERT selector).
pub fn count_query(sync_sql: &str) -> String {
    format!("SELECT COUNT(*) FROM ({sync_sql}) AS count_subquery")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_id_with_watermark_filters_and_orders() {
        let (conditions, order_by) = plan_conditions(
            Some(IncrementalStrategy::AutoId),
            Some("id"),
            Some("10"),
            None,
            None,
        );
        let sql = assemble_sql("public", "orders", &conditions, order_by.as_deref());
        assert_eq!(sql, "SELECT * FROM public.orders WHERE id > 10 ORDER BY id");
    }

    #[test]
    fn auto_id_without_watermark_requires_non_null() {
        let (conditions, order_by) = plan_conditions(
            Some(IncrementalStrategy::AutoId),
            Some("id"),
            None,
            None,
            None,
        );
        let sql = assemble_sql("public", "orders", &conditions, order_by.as_deref());
        assert_eq!(
            sql,
            "SELECT * FROM public.orders WHERE id IS NOT NULL ORDER BY id"
        );
    }

    #[test]
    fn auto_timestamp_without_watermark_uses_last_24_hours() {
        let (conditions, order_by) = plan_conditions(
            Some(IncrementalStrategy::AutoTimestamp),
            Some("updated_at"),
            None,
            None,
            None,
        );
        let sql = assemble_sql("public", "events", &conditions, order_by.as_deref());
        assert_eq!(
            sql,
            "SELECT * FROM public.events WHERE updated_at >= NOW() - INTERVAL '24 hours' ORDER BY updated_at"
        );
    }

    #[test]
    fn auto_timestamp_watermark_is_quoted() {
        let (conditions, _) = plan_conditions(
            Some(IncrementalStrategy::AutoTimestamp),
            Some("updated_at"),
            Some("2024-03-01 12:00:00"),
            None,
            None,
        );
        assert_eq!(conditions, vec!["updated_at > '2024-03-01 12:00:00'"]);
    }

    #[test]
    fn custom_condition_is_used_verbatim() {
        let (conditions, order_by) = plan_conditions(
            Some(IncrementalStrategy::CustomCondition),
            None,
            None,
            Some("status = 'open' AND region = 'emea'"),
            None,
        );
        assert!(order_by.is_none());
        assert_eq!(conditions, vec!["status = 'open' AND region = 'emea'"]);
    }

    #[test]
    fn global_where_joins_with_and() {
        let (conditions, order_by) = plan_conditions(
            Some(IncrementalStrategy::AutoId),
            Some("id"),
            Some("10"),
            None,
            Some("tenant_id = 7"),
        );
        let sql = assemble_sql("public", "orders", &conditions, order_by.as_deref());
        assert_eq!(
            sql,
            "SELECT * FROM public.orders WHERE id > 10 AND (tenant_id = 7) ORDER BY id"
        );
    }

    #[test]
    fn full_refresh_has_no_predicates() {
        let (conditions, order_by) = plan_conditions(None, None, None, None, None);
        let sql = assemble_sql("public", "t", &conditions, order_by.as_deref());
        assert_eq!(sql, "SELECT * FROM public.t");
    }

    #[test]
    fn non_numeric_watermarks_are_quoted_for_id_strategy() {
        assert_eq!(numeric_literal("12"), "12");
        assert_eq!(numeric_literal("12.5"), "12.5");
        assert_eq!(numeric_literal("abc'def"), "'abc''def'");
    }

    #[test]
    fn count_query_wraps_the_plan() {
        assert_eq!(
            count_query("SELECT * FROM public.t WHERE id > 1"),
            "SELECT COUNT(*) FROM (SELECT * FROM public.t WHERE id > 1) AS count_subquery"
        );
    }
}
