use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Per-table incremental sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "incremental_strategy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    #[default]
    None,
    AutoId,
    AutoTimestamp,
    CustomCondition,
}

/// A table selected for synchronization by a job.
///
/// `last_sync_value` is the string-encoded high-watermark; it is advanced
/// only after a successful run so a failed batch never moves it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TargetTable {
    pub id: i64,
    pub job_id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub is_active: bool,
    pub incremental_strategy: IncrementalStrategy,
    pub incremental_field: Option<String>,
    pub custom_condition: Option<String>,
    pub last_sync_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TargetTable {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

/// Field set for attaching a table to a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTargetTable {
    pub schema_name: String,
    pub table_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub incremental_strategy: IncrementalStrategy,
    #[serde(default)]
    pub incremental_field: Option<String>,
    #[serde(default)]
    pub custom_condition: Option<String>,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl TargetTable {
    pub async fn create(job_id: i64, new: NewTargetTable, pool: &PgPool) -> Result<Self> {
        let table = sqlx::query_as::<_, TargetTable>(
            r#"
            INSERT INTO job_target_tables
                (job_id, schema_name, table_name, is_active,
                 incremental_strategy, incremental_field, custom_condition)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(new.schema_name)
        .bind(new.table_name)
        .bind(new.is_active)
        .bind(new.incremental_strategy)
        .bind(new.incremental_field)
        .bind(new.custom_condition)
        .fetch_one(pool)
        .await?;
        Ok(table)
    }

    pub async fn list_for_job(job_id: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let tables = sqlx::query_as::<_, TargetTable>(
            "SELECT * FROM job_target_tables WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;
        Ok(tables)
    }

    /// Active tables in declared order; this is the run order.
    pub async fn find_active_for_job(job_id: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let tables = sqlx::query_as::<_, TargetTable>(
            "SELECT * FROM job_target_tables WHERE job_id = $1 AND is_active = TRUE ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;
        Ok(tables)
    }

    /// Replace the job's table set (used by job update).
    pub async fn replace_for_job(
        job_id: i64,
        tables: Vec<NewTargetTable>,
        pool: &PgPool,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM job_target_tables WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        for new in tables {
            sqlx::query(
                r#"
                INSERT INTO job_target_tables
                    (job_id, schema_name, table_name, is_active,
                     incremental_strategy, incremental_field, custom_condition)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job_id)
            .bind(new.schema_name)
            .bind(new.table_name)
            .bind(new.is_active)
            .bind(new.incremental_strategy)
            .bind(new.incremental_field)
            .bind(new.custom_condition)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist the high-watermark observed by a successful sync.
    pub async fn update_last_sync_value(id: i64, value: &str, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE job_target_tables SET last_sync_value = $2 WHERE id = $1")
            .bind(id)
            .bind(value)
            .execute(pool)
            .await?;
        Ok(())
    }
}
