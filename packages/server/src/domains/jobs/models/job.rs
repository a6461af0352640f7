//! Sync job model and its closed enum sets.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Active,
    Inactive,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "conflict_strategy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Plain insert; any conflict aborts the batch.
    #[default]
    Error,
    /// `INSERT ... ON CONFLICT DO NOTHING`.
    Ignore,
    /// Upsert on the destination primary key.
    Replace,
    /// Row-at-a-time insert counting skipped conflicts.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Immediate,
    #[default]
    Scheduled,
}

// ============================================================================
// Job model
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncJob {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub source_db_id: i64,
    pub destination_db_id: i64,
    pub sync_mode: SyncMode,
    pub conflict_strategy: ConflictStrategy,
    pub where_condition: Option<String>,
    pub execution_mode: ExecutionMode,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub status: JobStatus,
    pub is_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Field set for creating or updating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub source_db_id: i64,
    pub destination_db_id: i64,
    pub sync_mode: SyncMode,
    pub conflict_strategy: ConflictStrategy,
    pub where_condition: Option<String>,
    pub execution_mode: ExecutionMode,
    pub cron_expression: Option<String>,
    pub timezone: String,
    pub status: JobStatus,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl SyncJob {
    pub async fn create(new: NewJob, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, SyncJob>(
            r#"
            INSERT INTO backup_jobs
                (name, description, source_db_id, destination_db_id, sync_mode,
                 conflict_strategy, where_condition, execution_mode,
                 cron_expression, timezone, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(new.name)
        .bind(new.description)
        .bind(new.source_db_id)
        .bind(new.destination_db_id)
        .bind(new.sync_mode)
        .bind(new.conflict_strategy)
        .bind(new.where_condition)
        .bind(new.execution_mode)
        .bind(new.cron_expression)
        .bind(new.timezone)
        .bind(new.status)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, SyncJob>("SELECT * FROM backup_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, SyncJob>("SELECT * FROM backup_jobs ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(jobs)
    }

    /// Jobs the scheduler registers at startup.
    pub async fn find_active_scheduled(pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, SyncJob>(
            r#"
            SELECT * FROM backup_jobs
            WHERE status = 'active' AND execution_mode = 'scheduled'
            ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Update the job definition. Refused while the job is running; returns
    /// `None` when no non-running row matched.
    pub async fn update(id: i64, new: NewJob, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, SyncJob>(
            r#"
            UPDATE backup_jobs
            SET name = $2,
                description = $3,
                source_db_id = $4,
                destination_db_id = $5,
                sync_mode = $6,
                conflict_strategy = $7,
                where_condition = $8,
                execution_mode = $9,
                cron_expression = $10,
                timezone = $11,
                status = $12,
                updated_at = NOW()
            WHERE id = $1 AND is_running = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new.name)
        .bind(new.description)
        .bind(new.source_db_id)
        .bind(new.destination_db_id)
        .bind(new.sync_mode)
        .bind(new.conflict_strategy)
        .bind(new.where_condition)
        .bind(new.execution_mode)
        .bind(new.cron_expression)
        .bind(new.timezone)
        .bind(new.status)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    pub async fn set_status(id: i64, status: JobStatus, pool: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, SyncJob>(
            r#"
            UPDATE backup_jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?;
        Ok(job)
    }

    pub async fn set_next_run_at(
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query("UPDATE backup_jobs SET next_run_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(next_run_at)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_run_at(id: i64, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE backup_jobs SET last_run_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Delete the job (cascades to target tables, logs and statuses).
    /// Refused while the job is running.
    pub async fn delete(id: i64, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = $1 AND is_running = FALSE")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically flip `is_running` from false to true.
    ///
    /// The row is taken with `FOR UPDATE NOWAIT`, so a concurrent locker in
    /// an open transaction reads as busy instead of blocking. Returns
    /// `Ok(false)` when the lock is contended or already held.
    pub async fn try_acquire_run_lock(id: i64, pool: &PgPool) -> Result<bool> {
        let mut tx = pool.begin().await?;

        let current = sqlx::query_scalar::<_, bool>(
            "SELECT is_running FROM backup_jobs WHERE id = $1 FOR UPDATE NOWAIT",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await;

        let is_running = match current {
            Ok(Some(flag)) => flag,
            Ok(None) => anyhow::bail!("job {id} not found"),
            Err(e) if is_lock_not_available(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if is_running {
            return Ok(false);
        }

        sqlx::query("UPDATE backup_jobs SET is_running = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn release_run_lock(id: i64, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE backup_jobs SET is_running = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// PostgreSQL 55P03: the NOWAIT row lock could not be taken.
fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "55P03")
        .unwrap_or(false)
}
