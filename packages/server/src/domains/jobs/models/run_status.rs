//! Lightweight per-run control row.
//!
//! Kept separate from the large run-log row so cancellation polling and
//! progress reads stay cheap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "control_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Running,
    StopRequested,
    Stopped,
    Completed,
    Failed,
}

impl ControlStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControlStatus::Stopped | ControlStatus::Completed | ControlStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunStatus {
    pub id: i64,
    pub job_id: i64,
    pub execution_log_id: Option<i64>,
    pub status: ControlStatus,
    pub is_cancellation_requested: bool,
    pub current_stage: Option<String>,
    pub progress_percentage: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl RunStatus {
    pub async fn create(job_id: i64, execution_log_id: Option<i64>, pool: &PgPool) -> Result<Self> {
        let status = sqlx::query_as::<_, RunStatus>(
            r#"
            INSERT INTO job_execution_status
                (job_id, execution_log_id, status, current_stage, progress_percentage)
            VALUES ($1, $2, 'running', 'initializing', 0)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(execution_log_id)
        .fetch_one(pool)
        .await?;
        Ok(status)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        let status =
            sqlx::query_as::<_, RunStatus>("SELECT * FROM job_execution_status WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(status)
    }

    pub async fn list_for_job(job_id: i64, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let statuses = sqlx::query_as::<_, RunStatus>(
            r#"
            SELECT * FROM job_execution_status
            WHERE job_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(statuses)
    }

    pub async fn list_running(pool: &PgPool) -> Result<Vec<Self>> {
        let statuses = sqlx::query_as::<_, RunStatus>(
            r#"
            SELECT * FROM job_execution_status
            WHERE status IN ('running', 'stop_requested')
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(statuses)
    }

    /// Update stage and percentage; the terminal states are immutable.
    pub async fn update_progress(id: i64, stage: &str, pct: i32, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution_status
            SET current_stage = $2, progress_percentage = $3, updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'stop_requested')
            "#,
        )
        .bind(id)
        .bind(stage)
        .bind(pct.clamp(0, 100))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn request_cancellation(id: i64, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution_status
            SET is_cancellation_requested = TRUE, status = 'stop_requested', updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'stop_requested')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Single-column read used on the hot polling path.
    pub async fn is_cancellation_requested(id: i64, pool: &PgPool) -> Result<bool> {
        let requested: Option<bool> = sqlx::query_scalar(
            "SELECT is_cancellation_requested FROM job_execution_status WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(requested.unwrap_or(false))
    }

    /// Terminal transition; rejected once a terminal state is reached.
    pub async fn mark(id: i64, status: ControlStatus, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution_status
            SET status = $2,
                progress_percentage = CASE WHEN $2 = 'completed' THEN 100 ELSE progress_percentage END,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('running', 'stop_requested')
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove terminal rows older than the cutoff. Returns rows deleted.
    pub async fn cleanup_older_than(days: i64, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_execution_status
            WHERE created_at < NOW() - ($1 || ' days')::INTERVAL
              AND status IN ('stopped', 'completed', 'failed')
            "#,
        )
        .bind(days.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
