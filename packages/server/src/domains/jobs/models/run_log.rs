use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Terminal and in-flight states of a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// One row per run attempt. `log_details` accumulates timestamped lines;
/// end time and duration are filled by the terminal transition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunLog {
    pub id: i64,
    pub job_id: i64,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub tables_processed: i32,
    pub records_transferred: i64,
    pub log_details: Option<String>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl RunLog {
    pub async fn create(job_id: i64, pool: &PgPool) -> Result<Self> {
        let log = sqlx::query_as::<_, RunLog>(
            r#"
            INSERT INTO job_execution_logs (job_id, status, log_details)
            VALUES ($1, 'running', '')
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_one(pool)
        .await?;
        Ok(log)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        let log = sqlx::query_as::<_, RunLog>("SELECT * FROM job_execution_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(log)
    }

    pub async fn list_for_job(job_id: i64, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, RunLog>(
            r#"
            SELECT * FROM job_execution_logs
            WHERE job_id = $1
            ORDER BY start_time DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    pub async fn list_recent(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let logs = sqlx::query_as::<_, RunLog>(
            "SELECT * FROM job_execution_logs ORDER BY start_time DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(logs)
    }

    /// Append a timestamped line to the accumulated log text.
    pub async fn append_line(id: i64, message: &str, pool: &PgPool) -> Result<()> {
        let line = format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        sqlx::query(
            "UPDATE job_execution_logs SET log_details = COALESCE(log_details, '') || $2 WHERE id = $1",
        )
        .bind(id)
        .bind(line)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_success(
        id: i64,
        tables_processed: i32,
        records_transferred: i64,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_execution_logs
            SET status = 'success',
                end_time = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - start_time))::INT,
                tables_processed = $2,
                records_transferred = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(tables_processed)
        .bind(records_transferred)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        id: i64,
        error_message: &str,
        error_traceback: &str,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_execution_logs
            SET status = 'failed',
                end_time = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - start_time))::INT,
                error_message = $2,
                error_traceback = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(error_traceback)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(id: i64, message: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_execution_logs
            SET status = 'cancelled',
                end_time = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - start_time))::INT,
                error_message = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
        Ok(())
    }
}
