//! Execution-status control service.
//!
//! Thin service over the `job_execution_status` row: creation, progress
//! updates, cooperative cancellation and terminal transitions. The row is
//! deliberately small so the orchestrator can poll it between batches
//! without touching the large run-log row.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::domains::jobs::{ControlStatus, RunStatus};

#[derive(Clone)]
pub struct StatusController {
    pool: PgPool,
}

impl StatusController {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the control row for a fresh run.
    pub async fn create(&self, job_id: i64, run_log_id: Option<i64>) -> Result<i64> {
        let status = RunStatus::create(job_id, run_log_id, &self.pool).await?;
        info!(job_id, status_id = status.id, "created execution status");
        Ok(status.id)
    }

    /// Update stage and clamped percentage. No-op once terminal.
    pub async fn update_progress(&self, status_id: i64, stage: &str, pct: i32) -> Result<bool> {
        RunStatus::update_progress(status_id, stage, pct, &self.pool).await
    }

    /// Flag the run for cooperative cancellation.
    pub async fn request_cancel(&self, status_id: i64) -> Result<bool> {
        let updated = RunStatus::request_cancellation(status_id, &self.pool).await?;
        if updated {
            info!(status_id, "cancellation requested");
        } else {
            warn!(status_id, "cancellation requested for missing or finished run");
        }
        Ok(updated)
    }

    /// Cheap single-column poll. A read failure is reported as not
    /// cancelled so a metadata-store blip cannot abort a healthy run.
    pub async fn is_cancelled(&self, status_id: i64) -> bool {
        match RunStatus::is_cancellation_requested(status_id, &self.pool).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(status_id, error = %e, "failed to poll cancellation flag");
                false
            }
        }
    }

    pub async fn mark_completed(&self, status_id: i64) -> Result<bool> {
        RunStatus::mark(status_id, ControlStatus::Completed, &self.pool).await
    }

    pub async fn mark_failed(&self, status_id: i64) -> Result<bool> {
        RunStatus::mark(status_id, ControlStatus::Failed, &self.pool).await
    }

    pub async fn mark_stopped(&self, status_id: i64) -> Result<bool> {
        RunStatus::mark(status_id, ControlStatus::Stopped, &self.pool).await
    }

    /// Drop terminal rows older than the cutoff; returns rows removed.
    pub async fn cleanup_older_than(&self, days: i64) -> Result<u64> {
        let removed = RunStatus::cleanup_older_than(days, &self.pool).await?;
        if removed > 0 {
            info!(removed, days, "cleaned up old execution status rows");
        }
        Ok(removed)
    }
}
