//! Cron-driven job dispatch using tokio-cron-scheduler.
//!
//! ACTIVE + SCHEDULED jobs are registered at startup with their 5-field
//! cron expressions, evaluated in each job's declared timezone. Fires pass
//! through a bounded semaphore into the supervisor, so at most
//! `SCHEDULER_WORKER_SLOTS` runs execute concurrently; per-job overlap is
//! prevented separately by the run lock. IMMEDIATE jobs are never
//! registered here.
//!
//! ```text
//! Scheduler (cron tick, job timezone)
//!     │
//!     └─► acquire worker slot
//!             └─► supervisor::run_job
//!                     └─► Orchestrator → SchemaReplicator → DataTransfer
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domains::jobs::{ExecutionMode, SyncJob};
use crate::kernel::supervisor::{self, RunOutcome};
use crate::kernel::SyncRuntime;

pub struct SyncScheduler {
    scheduler: Mutex<JobScheduler>,
    runtime: Arc<SyncRuntime>,
    /// job id -> registered scheduler entry
    entries: Mutex<HashMap<i64, Uuid>>,
    slots: Arc<Semaphore>,
    total_slots: u32,
    running: AtomicBool,
}

impl SyncScheduler {
    pub async fn new(runtime: Arc<SyncRuntime>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .context("failed to create job scheduler")?;
        let total_slots = runtime.config.scheduler_worker_slots.max(1) as u32;

        Ok(Self {
            scheduler: Mutex::new(scheduler),
            runtime,
            entries: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(total_slots as usize)),
            total_slots,
            running: AtomicBool::new(false),
        })
    }

    /// Start ticking and register all ACTIVE + SCHEDULED jobs.
    pub async fn start(&self) -> Result<()> {
        ensure_bootstrap_table(&self.runtime.pool).await?;

        self.scheduler
            .lock()
            .await
            .start()
            .await
            .context("failed to start job scheduler")?;
        self.running.store(true, Ordering::SeqCst);

        let jobs = SyncJob::find_active_scheduled(&self.runtime.pool).await?;
        let mut registered = 0usize;
        for job in &jobs {
            match self.add_job(job).await {
                Ok(true) => registered += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = job.id, error = %e, "failed to register job"),
            }
        }

        info!(registered, "scheduler started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register (or atomically replace) a job's cron entry. Returns whether
    /// the job was registered.
    pub async fn add_job(&self, job: &SyncJob) -> Result<bool> {
        if job.execution_mode != ExecutionMode::Scheduled {
            info!(job_id = job.id, "immediate-mode job, not registering with scheduler");
            return Ok(false);
        }

        let Some(expr) = job
            .cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            warn!(job_id = job.id, "scheduled job has no cron expression, skipping");
            return Ok(false);
        };

        let schedule = normalize_cron(expr)?;
        let timezone = self.resolve_timezone(&job.timezone);

        let runtime = self.runtime.clone();
        let slots = self.slots.clone();
        let job_id = job.id;
        let cron_job = Job::new_async_tz(schedule.as_str(), timezone, move |_uuid, _lock| {
            let runtime = runtime.clone();
            let slots = slots.clone();
            Box::pin(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    return;
                };
                match supervisor::run_job(&runtime, job_id).await {
                    RunOutcome::Completed(summary) => info!(
                        job_id,
                        tables = summary.tables_processed,
                        records = summary.records_transferred,
                        "scheduled run completed"
                    ),
                    RunOutcome::Cancelled => info!(job_id, "scheduled run cancelled"),
                    RunOutcome::Skipped => info!(job_id, "scheduled run skipped, already running"),
                    RunOutcome::Failed(e) => error!(job_id, error = %e, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("invalid cron expression '{expr}'"))?;

        // Replace-then-insert under the entries lock keeps re-registration
        // atomic for a given job id.
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.remove(&job.id) {
            let _ = self.scheduler.lock().await.remove(&previous).await;
        }

        let entry_id = {
            let scheduler = self.scheduler.lock().await;
            scheduler
                .add(cron_job)
                .await
                .context("failed to add job to scheduler")?
        };
        entries.insert(job.id, entry_id);
        drop(entries);

        let next_run = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler
                .next_tick_for_job(entry_id)
                .await
                .ok()
                .flatten()
        };
        SyncJob::set_next_run_at(job.id, next_run, &self.runtime.pool).await?;
        persist_bootstrap_entry(&self.runtime.pool, job, next_run).await?;

        info!(job_id = job.id, cron = expr, timezone = %job.timezone, "job registered with scheduler");
        Ok(true)
    }

    /// Deregister a job (pause, delete or mode change).
    pub async fn remove_job(&self, job_id: i64) -> Result<()> {
        let removed = self.entries.lock().await.remove(&job_id);
        if let Some(entry_id) = removed {
            let _ = self.scheduler.lock().await.remove(&entry_id).await;
            info!(job_id, "job removed from scheduler");
        }

        sqlx::query("DELETE FROM scheduler_jobs WHERE id = $1")
            .bind(bootstrap_id(job_id))
            .execute(&self.runtime.pool)
            .await?;
        SyncJob::set_next_run_at(job_id, None, &self.runtime.pool).await?;
        Ok(())
    }

    /// Stop ticking; with `wait` the call blocks until in-flight runs have
    /// drained their worker slots.
    pub async fn shutdown(&self, wait: bool) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .context("failed to shut down job scheduler")?;

        if wait {
            let _drained = self
                .slots
                .acquire_many(self.total_slots)
                .await
                .context("worker pool closed while draining")?;
            info!("scheduler shut down, all runs drained");
        } else {
            info!("scheduler shut down");
        }
        Ok(())
    }

    fn resolve_timezone(&self, name: &str) -> Tz {
        name.parse::<Tz>().unwrap_or_else(|_| {
            self.runtime
                .config
                .scheduler_timezone
                .parse::<Tz>()
                .unwrap_or_else(|_| {
                    warn!(timezone = name, "unknown timezone, falling back to UTC");
                    Tz::UTC
                })
        })
    }
}

/// Validate a 5-field cron expression and produce the 6-field form the
/// scheduling engine expects (seconds pinned to zero).
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!(
            "cron expression must have 5 fields (minute hour day-of-month month day-of-week), got {}",
            fields.len()
        );
    }
    Ok(format!("0 {}", fields.join(" ")))
}

// ============================================================================
// Scheduler bootstrap table
// ============================================================================

fn bootstrap_id(job_id: i64) -> String {
    format!("backup_job_{job_id}")
}

/// The scheduler's own metadata table, created on demand.
async fn ensure_bootstrap_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_jobs (
            id VARCHAR(191) NOT NULL PRIMARY KEY,
            next_run_time DOUBLE PRECISION,
            job_state BYTEA NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn persist_bootstrap_entry(
    pool: &PgPool,
    job: &SyncJob,
    next_run: Option<DateTime<Utc>>,
) -> Result<()> {
    let state = serde_json::to_vec(&serde_json::json!({
        "job_id": job.id,
        "name": job.name,
        "cron_expression": job.cron_expression,
        "timezone": job.timezone,
    }))?;

    sqlx::query(
        r#"
        INSERT INTO scheduler_jobs (id, next_run_time, job_state)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET next_run_time = EXCLUDED.next_run_time,
            job_state = EXCLUDED.job_state
        "#,
    )
    .bind(bootstrap_id(job.id))
    .bind(next_run.map(|t| t.timestamp() as f64))
    .bind(state)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_cron("0 2 * * *").unwrap(), "0 0 2 * * *");
        assert_eq!(normalize_cron("*/5 * * * 1-5").unwrap(), "0 */5 * * * 1-5");
    }

    #[test]
    fn other_field_counts_are_rejected() {
        assert!(normalize_cron("0 2 * *").is_err());
        assert!(normalize_cron("0 0 2 * * *").is_err());
        assert!(normalize_cron("").is_err());
    }

    #[test]
    fn bootstrap_ids_are_stable() {
        assert_eq!(bootstrap_id(7), "backup_job_7");
    }
}
