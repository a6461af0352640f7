//! Run entry point with the at-most-one-per-job guarantee.
//!
//! Both the scheduler and the HTTP trigger funnel through `run_job`: the
//! job row's `is_running` flag is acquired atomically, the orchestrator
//! runs, and the flag is always released on exit. Two concurrent
//! invocations for the same job never both proceed past the lock.

use tracing::{error, info, warn};

use crate::domains::jobs::SyncJob;
use crate::kernel::sync::{Orchestrator, RunSummary, SyncError};
use crate::kernel::SyncRuntime;

/// How a `run_job` invocation ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled,
    Failed(String),
    /// The run lock was held by another invocation; nothing was done.
    Skipped,
}

pub async fn run_job(runtime: &SyncRuntime, job_id: i64) -> RunOutcome {
    match SyncJob::try_acquire_run_lock(job_id, &runtime.pool).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(job_id, "job is already running, skipping trigger");
            return RunOutcome::Skipped;
        }
        Err(e) => {
            error!(job_id, error = %e, "failed to acquire run lock");
            return RunOutcome::Failed(e.to_string());
        }
    }

    info!(job_id, "run lock acquired");
    let result = Orchestrator::new(runtime).execute(job_id).await;

    if let Err(e) = SyncJob::release_run_lock(job_id, &runtime.pool).await {
        error!(job_id, error = %e, "failed to release run lock");
    }

    match result {
        Ok(summary) => RunOutcome::Completed(summary),
        Err(SyncError::Cancelled) => RunOutcome::Cancelled,
        Err(e) => RunOutcome::Failed(e.to_string()),
    }
}
