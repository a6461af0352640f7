//! Job CRUD, manual triggering and pause/resume.
//!
//! Immediate runs are spawned as detached tasks through the supervisor, so
//! the HTTP response returns as soon as the trigger is accepted; the run
//! lock decides whether the trigger actually proceeds.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::domains::connections::DatabaseConnection;
use crate::domains::jobs::{
    ConflictStrategy, ExecutionMode, JobStatus, NewJob, NewTargetTable, SyncJob, SyncMode,
    TargetTable,
};
use crate::kernel::scheduler::normalize_cron;
use crate::kernel::supervisor;
use crate::server::app::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_db_id: i64,
    pub destination_db_id: i64,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub where_condition: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub target_tables: Vec<NewTargetTable>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: SyncJob,
    pub target_tables: Vec<TargetTable>,
}

impl JobRequest {
    async fn validate(&self, state: &AppState) -> ApiResult<NewJob> {
        if self.execution_mode == ExecutionMode::Scheduled {
            let expr = self
                .cron_expression
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest(
                        "cron_expression is required for scheduled jobs".to_string(),
                    )
                })?;
            normalize_cron(expr).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        }

        for conn_id in [self.source_db_id, self.destination_db_id] {
            if DatabaseConnection::find_by_id(conn_id, &state.runtime.pool)
                .await?
                .is_none()
            {
                return Err(ApiError::BadRequest(format!(
                    "connection {conn_id} does not exist"
                )));
            }
        }

        Ok(NewJob {
            name: self.name.clone(),
            description: self.description.clone(),
            source_db_id: self.source_db_id,
            destination_db_id: self.destination_db_id,
            sync_mode: self.sync_mode,
            conflict_strategy: self.conflict_strategy,
            where_condition: self.where_condition.clone(),
            execution_mode: self.execution_mode,
            cron_expression: self.cron_expression.clone(),
            timezone: self
                .timezone
                .clone()
                .unwrap_or_else(|| state.runtime.config.scheduler_timezone.clone()),
            status: self.status,
        })
    }
}

async fn job_response(state: &AppState, job: SyncJob) -> ApiResult<JobResponse> {
    let target_tables = TargetTable::list_for_job(job.id, &state.runtime.pool).await?;
    Ok(JobResponse { job, target_tables })
}

pub async fn list_jobs(Extension(state): Extension<AppState>) -> ApiResult<Json<Vec<JobResponse>>> {
    let jobs = SyncJob::list(&state.runtime.pool).await?;
    let mut responses = Vec::with_capacity(jobs.len());
    for job in jobs {
        responses.push(job_response(&state, job).await?);
    }
    Ok(Json(responses))
}

pub async fn create_job(
    Extension(state): Extension<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let new = request.validate(&state).await?;
    let job = SyncJob::create(new, &state.runtime.pool).await?;

    for table in request.target_tables {
        TargetTable::create(job.id, table, &state.runtime.pool).await?;
    }

    if job.status == JobStatus::Active {
        state.scheduler.add_job(&job).await?;
    }

    // Reload so next_run_at set during registration is reflected.
    let job = SyncJob::find_by_id(job.id, &state.runtime.pool)
        .await?
        .unwrap_or(job);
    let response = job_response(&state, job).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobResponse>> {
    let job = SyncJob::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job_response(&state, job).await?))
}

pub async fn update_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<JobRequest>,
) -> ApiResult<Json<JobResponse>> {
    let existing = SyncJob::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    if existing.is_running {
        return Err(ApiError::Conflict(format!(
            "job {id} is currently running and cannot be modified"
        )));
    }

    let new = request.validate(&state).await?;
    let job = SyncJob::update(id, new, &state.runtime.pool)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict(format!("job {id} is currently running and cannot be modified"))
        })?;

    if !request.target_tables.is_empty() {
        TargetTable::replace_for_job(job.id, request.target_tables, &state.runtime.pool).await?;
    }

    // Re-register to pick up schedule changes; paused or immediate jobs
    // are simply deregistered.
    state.scheduler.remove_job(job.id).await?;
    if job.status == JobStatus::Active {
        state.scheduler.add_job(&job).await?;
    }

    let job = SyncJob::find_by_id(job.id, &state.runtime.pool)
        .await?
        .unwrap_or(job);
    Ok(Json(job_response(&state, job).await?))
}

pub async fn delete_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let existing = SyncJob::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    if existing.is_running {
        return Err(ApiError::Conflict(format!(
            "job {id} is currently running and cannot be deleted"
        )));
    }

    state.scheduler.remove_job(id).await?;
    let deleted = SyncJob::delete(id, &state.runtime.pool).await?;
    if !deleted {
        return Err(ApiError::Conflict(format!(
            "job {id} is currently running and cannot be deleted"
        )));
    }
    Ok(Json(json!({ "message": "job deleted" })))
}

/// Trigger a run now. Returns immediately; the run proceeds in a detached
/// task unless the run lock is already held.
pub async fn run_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = SyncJob::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;

    let runtime = state.runtime.clone();
    tokio::spawn(async move {
        supervisor::run_job(&runtime, id).await;
    });

    info!(job_id = id, job = %job.name, "manual run triggered");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "run triggered", "job_id": id })),
    ))
}

pub async fn pause_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobResponse>> {
    let job = SyncJob::set_status(id, JobStatus::Paused, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    state.scheduler.remove_job(id).await?;
    info!(job_id = id, "job paused");
    Ok(Json(job_response(&state, job).await?))
}

pub async fn resume_job(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobResponse>> {
    let job = SyncJob::set_status(id, JobStatus::Active, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    state.scheduler.add_job(&job).await?;
    info!(job_id = id, "job resumed");

    let job = SyncJob::find_by_id(id, &state.runtime.pool)
        .await?
        .unwrap_or(job);
    Ok(Json(job_response(&state, job).await?))
}
