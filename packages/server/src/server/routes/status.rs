//! Execution-status endpoints: polling, cancellation and cleanup.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domains::jobs::RunStatus;
use crate::server::app::AppState;

use super::{ApiError, ApiResult};

pub async fn list_running(
    Extension(state): Extension<AppState>,
) -> ApiResult<Json<Vec<RunStatus>>> {
    let statuses = RunStatus::list_running(&state.runtime.pool).await?;
    Ok(Json(statuses))
}

pub async fn get_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RunStatus>> {
    let status = RunStatus::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution status {id} not found")))?;
    Ok(Json(status))
}

/// Request cooperative cancellation; the run observes the flag at its next
/// suspension point.
pub async fn cancel_status(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let accepted = state
        .runtime
        .status
        .request_cancel(id)
        .await
        .map_err(ApiError::Internal)?;
    if !accepted {
        return Err(ApiError::Conflict(format!(
            "execution status {id} does not exist or has already finished"
        )));
    }
    Ok(Json(json!({ "message": "cancellation requested", "status_id": id })))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    30
}

pub async fn cleanup_statuses(
    Extension(state): Extension<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<Value>> {
    let days = query.days.max(1);
    let removed = state
        .runtime
        .status
        .cleanup_older_than(days)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(json!({ "removed": removed, "days": days })))
}
