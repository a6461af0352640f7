//! Run-log listing and detail.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde::Deserialize;

use crate::domains::jobs::RunLog;
use crate::server::app::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_logs(
    Extension(state): Extension<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<RunLog>>> {
    let limit = query.limit.clamp(1, 500);
    let logs = match query.job_id {
        Some(job_id) => RunLog::list_for_job(job_id, limit, &state.runtime.pool).await?,
        None => RunLog::list_recent(limit, &state.runtime.pool).await?,
    };
    Ok(Json(logs))
}

pub async fn get_log(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RunLog>> {
    let log = RunLog::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution log {id} not found")))?;
    Ok(Json(log))
}
