use axum::{extract::Extension, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    scheduler_running: bool,
    database_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    version: &'static str,
}

/// Health check endpoint
///
/// Checks:
/// - Scheduler is ticking
/// - Metadata store connectivity
///
/// Returns 200 OK when healthy, 503 Service Unavailable otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let db_error = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.runtime.pool),
    )
    .await
    {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(format!("query failed: {e}")),
        Err(_) => Some("query timeout (>5s)".to_string()),
    };

    let scheduler_running = state.scheduler.is_running();
    let database_connected = db_error.is_none();
    let healthy = scheduler_running && database_connected;

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            scheduler_running,
            database_connected,
            error: db_error,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}
