//! Application setup and router assembly.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::{SyncRuntime, SyncScheduler};
use crate::server::routes::{connections, health, jobs, logs, progress, status};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<SyncRuntime>,
    pub scheduler: Arc<SyncScheduler>,
}

/// Build the axum application with all API routes.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_handler))
        .route(
            "/api/connections",
            get(connections::list_connections).post(connections::create_connection),
        )
        .route(
            "/api/connections/:id",
            get(connections::get_connection)
                .put(connections::update_connection)
                .delete(connections::delete_connection),
        )
        .route("/api/connections/:id/test", post(connections::test_connection))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/api/jobs/:id",
            get(jobs::get_job).put(jobs::update_job).delete(jobs::delete_job),
        )
        .route("/api/jobs/:id/run", post(jobs::run_job))
        .route("/api/jobs/:id/pause", post(jobs::pause_job))
        .route("/api/jobs/:id/resume", post(jobs::resume_job))
        .route("/api/jobs/:id/progress", get(progress::job_progress))
        .route("/api/logs", get(logs::list_logs))
        .route("/api/logs/:id", get(logs::get_log))
        .route("/api/status/running", get(status::list_running))
        .route("/api/status/cleanup", post(status::cleanup_statuses))
        .route("/api/status/:id", get(status::get_status))
        .route("/api/status/:id/cancel", post(status::cancel_status))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
