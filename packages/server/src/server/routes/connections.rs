//! Connection CRUD. Passwords and DSNs are encrypted before they reach the
//! metadata store and never serialized back out.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;

use crate::domains::connections::{DatabaseConnection, NewConnection};
use crate::server::app::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ConnectionRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_port() -> i32 {
    5432
}

fn default_true() -> bool {
    true
}

impl ConnectionRequest {
    fn dsn(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }

    fn into_new(self, state: &AppState) -> ApiResult<NewConnection> {
        let dsn = self.dsn();
        let encrypted_password = state
            .runtime
            .crypto
            .encrypt(&self.password)
            .map_err(|e| ApiError::Internal(e.into()))?;
        let connection_string_encrypted = state
            .runtime
            .crypto
            .encrypt(&dsn)
            .map_err(|e| ApiError::Internal(e.into()))?;
        Ok(NewConnection {
            name: self.name,
            description: self.description,
            host: self.host,
            port: self.port,
            database_name: self.database_name,
            username: self.username,
            encrypted_password,
            connection_string_encrypted,
            is_active: self.is_active,
        })
    }
}

pub async fn list_connections(
    Extension(state): Extension<AppState>,
) -> ApiResult<Json<Vec<DatabaseConnection>>> {
    let connections = DatabaseConnection::list(&state.runtime.pool).await?;
    Ok(Json(connections))
}

pub async fn create_connection(
    Extension(state): Extension<AppState>,
    Json(request): Json<ConnectionRequest>,
) -> ApiResult<(StatusCode, Json<DatabaseConnection>)> {
    let new = request.into_new(&state)?;
    let connection = DatabaseConnection::create(new, &state.runtime.pool).await?;
    Ok((StatusCode::CREATED, Json(connection)))
}

pub async fn get_connection(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DatabaseConnection>> {
    let connection = DatabaseConnection::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("connection {id} not found")))?;
    Ok(Json(connection))
}

pub async fn update_connection(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ConnectionRequest>,
) -> ApiResult<Json<DatabaseConnection>> {
    let new = request.into_new(&state)?;
    let connection = DatabaseConnection::update(id, new, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("connection {id} not found")))?;
    Ok(Json(connection))
}

pub async fn delete_connection(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let references = DatabaseConnection::reference_count(id, &state.runtime.pool).await?;
    if references > 0 {
        return Err(ApiError::Conflict(format!(
            "connection {id} is referenced by {references} job(s)"
        )));
    }

    let deleted = DatabaseConnection::delete(id, &state.runtime.pool).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("connection {id} not found")));
    }
    Ok(Json(json!({ "message": "connection deleted" })))
}

/// Ping the database behind a stored connection.
pub async fn test_connection(
    Extension(state): Extension<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let connection = DatabaseConnection::find_by_id(id, &state.runtime.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("connection {id} not found")))?;

    let dsn = state
        .runtime
        .crypto
        .decrypt(&connection.connection_string_encrypted)
        .map_err(|e| ApiError::Internal(e.into()))?;

    let probe = async {
        let pool = PgPoolOptions::new().max_connections(1).connect(&dsn).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        pool.close().await;
        Ok::<(), sqlx::Error>(())
    };

    match tokio::time::timeout(std::time::Duration::from_secs(10), probe).await {
        Ok(Ok(())) => Ok(Json(json!({ "success": true, "message": "connection ok" }))),
        Ok(Err(e)) => Ok(Json(json!({ "success": false, "message": e.to_string() }))),
        Err(_) => Ok(Json(json!({ "success": false, "message": "connection timed out" }))),
    }
}
