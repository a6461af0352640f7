use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// A registered source or destination database.
///
/// Password and DSN are stored as ciphertext and never leave this struct in
/// serialized form.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DatabaseConnection {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub encrypted_password: String,
    #[serde(skip_serializing)]
    pub connection_string_encrypted: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field set for creating or updating a connection. Ciphertext is produced
/// by the caller; this layer never sees plaintext credentials.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    pub port: i32,
    pub database_name: String,
    pub username: String,
    pub encrypted_password: String,
    pub connection_string_encrypted: String,
    pub is_active: bool,
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl DatabaseConnection {
    pub async fn create(new: NewConnection, pool: &PgPool) -> Result<Self> {
        let conn = sqlx::query_as::<_, DatabaseConnection>(
            r#"
            INSERT INTO database_connections
                (name, description, host, port, database_name, username,
                 encrypted_password, connection_string_encrypted, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(new.name)
        .bind(new.description)
        .bind(new.host)
        .bind(new.port)
        .bind(new.database_name)
        .bind(new.username)
        .bind(new.encrypted_password)
        .bind(new.connection_string_encrypted)
        .bind(new.is_active)
        .fetch_one(pool)
        .await?;
        Ok(conn)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        let conn = sqlx::query_as::<_, DatabaseConnection>(
            "SELECT * FROM database_connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(conn)
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>> {
        let conns = sqlx::query_as::<_, DatabaseConnection>(
            "SELECT * FROM database_connections ORDER BY id",
        )
        .fetch_all(pool)
        .await?;
        Ok(conns)
    }

    pub async fn update(id: i64, new: NewConnection, pool: &PgPool) -> Result<Option<Self>> {
        let conn = sqlx::query_as::<_, DatabaseConnection>(
            r#"
            UPDATE database_connections
            SET name = $2,
                description = $3,
                host = $4,
                port = $5,
                database_name = $6,
                username = $7,
                encrypted_password = $8,
                connection_string_encrypted = $9,
                is_active = $10,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new.name)
        .bind(new.description)
        .bind(new.host)
        .bind(new.port)
        .bind(new.database_name)
        .bind(new.username)
        .bind(new.encrypted_password)
        .bind(new.connection_string_encrypted)
        .bind(new.is_active)
        .fetch_optional(pool)
        .await?;
        Ok(conn)
    }

    /// Number of jobs referencing this connection as source or destination.
    pub async fn reference_count(id: i64, pool: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_jobs WHERE source_db_id = $1 OR destination_db_id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Delete the connection. Returns false when the row did not exist.
    /// Referencing jobs must be removed first (checked by the caller; the
    /// FK is RESTRICT as a backstop).
    pub async fn delete(id: i64, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM database_connections WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
