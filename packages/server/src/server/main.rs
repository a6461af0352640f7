// Main entry point for the sync platform

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgsync_core::common::CryptoService;
use pgsync_core::config::Config;
use pgsync_core::kernel::{SyncRuntime, SyncScheduler};
use pgsync_core::server::app::{build_app, AppState};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pgsync")]
#[command(about = "Scheduled PostgreSQL-to-PostgreSQL synchronization platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and start the scheduler
    App,
    /// Manage metadata store migrations
    Migrate {
        #[command(subcommand)]
        direction: MigrateCommand,
    },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply all pending migrations
    Upgrade,
    /// Revert the most recent migration
    Downgrade,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{},pgsync_core=debug,sqlx=warn", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command.unwrap_or(Commands::App) {
        Commands::App => serve(config).await,
        Commands::Migrate { direction } => migrate(config, direction).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting PostgreSQL sync platform");

    // Fail fast on a bad encryption key before touching anything else.
    let crypto =
        Arc::new(CryptoService::new(&config.encryption_key).context("Invalid ENCRYPTION_KEY")?);

    let pool = connect_with_retries(&config).await?;
    tracing::info!("Metadata store connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let config = Arc::new(config);
    let runtime = Arc::new(SyncRuntime::new(pool, config.clone(), crypto));

    let scheduler = Arc::new(
        SyncScheduler::new(runtime.clone())
            .await
            .context("Failed to create scheduler")?,
    );
    scheduler.start().await.context("Failed to start scheduler")?;

    let app = build_app(AppState {
        runtime: runtime.clone(),
        scheduler: scheduler.clone(),
    });

    let addr = format!("{}:{}", config.app_host, config.app_port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://{}/api/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down, waiting for in-flight runs");
    scheduler.shutdown(true).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn migrate(config: Config, direction: MigrateCommand) -> Result<()> {
    let pool = connect_with_retries(&config).await?;
    let migrator = sqlx::migrate!("./migrations");

    match direction {
        MigrateCommand::Upgrade => {
            migrator.run(&pool).await.context("Migration failed")?;
            tracing::info!("Migrations applied");
        }
        MigrateCommand::Downgrade => {
            // Revert everything above the second-newest applied version.
            let target: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM _sqlx_migrations ORDER BY version DESC LIMIT 1 OFFSET 1",
            )
            .fetch_optional(&pool)
            .await
            .unwrap_or(None);
            migrator
                .undo(&pool, target.unwrap_or(0))
                .await
                .context("Migration revert failed")?;
            tracing::info!("Reverted most recent migration");
        }
    }
    Ok(())
}

async fn connect_with_retries(config: &Config) -> Result<PgPool> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < config.max_retry_attempts => {
                tracing::warn!(
                    attempt,
                    error = %e,
                    "metadata store connection failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(config.retry_delay_secs)).await;
            }
            Err(e) => {
                return Err(e).context("Failed to connect to metadata store");
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown signal handler");
    }
}
