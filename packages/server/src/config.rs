use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Transfer strategy override for the data-transfer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Always use the bulk COPY path.
    Copy,
    /// Always use the row-batch INSERT path.
    Insert,
    /// Count rows and decide per table.
    Auto,
}

impl TransferMode {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "copy" => Ok(TransferMode::Copy),
            "insert" => Ok(TransferMode::Insert),
            "auto" => Ok(TransferMode::Auto),
            other => anyhow::bail!("TRANSFER_MODE must be copy, insert or auto (got {other})"),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub app_host: String,
    pub app_port: u16,
    pub app_debug: bool,
    pub log_level: String,

    pub database_url: String,
    pub encryption_key: String,

    pub scheduler_timezone: String,
    pub scheduler_worker_slots: usize,
    pub max_workers: u32,
    pub db_pool_size: u32,

    pub batch_size: usize,
    pub copy_batch_size: usize,
    pub copy_row_threshold: u64,
    pub copy_timeout_secs: u64,
    pub transfer_mode: TransferMode,

    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            app_host: env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            app_port: parsed("APP_PORT", 8000)?,
            app_debug: env::var("APP_DEBUG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            encryption_key: env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY must be set")?,

            scheduler_timezone: env::var("SCHEDULER_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Shanghai".to_string()),
            scheduler_worker_slots: parsed("SCHEDULER_WORKER_SLOTS", 20)?,
            max_workers: parsed("MAX_WORKERS", 4)?,
            db_pool_size: parsed("DB_POOL_SIZE", 10)?,

            batch_size: parsed("BATCH_SIZE", 1_000)?,
            copy_batch_size: parsed("COPY_BATCH_SIZE", 50_000)?,
            copy_row_threshold: parsed("COPY_ROW_THRESHOLD", 100_000)?,
            copy_timeout_secs: parsed("COPY_TIMEOUT_SECS", 300)?,
            transfer_mode: match env::var("TRANSFER_MODE") {
                Ok(v) => TransferMode::parse(&v)?,
                Err(_) => TransferMode::Auto,
            },

            max_retry_attempts: parsed("MAX_RETRY_ATTEMPTS", 3)?,
            retry_delay_secs: parsed("RETRY_DELAY_SECS", 5)?,
        })
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_mode_parses_known_values() {
        assert_eq!(TransferMode::parse("copy").unwrap(), TransferMode::Copy);
        assert_eq!(TransferMode::parse("INSERT").unwrap(), TransferMode::Insert);
        assert_eq!(TransferMode::parse("Auto").unwrap(), TransferMode::Auto);
        assert!(TransferMode::parse("stream").is_err());
    }
}
