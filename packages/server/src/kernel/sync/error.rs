use thiserror::Error;

/// Error taxonomy of the execution pipeline.
///
/// `Cancelled` is control flow rather than a failure: it surfaces through
/// the same channel so the orchestrator can unwind mid-table, but it marks
/// the run CANCELLED/STOPPED instead of FAILED.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to connect to {role} database: {message}")]
    Connect { role: &'static str, message: String },

    #[error("source table {schema}.{table} does not exist in source database")]
    SourceMissing { schema: String, table: String },

    #[error("schema replication failed for {schema}.{table}: {message}")]
    Schema {
        schema: String,
        table: String,
        message: String,
    },

    #[error("data transfer failed for {table}: {message}")]
    Transfer { table: String, message: String },

    #[error("conflict while inserting into {table}: {message}")]
    Conflict { table: String, message: String },

    #[error("no active tables specified for synchronization")]
    NoActiveTables,

    #[error("run cancelled by user")]
    Cancelled,

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
