//! Per-run lifecycle.
//!
//! Reads the job and its active tables, opens per-run source and
//! destination pools from decrypted DSNs, drives schema replication and
//! data transfer table by table, and writes the terminal bookkeeping: run
//! log status, execution status, job timestamps and the final progress
//! event. Cancellation is polled between tables and batches and before the
//! row-count query.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::domains::connections::DatabaseConnection;
use crate::domains::jobs::{RunLog, SyncJob, TargetTable};
use crate::kernel::SyncRuntime;

use super::error::SyncError;
use super::query::{build_sync_plan, count_query};
use super::schema::SchemaReplicator;
use super::transfer::{
    select_strategy, CancelProbe, ProgressReporter, TableSync, TransferSettings,
};
use super::value::DestColumn;

/// Final counters of a successful run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub tables_processed: usize,
    pub records_transferred: u64,
}

pub struct Orchestrator<'a> {
    runtime: &'a SyncRuntime,
}

impl<'a> Orchestrator<'a> {
    pub fn new(runtime: &'a SyncRuntime) -> Self {
        Self { runtime }
    }

    /// Execute one run of the job. The caller holds the run lock.
    pub async fn execute(&self, job_id: i64) -> Result<RunSummary, SyncError> {
        let meta = &self.runtime.pool;
        let job = SyncJob::find_by_id(job_id, meta)
            .await?
            .ok_or_else(|| SyncError::Other(anyhow::anyhow!("job {job_id} not found")))?;

        let run_log = RunLog::create(job.id, meta).await.map_err(SyncError::Other)?;
        let status_id = self
            .runtime
            .status
            .create(job.id, Some(run_log.id))
            .await
            .map_err(SyncError::Other)?;

        let reporter = ProgressReporter::new(self.runtime.progress.clone(), job.id);
        let cancel = CancelProbe::new(self.runtime.status.clone(), status_id);

        self.log_line(run_log.id, "run started").await;

        let result = self
            .sync_all(&job, run_log.id, status_id, &reporter, &cancel)
            .await;

        match result {
            Ok(summary) => {
                if let Err(e) = RunLog::mark_success(
                    run_log.id,
                    summary.tables_processed as i32,
                    summary.records_transferred as i64,
                    meta,
                )
                .await
                {
                    error!(run_log_id = run_log.id, error = %e, "failed to mark run log success");
                }
                self.log_line(run_log.id, "run completed successfully").await;
                if let Err(e) = self.runtime.status.mark_completed(status_id).await {
                    error!(status_id, error = %e, "failed to mark execution status completed");
                }
                if let Err(e) = SyncJob::touch_last_run_at(job.id, meta).await {
                    warn!(job_id = job.id, error = %e, "failed to update last_run_at");
                }
                reporter
                    .update(|p| {
                        p.stage = "completed".to_string();
                        p.percentage = 100;
                        p.status = Some("completed".to_string());
                    })
                    .await;
                info!(
                    job_id = job.id,
                    tables = summary.tables_processed,
                    records = summary.records_transferred,
                    "sync run completed"
                );
                Ok(summary)
            }
            Err(SyncError::Cancelled) => {
                if let Err(e) =
                    RunLog::mark_cancelled(run_log.id, "run cancelled by user", meta).await
                {
                    error!(run_log_id = run_log.id, error = %e, "failed to mark run log cancelled");
                }
                self.log_line(run_log.id, "run cancelled by user").await;
                if let Err(e) = self.runtime.status.mark_stopped(status_id).await {
                    error!(status_id, error = %e, "failed to mark execution status stopped");
                }
                reporter
                    .update(|p| {
                        p.stage = "cancelled".to_string();
                        p.status = Some("cancelled".to_string());
                        p.message = Some("run cancelled by user".to_string());
                    })
                    .await;
                info!(job_id = job.id, "sync run cancelled");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                let trace = format!("{e:?}");
                if let Err(mark_err) =
                    RunLog::mark_failed(run_log.id, &message, &trace, meta).await
                {
                    error!(run_log_id = run_log.id, error = %mark_err, "failed to mark run log failed");
                }
                self.log_line(run_log.id, &format!("run failed: {message}"))
                    .await;
                if let Err(e) = self.runtime.status.mark_failed(status_id).await {
                    error!(status_id, error = %e, "failed to mark execution status failed");
                }
                reporter
                    .update(|p| {
                        p.stage = "error".to_string();
                        p.status = Some("failed".to_string());
                        p.error = Some(message.clone());
                    })
                    .await;
                error!(job_id = job.id, error = %message, "sync run failed");
                Err(e)
            }
        }
    }

    async fn sync_all(
        &self,
        job: &SyncJob,
        run_log_id: i64,
        status_id: i64,
        reporter: &ProgressReporter,
        cancel: &CancelProbe,
    ) -> Result<RunSummary, SyncError> {
        let meta = &self.runtime.pool;

        let tables = TargetTable::find_active_for_job(job.id, meta)
            .await
            .map_err(SyncError::Other)?;
        if tables.is_empty() {
            self.log_line(run_log_id, "no active tables specified").await;
            return Err(SyncError::NoActiveTables);
        }

        let source = self.open_side_pool(job.source_db_id, "source").await?;
        let dest = match self.open_side_pool(job.destination_db_id, "destination").await {
            Ok(pool) => pool,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };
        self.log_line(run_log_id, "database connections established")
            .await;

        let outcome = self
            .sync_tables(job, &tables, &source, &dest, run_log_id, status_id, reporter, cancel)
            .await;

        source.close().await;
        dest.close().await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_tables(
        &self,
        job: &SyncJob,
        tables: &[TargetTable],
        source: &PgPool,
        dest: &PgPool,
        run_log_id: i64,
        status_id: i64,
        reporter: &ProgressReporter,
        cancel: &CancelProbe,
    ) -> Result<RunSummary, SyncError> {
        let meta = &self.runtime.pool;
        let settings = TransferSettings::from_config(&self.runtime.config);
        let total = tables.len();

        reporter
            .update(|p| {
                p.stage = "syncing".to_string();
                p.total_tables = total;
                p.tables_completed = 0;
            })
            .await;
        self.log_line(run_log_id, &format!("starting sync of {total} tables"))
            .await;

        let mut summary = RunSummary::default();

        for (i, table) in tables.iter().enumerate() {
            cancel.check().await?;

            let name = table.qualified_name();
            let pct = ((i as f64 / total as f64) * 100.0) as i32;
            reporter
                .update(|p| {
                    p.current_table = name.clone();
                    p.tables_completed = i;
                    p.percentage = pct.clamp(0, 100) as u8;
                    p.current_table_total_records = None;
                    p.current_table_processed_records = Some(0);
                    p.current_table_percentage = None;
                })
                .await;
            let _ = self
                .runtime
                .status
                .update_progress(status_id, "syncing", pct)
                .await;
            self.log_line(
                run_log_id,
                &format!(
                    "syncing table {name} (incremental strategy: {:?})",
                    table.incremental_strategy
                ),
            )
            .await;

            SchemaReplicator::new(source, dest)
                .replicate(&table.schema_name, &table.table_name)
                .await?;

            let plan = build_sync_plan(job, table, source)
                .await
                .map_err(SyncError::Other)?;

            // Cancellation is polled before the potentially expensive count.
            cancel.check().await?;
            let planned_rows: u64 = match sqlx::query_scalar::<_, i64>(&count_query(&plan.sql))
                .fetch_one(source)
                .await
            {
                Ok(count) => count.max(0) as u64,
                Err(e) => {
                    warn!(table = %name, error = %e, "row count failed, proceeding without totals");
                    0
                }
            };
            reporter
                .update(|p| p.current_table_total_records = Some(planned_rows))
                .await;
            self.log_line(
                run_log_id,
                &format!("table {name}: {planned_rows} rows planned, query: {}", plan.sql),
            )
            .await;

            let dest_columns = DestColumn::fetch(dest, &table.schema_name, &table.table_name)
                .await
                .map_err(SyncError::Other)?;

            let strategy = select_strategy(&settings, &dest_columns, planned_rows, &name);
            let ctx = TableSync {
                job,
                table,
                source,
                dest,
                meta,
                dest_columns: &dest_columns,
                settings: &settings,
            };
            let records = strategy.sync_table(&ctx, &plan, reporter, cancel).await?;

            summary.tables_processed += 1;
            summary.records_transferred += records;

            let done_pct = (((i + 1) as f64 / total as f64) * 100.0) as i32;
            reporter
                .update(|p| {
                    p.tables_completed = summary.tables_processed;
                    p.percentage = done_pct.clamp(0, 100) as u8;
                })
                .await;
            let _ = self
                .runtime
                .status
                .update_progress(status_id, "syncing", done_pct)
                .await;
            self.log_line(
                run_log_id,
                &format!("table {name} synced, {records} records transferred"),
            )
            .await;
        }

        Ok(summary)
    }

    /// Open and ping one side of the transfer from its decrypted DSN.
    async fn open_side_pool(
        &self,
        connection_id: i64,
        role: &'static str,
    ) -> Result<PgPool, SyncError> {
        let record = DatabaseConnection::find_by_id(connection_id, &self.runtime.pool)
            .await
            .map_err(SyncError::Other)?
            .ok_or_else(|| SyncError::Connect {
                role,
                message: format!("connection {connection_id} not found"),
            })?;

        let dsn = self
            .runtime
            .crypto
            .decrypt(&record.connection_string_encrypted)
            .map_err(|e| SyncError::Connect {
                role,
                message: format!("failed to decrypt connection string: {e}"),
            })?;

        let pool = PgPoolOptions::new()
            .max_connections(self.runtime.config.max_workers)
            .connect(&dsn)
            .await
            .map_err(|e| SyncError::Connect {
                role,
                message: e.to_string(),
            })?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| SyncError::Connect {
                role,
                message: format!("ping failed: {e}"),
            })?;

        info!(role, connection = %record.name, "database connection established");
        Ok(pool)
    }

    /// Append to the run log, tolerating metadata-store hiccups.
    async fn log_line(&self, run_log_id: i64, message: &str) {
        if let Err(e) = RunLog::append_line(run_log_id, message, &self.runtime.pool).await {
            warn!(run_log_id, error = %e, "failed to append run log line");
        }
    }
}
