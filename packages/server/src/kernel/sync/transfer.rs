//! Data-transfer strategies and the strategy selector.
//!
//! Two interchangeable strategies move rows source -> destination behind one
//! trait: the row-batch INSERT path (conflict-strategy aware) and the bulk
//! COPY path (fast, falls back to INSERT per batch on error). The selector
//! counts the planned rows and picks COPY above a threshold unless the
//! destination carries column types the bulk path cannot faithfully encode.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::{Config, TransferMode};
use crate::domains::jobs::{IncrementalStrategy, SyncJob, SyncMode, TargetTable};
use crate::kernel::progress::{ProgressBus, ProgressEvent};
use crate::kernel::status::StatusController;

use super::copy::CopyTransfer;
use super::error::SyncError;
use super::insert::InsertTransfer;
use super::query::SyncPlan;
use super::value::{DestColumn, SqlValue};

/// Tuning knobs shared by both strategies.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub batch_size: usize,
    pub copy_batch_size: usize,
    pub copy_row_threshold: u64,
    pub copy_timeout: Duration,
    /// COPY reports progress every this many batches to reduce
    /// status-write pressure.
    pub progress_update_interval: usize,
    pub mode: TransferMode,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            copy_batch_size: config.copy_batch_size.max(1),
            copy_row_threshold: config.copy_row_threshold,
            copy_timeout: Duration::from_secs(config.copy_timeout_secs),
            progress_update_interval: 10,
            mode: config.transfer_mode,
        }
    }
}

/// Everything a strategy needs to sync one table.
pub struct TableSync<'a> {
    pub job: &'a SyncJob,
    pub table: &'a TargetTable,
    pub source: &'a PgPool,
    pub dest: &'a PgPool,
    /// Metadata store, for watermark persistence.
    pub meta: &'a PgPool,
    pub dest_columns: &'a [DestColumn],
    pub settings: &'a TransferSettings,
}

impl TableSync<'_> {
    pub fn qualified_name(&self) -> String {
        self.table.qualified_name()
    }

    pub fn dest_column(&self, name: &str) -> Option<&DestColumn> {
        self.dest_columns.iter().find(|c| c.name == name)
    }
}

/// Cooperative cancellation probe polled at batch boundaries.
pub struct CancelProbe {
    controller: StatusController,
    status_id: i64,
}

impl CancelProbe {
    pub fn new(controller: StatusController, status_id: i64) -> Self {
        Self {
            controller,
            status_id,
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled(self.status_id).await
    }

    /// Raise `Cancelled` when a stop was requested.
    pub async fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled().await {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Mutable run-progress state published to the ProgressBus.
pub struct ProgressReporter {
    bus: ProgressBus,
    job_id: i64,
    state: Mutex<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(bus: ProgressBus, job_id: i64) -> Self {
        Self {
            bus,
            job_id,
            state: Mutex::new(ProgressEvent {
                stage: "initializing".to_string(),
                ..Default::default()
            }),
        }
    }

    /// Apply a mutation to the progress state and publish the result.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut ProgressEvent),
    {
        let event = {
            let mut state = self.state.lock().expect("progress state poisoned");
            mutate(&mut state);
            state.clone()
        };
        self.bus.publish(self.job_id, event).await;
    }

    pub fn snapshot(&self) -> ProgressEvent {
        self.state.lock().expect("progress state poisoned").clone()
    }
}

/// Fold a table's written-row count into the run progress and publish.
pub(crate) async fn report_table_progress(progress: &ProgressReporter, table_written: u64) {
    progress
        .update(|p| {
            let before = p.current_table_processed_records.unwrap_or(0);
            let delta = table_written.saturating_sub(before);
            p.records_processed += delta;
            p.current_table_processed_records = Some(table_written);
            if let Some(total) = p.current_table_total_records.filter(|t| *t > 0) {
                let pct = ((table_written as f64 / total as f64) * 100.0) as u8;
                p.current_table_percentage = Some(pct.min(100));
            }
        })
        .await;
}

/// A strategy that moves one table's rows.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Sync the table, returning the number of records written.
    async fn sync_table(
        &self,
        ctx: &TableSync<'_>,
        plan: &SyncPlan,
        progress: &ProgressReporter,
        cancel: &CancelProbe,
    ) -> Result<u64, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrategyKind {
    Copy,
    Insert,
}

pub(crate) fn pick_strategy(
    settings: &TransferSettings,
    dest_columns: &[DestColumn],
    planned_rows: u64,
) -> StrategyKind {
    match settings.mode {
        TransferMode::Copy => StrategyKind::Copy,
        TransferMode::Insert => StrategyKind::Insert,
        TransferMode::Auto => {
            let complex = dest_columns.iter().any(|c| c.is_complex());
            if planned_rows > settings.copy_row_threshold && !complex {
                StrategyKind::Copy
            } else {
                StrategyKind::Insert
            }
        }
    }
}

/// Pick a strategy for this table.
pub fn select_strategy(
    settings: &TransferSettings,
    dest_columns: &[DestColumn],
    planned_rows: u64,
    table: &str,
) -> Box<dyn DataTransfer> {
    let kind = pick_strategy(settings, dest_columns, planned_rows);
    info!(table, planned_rows, strategy = ?kind, "selected transfer strategy");
    match kind {
        StrategyKind::Copy => Box::new(CopyTransfer),
        StrategyKind::Insert => Box::new(InsertTransfer),
    }
}

/// Pre-transfer clearing: FULL mode (or a table with no incremental
/// strategy) truncates the destination, falling back to DELETE when
/// truncation is not possible.
pub async fn prepare_destination(ctx: &TableSync<'_>) -> Result<(), SyncError> {
    let full_refresh = ctx.job.sync_mode == SyncMode::Full
        || ctx.table.incremental_strategy == IncrementalStrategy::None;
    if !full_refresh {
        return Ok(());
    }

    let table = ctx.qualified_name();
    let truncate = format!("TRUNCATE TABLE {table} RESTART IDENTITY CASCADE");
    if let Err(e) = sqlx::query(&truncate).execute(ctx.dest).await {
        warn!(table = %table, error = %e, "truncate failed, falling back to DELETE");
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(ctx.dest)
            .await
            .map_err(|e| SyncError::Transfer {
                table: table.clone(),
                message: format!("failed to clear destination table: {e}"),
            })?;
    }
    info!(table = %table, "destination table cleared");
    Ok(())
}

/// Running max of the incremental field over emitted rows; persisted as a
/// string after the final successful batch.
pub struct WatermarkTracker {
    field: Option<String>,
    max: Option<SqlValue>,
}

impl WatermarkTracker {
    pub fn new(field: Option<String>) -> Self {
        Self { field, max: None }
    }

    pub fn observe(&mut self, row: &[(String, SqlValue)]) {
        let Some(field) = self.field.as_deref() else {
            return;
        };
        let Some((_, value)) = row.iter().find(|(name, _)| name == field) else {
            return;
        };
        if value.is_null() {
            return;
        }
        let advance = match &self.max {
            Some(current) => value.watermark_cmp(current) == std::cmp::Ordering::Greater,
            None => true,
        };
        if advance {
            self.max = Some(value.clone());
        }
    }

    /// String form of the observed max, if any row carried the field.
    pub fn value(&self) -> Option<String> {
        self.max.as_ref().and_then(|v| v.to_text())
    }

    /// Persist the watermark. No-op for an empty emit, so a run that read
    /// nothing leaves the prior watermark untouched.
    pub async fn persist(&self, ctx: &TableSync<'_>) -> Result<(), SyncError> {
        let Some(value) = self.value() else {
            return Ok(());
        };
        crate::domains::jobs::TargetTable::update_last_sync_value(ctx.table.id, &value, ctx.meta)
            .await
            .map_err(|e| SyncError::Transfer {
                table: ctx.qualified_name(),
                message: format!("failed to persist watermark: {e}"),
            })?;
        info!(table = %ctx.qualified_name(), watermark = %value, "advanced incremental watermark");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: TransferMode) -> TransferSettings {
        TransferSettings {
            batch_size: 1_000,
            copy_batch_size: 50_000,
            copy_row_threshold: 100_000,
            copy_timeout: Duration::from_secs(300),
            progress_update_interval: 10,
            mode,
        }
    }

    fn plain_col(name: &str) -> DestColumn {
        DestColumn {
            name: name.to_string(),
            data_type: "integer".to_string(),
            udt_name: "int4".to_string(),
        }
    }

    fn array_col(name: &str) -> DestColumn {
        DestColumn {
            name: name.to_string(),
            data_type: "ARRAY".to_string(),
            udt_name: "_text".to_string(),
        }
    }

    #[test]
    fn watermark_tracks_running_max() {
        let mut tracker = WatermarkTracker::new(Some("id".to_string()));
        for id in [8i64, 12, 9, 11] {
            tracker.observe(&[("id".to_string(), SqlValue::Int(id))]);
        }
        assert_eq!(tracker.value().unwrap(), "12");
    }

    #[test]
    fn watermark_ignores_nulls_and_missing_fields() {
        let mut tracker = WatermarkTracker::new(Some("id".to_string()));
        tracker.observe(&[("id".to_string(), SqlValue::Null)]);
        tracker.observe(&[("other".to_string(), SqlValue::Int(99))]);
        assert!(tracker.value().is_none());

        let mut untracked = WatermarkTracker::new(None);
        untracked.observe(&[("id".to_string(), SqlValue::Int(5))]);
        assert!(untracked.value().is_none());
    }

    #[test]
    fn auto_mode_picks_copy_only_for_large_simple_tables() {
        let s = settings(TransferMode::Auto);
        let plain = [plain_col("id")];
        let complex = [plain_col("id"), array_col("tags")];

        assert_eq!(pick_strategy(&s, &plain, 10), StrategyKind::Insert);
        assert_eq!(pick_strategy(&s, &plain, 200_000), StrategyKind::Copy);
        assert_eq!(pick_strategy(&s, &complex, 200_000), StrategyKind::Insert);
    }

    #[test]
    fn explicit_modes_override_the_row_count() {
        let plain = [plain_col("id")];
        assert_eq!(
            pick_strategy(&settings(TransferMode::Copy), &plain, 1),
            StrategyKind::Copy
        );
        assert_eq!(
            pick_strategy(&settings(TransferMode::Insert), &plain, 1_000_000),
            StrategyKind::Insert
        );
    }

    #[tokio::test]
    async fn progress_reporter_publishes_mutations() {
        let bus = ProgressBus::new();
        let (_, mut rx) = bus.subscribe(3).await;
        let reporter = ProgressReporter::new(bus, 3);

        reporter
            .update(|p| {
                p.stage = "syncing".to_string();
                p.records_processed = 42;
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.stage, "syncing");
        assert_eq!(event.records_processed, 42);
        assert_eq!(reporter.snapshot().records_processed, 42);
    }
}
