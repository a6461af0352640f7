//! Bulk COPY transfer strategy.
//!
//! Streams extraction batches into the destination through `COPY ... FROM
//! STDIN` in text format (tab delimiter, `\N` null, backslash escapes).
//! JSON values are embedded as compact text fields. A failed copy falls
//! back to the row-batch insert path for that batch, so IGNORE/REPLACE/SKIP
//! semantics are preserved; progress is reported every few batches to keep
//! status-write pressure low.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::PgPoolCopyExt;
use tracing::warn;

use super::error::SyncError;
use super::insert::BatchInserter;
use super::query::SyncPlan;
use super::transfer::{
    prepare_destination, report_table_progress, CancelProbe, DataTransfer, ProgressReporter,
    TableSync, WatermarkTracker,
};
use super::value::{decode_row, encode_for_column, SqlValue};

pub struct CopyTransfer;

#[async_trait]
impl DataTransfer for CopyTransfer {
    async fn sync_table(
        &self,
        ctx: &TableSync<'_>,
        plan: &SyncPlan,
        progress: &ProgressReporter,
        cancel: &CancelProbe,
    ) -> Result<u64, SyncError> {
        prepare_destination(ctx).await?;

        // The fallback writer is resolved up front so a mid-stream copy
        // failure does not additionally have to discover the destination PK.
        let mut fallback = BatchInserter::prepare(ctx).await?;
        let mut watermark = WatermarkTracker::new(plan.incremental_field.clone());

        let mut stream = sqlx::query(&plan.sql).fetch(ctx.source);
        let mut columns: Vec<String> = Vec::new();
        let mut batch: Vec<Vec<(String, SqlValue)>> = Vec::new();
        let mut written: u64 = 0;
        let mut batches_flushed: usize = 0;

        while let Some(row) = stream.try_next().await.map_err(|e| SyncError::Transfer {
            table: ctx.qualified_name(),
            message: format!("source read failed: {e}"),
        })? {
            let decoded = decode_row(&row);
            if columns.is_empty() {
                columns = decoded.iter().map(|(name, _)| name.clone()).collect();
            }
            watermark.observe(&decoded);
            batch.push(decoded);

            if batch.len() >= ctx.settings.copy_batch_size {
                cancel.check().await?;
                written += flush_batch(ctx, &mut fallback, &columns, &batch).await?;
                batch.clear();
                batches_flushed += 1;
                if batches_flushed % ctx.settings.progress_update_interval == 0 {
                    report_table_progress(progress, written).await;
                }
            }
        }

        if !batch.is_empty() {
            cancel.check().await?;
            written += flush_batch(ctx, &mut fallback, &columns, &batch).await?;
        }
        report_table_progress(progress, written).await;

        watermark.persist(ctx).await?;
        Ok(written)
    }
}

/// Copy one batch, degrading to the insert path when the bulk load fails.
async fn flush_batch(
    ctx: &TableSync<'_>,
    fallback: &mut BatchInserter,
    columns: &[String],
    batch: &[Vec<(String, SqlValue)>],
) -> Result<u64, SyncError> {
    match copy_batch(ctx, columns, batch).await {
        Ok(rows) => Ok(rows),
        Err(e) => {
            warn!(
                table = %ctx.qualified_name(),
                rows = batch.len(),
                error = %e,
                "copy failed, falling back to batch insert"
            );
            fallback.write(ctx, columns, batch).await
        }
    }
}

async fn copy_batch(
    ctx: &TableSync<'_>,
    columns: &[String],
    batch: &[Vec<(String, SqlValue)>],
) -> anyhow::Result<u64> {
    let statement = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        ctx.qualified_name(),
        columns.join(", ")
    );
    let buffer = encode_copy_buffer(ctx, columns, batch);

    let copy_all = async {
        let mut sink = ctx.dest.copy_in_raw(&statement).await?;
        sink.send(buffer.as_slice()).await?;
        let rows = sink.finish().await?;
        Ok::<u64, sqlx::Error>(rows)
    };

    let rows = tokio::time::timeout(ctx.settings.copy_timeout, copy_all)
        .await
        .map_err(|_| anyhow::anyhow!("copy timed out after {:?}", ctx.settings.copy_timeout))??;
    Ok(rows)
}

/// Render a batch as COPY text rows.
fn encode_copy_buffer(
    ctx: &TableSync<'_>,
    columns: &[String],
    batch: &[Vec<(String, SqlValue)>],
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(batch.len() * 64);
    for row in batch {
        for (idx, column) in columns.iter().enumerate() {
            if idx > 0 {
                buffer.push(b'\t');
            }
            let value = row.get(idx).map(|(_, v)| v).unwrap_or(&SqlValue::Null);
            let encoded = match ctx.dest_column(column) {
                Some(col) => encode_for_column(value, col),
                None => value.to_text(),
            };
            match encoded {
                Some(text) => buffer.extend_from_slice(copy_escape(&text).as_bytes()),
                None => buffer.extend_from_slice(b"\\N"),
            }
        }
        buffer.push(b'\n');
    }
    buffer
}

/// Escape a text field for COPY text format: backslash, tab, newline and
/// carriage return.
pub(crate) fn copy_escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_copy_control_characters() {
        assert_eq!(copy_escape("plain"), "plain");
        assert_eq!(copy_escape("a\tb"), "a\\tb");
        assert_eq!(copy_escape("line1\nline2"), "line1\\nline2");
        assert_eq!(copy_escape("cr\rhere"), "cr\\rhere");
        assert_eq!(copy_escape("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn backslash_escapes_before_specials_do_not_double_process() {
        // A literal backslash followed by 't' must stay distinguishable
        // from an escaped tab.
        assert_eq!(copy_escape("\\t"), "\\\\t");
        assert_eq!(copy_escape("\t"), "\\t");
    }
}
