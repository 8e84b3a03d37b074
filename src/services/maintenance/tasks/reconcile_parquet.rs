// src/services/maintenance/tasks/reconcile_parquet.rs

//! Task 10: apply the same split correction to the on-disk Parquet
//! flat files (`/data/polygon/day_aggs/{YYYY-MM-DD}.parquet`) that a
//! sibling screener service reads. The vendor does not regenerate old
//! flat files right after a split, so pre-split files keep raw prices.
//!
//! Factor detection compares the Parquet close against the warehouse
//! close (source of truth, already adjusted by reconcile_splits) for
//! the last pre-split day. Correction: open/high/low/close × factor,
//! volume ÷ factor, transactions and window_start untouched. Files are
//! rewritten to a temp path and atomically renamed.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::queries;
use crate::services::maintenance::tasks::reconcile_splits::{
    significant_splits, MISMATCH_TOLERANCE, RATIO_CONFIRMATION_TOLERANCE, SPLIT_LOOKBACK_DAYS,
};
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

const PRICE_COLUMNS: &[&str] = &["open", "high", "low", "close"];

pub async fn execute(
    pg: &PgPool,
    client: &PolygonClient,
    target_date: NaiveDate,
    parquet_dir: &str,
) -> Result<Value, MaintenanceError> {
    let dir = Path::new(parquet_dir);
    if !dir.is_dir() {
        return Err(MaintenanceError::Other(format!(
            "parquet directory not found: {parquet_dir}"
        )));
    }

    let since = target_date - Duration::days(SPLIT_LOOKBACK_DAYS);
    let splits = client.splits(since, target_date).await?;
    let significant = significant_splits(&splits);
    if significant.is_empty() {
        return Ok(json!({"splits_found": splits.len(), "tickers_fixed": 0, "files_updated": 0}));
    }

    let files = list_parquet_files(dir)?;
    if files.is_empty() {
        return Ok(json!({"splits_found": splits.len(), "tickers_fixed": 0, "files_updated": 0}));
    }

    let mut tickers_fixed = 0usize;
    let mut files_updated = 0usize;

    for (ticker, exec_date, expected_factor) in &significant {
        // Reference: last pre-split day present in BOTH the warehouse
        // and the flat files.
        let pre_split: Vec<&(NaiveDate, PathBuf)> =
            files.iter().filter(|(d, _)| d < exec_date).collect();
        let Some((ref_date, ref_path)) = pre_split.last().copied() else {
            continue;
        };
        let Some(warehouse_close) = queries::close_on_date(pg, ticker, *ref_date).await? else {
            continue;
        };
        let Some(parquet_close) = read_close(ref_path, ticker)? else {
            continue;
        };
        if parquet_close <= 0.0 || warehouse_close <= 0.0 {
            continue;
        }

        let detected = warehouse_close / parquet_close;
        if (detected - 1.0).abs() <= MISMATCH_TOLERANCE {
            log::debug!("{ticker}: flat files already adjusted (factor {detected:.4})");
            continue;
        }
        let ratio_diff = (detected - expected_factor).abs() / expected_factor;
        if ratio_diff > RATIO_CONFIRMATION_TOLERANCE {
            log::warn!(
                "{ticker}: parquet factor {detected:.4} deviates from declared {expected_factor:.4}, using detected"
            );
        }

        let mut updated_for_ticker = 0usize;
        for (_, path) in &pre_split {
            match rewrite_file(path, ticker, detected) {
                Ok(true) => updated_for_ticker += 1,
                Ok(false) => {}
                Err(e) => log::warn!("{ticker}: rewrite of {:?} failed: {e}", path),
            }
        }
        if updated_for_ticker > 0 {
            log::info!(
                "{ticker}: corrected {updated_for_ticker} flat files before {exec_date} by {detected:.4}"
            );
            tickers_fixed += 1;
            files_updated += updated_for_ticker;
        }
    }

    Ok(json!({
        "splits_found": splits.len(),
        "significant": significant.len(),
        "tickers_fixed": tickers_fixed,
        "files_updated": files_updated,
    }))
}

/// Daily files named `{YYYY-MM-DD}.parquet`, sorted by date.
fn list_parquet_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, MaintenanceError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
            continue;
        }
        if let Ok(date) = stem.parse::<NaiveDate>() {
            files.push((date, path));
        }
    }
    files.sort_by_key(|(d, _)| *d);
    Ok(files)
}

/// Close for one ticker in one daily file.
fn read_close(path: &Path, ticker: &str) -> Result<Option<f64>, MaintenanceError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    for batch in reader {
        let batch = batch?;
        let Some(row) = find_ticker_row(&batch, ticker)? else {
            continue;
        };
        let close_idx = batch
            .schema()
            .index_of("close")
            .map_err(|e| MaintenanceError::Parquet(e.to_string()))?;
        let close = cast(batch.column(close_idx), &DataType::Float64)?;
        let close = close
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| MaintenanceError::Parquet("close column not numeric".into()))?;
        if close.is_null(row) {
            return Ok(None);
        }
        return Ok(Some(close.value(row)));
    }
    Ok(None)
}

fn find_ticker_row(batch: &RecordBatch, ticker: &str) -> Result<Option<usize>, MaintenanceError> {
    let idx = batch
        .schema()
        .index_of("ticker")
        .map_err(|e| MaintenanceError::Parquet(e.to_string()))?;
    let col = batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| MaintenanceError::Parquet("ticker column not utf8".into()))?;
    for row in 0..col.len() {
        if !col.is_null(row) && col.value(row) == ticker {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

/// Rewrite one file with the correction applied to `ticker`'s rows.
/// Returns false when the ticker does not appear in the file.
fn rewrite_file(path: &Path, ticker: &str, factor: f64) -> Result<bool, MaintenanceError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut batches = Vec::new();
    let mut touched = false;
    let mut schema = None;

    for batch in reader {
        let batch = batch?;
        if schema.is_none() {
            schema = Some(batch.schema());
        }
        let (batch, changed) = correct_batch(&batch, ticker, factor)?;
        touched |= changed;
        batches.push(batch);
    }

    if !touched {
        return Ok(false);
    }
    let schema = schema.ok_or_else(|| MaintenanceError::Parquet("empty parquet file".into()))?;

    let tmp_path = path.with_extension("parquet.tmp");
    {
        let tmp = File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(tmp, schema, None)?;
        for batch in &batches {
            writer.write(batch)?;
        }
        writer.close()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(true)
}

/// Scale the matching rows of one batch: prices × factor,
/// volume ÷ factor (rounded). Column types are preserved by casting
/// back to the original schema type.
fn correct_batch(
    batch: &RecordBatch,
    ticker: &str,
    factor: f64,
) -> Result<(RecordBatch, bool), MaintenanceError> {
    let schema = batch.schema();
    let ticker_idx = schema
        .index_of("ticker")
        .map_err(|e| MaintenanceError::Parquet(e.to_string()))?;
    let tickers = batch
        .column(ticker_idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| MaintenanceError::Parquet("ticker column not utf8".into()))?;

    let mask: Vec<bool> = (0..tickers.len())
        .map(|i| !tickers.is_null(i) && tickers.value(i) == ticker)
        .collect();
    if !mask.iter().any(|m| *m) {
        return Ok((batch.clone(), false));
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for (idx, field) in schema.fields().iter().enumerate() {
        let name = field.name().as_str();
        let column = batch.column(idx);
        let scaled: ArrayRef = if PRICE_COLUMNS.contains(&name) {
            scale_column(column, field.data_type(), &mask, factor, false)?
        } else if name == "volume" {
            scale_column(column, field.data_type(), &mask, 1.0 / factor, true)?
        } else {
            column.clone()
        };
        columns.push(scaled);
    }

    let corrected = RecordBatch::try_new(schema, columns)?;
    Ok((corrected, true))
}

fn scale_column(
    column: &ArrayRef,
    original_type: &DataType,
    mask: &[bool],
    factor: f64,
    round: bool,
) -> Result<ArrayRef, MaintenanceError> {
    let as_f64 = cast(column, &DataType::Float64)?;
    let values = as_f64
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| MaintenanceError::Parquet("column not castable to f64".into()))?;

    let scaled: Float64Array = (0..values.len())
        .map(|i| {
            if values.is_null(i) {
                None
            } else if mask[i] {
                let v = values.value(i) * factor;
                Some(if round { v.round() } else { v })
            } else {
                Some(values.value(i))
            }
        })
        .collect();

    let back = cast(&(Arc::new(scaled) as ArrayRef), original_type)?;
    Ok(back)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, UInt64Array};
    use arrow::datatypes::{Field, Schema};

    fn day_aggs_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("ticker", DataType::Utf8, false),
            Field::new("open", DataType::Float64, true),
            Field::new("high", DataType::Float64, true),
            Field::new("low", DataType::Float64, true),
            Field::new("close", DataType::Float64, true),
            Field::new("volume", DataType::UInt64, true),
            Field::new("transactions", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["QQQQ", "AAPL"])),
                Arc::new(Float64Array::from(vec![1.18, 180.0])),
                Arc::new(Float64Array::from(vec![1.25, 181.0])),
                Arc::new(Float64Array::from(vec![1.10, 179.0])),
                Arc::new(Float64Array::from(vec![1.20, 180.5])),
                Arc::new(UInt64Array::from(vec![1_000_000, 50_000_000])),
                Arc::new(Int64Array::from(vec![4_200, 90_000])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn correction_scales_only_the_split_ticker() {
        let batch = day_aggs_batch();
        let (fixed, changed) = correct_batch(&batch, "QQQQ", 10.0).unwrap();
        assert!(changed);

        let close = fixed
            .column(4)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert!((close.value(0) - 12.0).abs() < 1e-9);
        assert!((close.value(1) - 180.5).abs() < 1e-9); // untouched

        let volume = fixed
            .column(5)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(volume.value(0), 100_000); // ÷ 10, type preserved
        assert_eq!(volume.value(1), 50_000_000);

        let transactions = fixed
            .column(6)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(transactions.value(0), 4_200); // never adjusted
    }

    #[test]
    fn batch_without_the_ticker_is_untouched() {
        let batch = day_aggs_batch();
        let (same, changed) = correct_batch(&batch, "ZZZZ", 10.0).unwrap();
        assert!(!changed);
        assert_eq!(same.num_rows(), batch.num_rows());
    }

    #[test]
    fn find_ticker_row_locates_symbols() {
        let batch = day_aggs_batch();
        assert_eq!(find_ticker_row(&batch, "AAPL").unwrap(), Some(1));
        assert_eq!(find_ticker_row(&batch, "MSFT").unwrap(), None);
    }
}
