// src/services/maintenance/tasks/export_screener.rs

//! Task 11: export a compressed columnar metadata snapshot for the
//! screener sibling service.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::models::TickerRow;
use crate::db::queries;
use crate::utils::errors::MaintenanceError;

pub async fn execute(
    pg: &PgPool,
    _target_date: NaiveDate,
    export_dir: &str,
) -> Result<Value, MaintenanceError> {
    let rows = queries::all_ticker_rows(pg).await?;
    if rows.is_empty() {
        return Err(MaintenanceError::Other("empty ticker universe".into()));
    }

    std::fs::create_dir_all(export_dir)?;
    let path = Path::new(export_dir).join("ticker_metadata.parquet");
    let written = write_metadata_parquet(&rows, &path)?;

    log::info!("screener metadata exported: {written} rows to {:?}", path);
    Ok(json!({"rows": written, "path": path.to_string_lossy()}))
}

pub fn write_metadata_parquet(rows: &[TickerRow], path: &Path) -> Result<usize, MaintenanceError> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("company_name", DataType::Utf8, true),
        Field::new("exchange", DataType::Utf8, true),
        Field::new("sector", DataType::Utf8, true),
        Field::new("industry", DataType::Utf8, true),
        Field::new("market_cap", DataType::Float64, true),
        Field::new("shares_outstanding", DataType::Float64, true),
        Field::new("float_shares", DataType::Float64, true),
        Field::new("avg_volume_30d", DataType::Float64, true),
        Field::new("avg_volume_3m", DataType::Float64, true),
        Field::new("is_etf", DataType::Boolean, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.symbol.as_str()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.company_name.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.exchange.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.sector.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.industry.as_deref()))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.market_cap))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.shares_outstanding))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.float_shares))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.avg_volume_30d))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.avg_volume_3m))),
        Arc::new(BooleanArray::from_iter(rows.iter().map(|r| Some(r.is_etf)))),
    ];

    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;

    fn ticker(symbol: &str) -> TickerRow {
        TickerRow {
            symbol: symbol.into(),
            company_name: Some(format!("{symbol} Inc")),
            exchange: Some("XNAS".into()),
            sector: None,
            industry: None,
            market_cap: Some(1e9),
            shares_outstanding: None,
            float_shares: Some(5e7),
            avg_volume_5d: None,
            avg_volume_10d: None,
            avg_volume_30d: Some(1e6),
            avg_volume_3m: None,
            beta: None,
            is_etf: false,
            is_actively_trading: true,
            updated_at: None,
        }
    }

    #[test]
    fn export_round_trips_through_parquet() {
        let dir = std::env::temp_dir().join("tickerscan_export_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ticker_metadata.parquet");

        let rows = vec![ticker("AAPL"), ticker("TSLA")];
        let written = write_metadata_parquet(&rows, &path).unwrap();
        assert_eq!(written, 2);

        // Read back and verify the symbol column survived.
        let file = File::open(&path).unwrap();
        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batch = reader.into_iter().next().unwrap().unwrap();
        let symbols = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(symbols.value(0), "AAPL");
        assert_eq!(symbols.value(1), "TSLA");

        std::fs::remove_file(&path).ok();
    }
}
