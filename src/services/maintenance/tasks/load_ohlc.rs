// src/services/maintenance/tasks/load_ohlc.rs

//! Task 2: load the day's OHLCV from the vendor's grouped-daily
//! endpoint into `market_data_daily`. Skips cleanly when the day is
//! already complete, so a recovery re-run is a no-op.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::models::DailyBarRow;
use crate::db::queries;
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

/// A normal session covers thousands of symbols; fewer rows than this
/// means the load never happened.
const ALREADY_COMPLETE_MIN: i64 = 5_000;

pub async fn execute(
    pg: &PgPool,
    client: &PolygonClient,
    target_date: NaiveDate,
) -> Result<Value, MaintenanceError> {
    let existing = queries::count_daily_bars(pg, target_date).await?;
    if existing >= ALREADY_COMPLETE_MIN {
        log::info!("ohlc for {target_date} already loaded ({existing} rows)");
        return Ok(json!({"skipped": true, "existing_rows": existing}));
    }

    let bars = client.grouped_daily(target_date).await?;
    if bars.is_empty() {
        return Err(MaintenanceError::Other(format!(
            "vendor returned no daily bars for {target_date}"
        )));
    }

    let mut inserted = 0usize;
    let mut skipped = 0usize;
    for bar in &bars {
        let Some(ticker) = bar.ticker.clone() else {
            skipped += 1;
            continue;
        };
        let row = DailyBarRow {
            symbol: ticker,
            trading_date: target_date,
            open: bar.o,
            high: bar.h,
            low: bar.l,
            close: bar.c,
            volume: bar.v,
            vwap: bar.vw,
            trades_count: bar.n.map(|n| n as i64),
        };
        match queries::upsert_daily_bar(pg, &row).await {
            Ok(()) => inserted += 1,
            Err(e) => {
                skipped += 1;
                log::debug!("daily bar upsert failed for {}: {e}", row.symbol);
            }
        }
    }

    Ok(json!({
        "fetched": bars.len(),
        "inserted": inserted,
        "skipped": skipped,
    }))
}
