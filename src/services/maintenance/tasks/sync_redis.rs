// src/services/maintenance/tasks/sync_redis.rs

//! Task 12: refresh the Bus metadata mirror from the Warehouse,
//! `ticker:metadata:{symbol}` (24 h TTL) plus the `ticker:universe`
//! set, so the scanner's next tick reads fresh reference data.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::models::scanner::TickerMetadata;
use crate::services::maintenance::tasks::sync_ticker_universe::UNIVERSE_KEY;
use crate::utils::errors::MaintenanceError;

const METADATA_TTL_SECS: usize = 86_400;

pub async fn execute(
    pg: &PgPool,
    redis: &RedisPool,
    _target_date: NaiveDate,
) -> Result<Value, MaintenanceError> {
    let rows = queries::all_ticker_rows(pg).await?;
    if rows.is_empty() {
        return Err(MaintenanceError::Other("empty ticker universe".into()));
    }

    let mut mirrored = 0usize;
    let mut symbols = Vec::with_capacity(rows.len());

    for row in &rows {
        let meta = TickerMetadata {
            symbol: row.symbol.clone(),
            company_name: row.company_name.clone(),
            exchange: row.exchange.clone(),
            sector: row.sector.clone(),
            industry: row.industry.clone(),
            market_cap: row.market_cap,
            shares_outstanding: row.shares_outstanding,
            float_shares: row.float_shares,
            avg_volume_3m: row.avg_volume_3m,
            avg_volume_10d: row.avg_volume_10d,
            avg_volume_30d: row.avg_volume_30d,
            avg_volume_5d: row.avg_volume_5d,
            beta: row.beta,
            is_etf: row.is_etf,
            is_actively_trading: row.is_actively_trading,
        };
        let key = format!("ticker:metadata:{}", row.symbol);
        match redis.set_json(&key, &meta, METADATA_TTL_SECS).await {
            Ok(()) => {
                mirrored += 1;
                symbols.push(row.symbol.clone());
            }
            Err(e) => log::debug!("metadata mirror failed for {}: {e}", row.symbol),
        }
    }

    if let Err(e) = redis.replace_set(UNIVERSE_KEY, &symbols, 0).await {
        log::warn!("universe set refresh failed: {e}");
    }

    log::info!("redis mirror refreshed: {mirrored}/{} symbols", rows.len());
    Ok(json!({"universe": rows.len(), "mirrored": mirrored}))
}
