// src/services/maintenance/tasks/calculate_atr.rs

//! Task 4: 14-day ATR per symbol from `market_data_daily`, mirrored in
//! the Bus under `atr:{symbol}` and `atr:daily:{symbol}` with 24 h TTL.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::services::analytics::atr::atr_from_bars;
use crate::utils::errors::MaintenanceError;

const ATR_TTL_SECS: usize = 86_400;

pub async fn execute(
    pg: &PgPool,
    redis: &RedisPool,
    _target_date: NaiveDate,
    period: u32,
) -> Result<Value, MaintenanceError> {
    let symbols = queries::active_symbols(pg).await?;
    if symbols.is_empty() {
        return Err(MaintenanceError::Other("no active symbols in universe".into()));
    }

    let mut cached = 0usize;
    let mut insufficient = 0usize;

    for symbol in &symbols {
        let rows = queries::recent_daily_bars(pg, symbol, period as i64 + 1).await?;
        let bars: Vec<(f64, f64, f64)> = rows
            .iter()
            .filter_map(|r| match (r.high, r.low, r.close) {
                (Some(h), Some(l), Some(c)) => Some((h, l, c)),
                _ => None,
            })
            .collect();

        let Some((atr, atr_percent)) = atr_from_bars(&bars, period as usize) else {
            insufficient += 1;
            continue;
        };

        let fields = [
            ("atr", format!("{atr:.6}")),
            ("atr_percent", format!("{atr_percent:.4}")),
        ];
        for key in [format!("atr:{symbol}"), format!("atr:daily:{symbol}")] {
            if let Err(e) = redis.hset_all(key.as_str(), &fields, ATR_TTL_SECS).await {
                log::warn!("atr cache write failed for {symbol}: {e}");
            }
        }
        cached += 1;
    }

    log::info!("atr cached for {cached}/{} symbols ({insufficient} with too little history)", symbols.len());
    Ok(json!({
        "symbols": symbols.len(),
        "cached": cached,
        "insufficient_history": insufficient,
        "period": period,
    }))
}
