// src/services/maintenance/tasks/sync_ticker_universe.rs

//! Task 7: sync the ticker universe with the vendor (add new listings,
//! deactivate delistings, refresh names) and rebuild the
//! `ticker:universe` Bus set.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::models::TickerRow;
use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

pub const UNIVERSE_KEY: &str = "ticker:universe";
const PAGE_LIMIT: usize = 1_000;

pub async fn execute(
    pg: &PgPool,
    redis: &RedisPool,
    client: &PolygonClient,
    _target_date: NaiveDate,
) -> Result<Value, MaintenanceError> {
    let listed = client.active_tickers(PAGE_LIMIT).await?;
    if listed.is_empty() {
        return Err(MaintenanceError::Other("vendor returned empty ticker list".into()));
    }

    let mut upserted = 0usize;
    let mut symbols = Vec::with_capacity(listed.len());
    for details in &listed {
        let Some(symbol) = details.ticker.clone() else { continue };
        let row = TickerRow {
            symbol: symbol.clone(),
            company_name: details.name.clone(),
            exchange: details.primary_exchange.clone(),
            sector: None,
            industry: details.sic_description.clone(),
            market_cap: details.market_cap,
            shares_outstanding: details
                .weighted_shares_outstanding
                .or(details.share_class_shares_outstanding),
            float_shares: None,
            avg_volume_5d: None,
            avg_volume_10d: None,
            avg_volume_30d: None,
            avg_volume_3m: None,
            beta: None,
            is_etf: details.ticker_type.as_deref() == Some("ETF"),
            is_actively_trading: details.active.unwrap_or(true),
            updated_at: None,
        };
        match queries::upsert_ticker(pg, &row).await {
            Ok(()) => {
                upserted += 1;
                symbols.push(symbol);
            }
            Err(e) => log::debug!("ticker upsert failed for {symbol}: {e}"),
        }
    }

    let deactivated = queries::deactivate_delisted(pg, &symbols).await?;

    if let Err(e) = redis.replace_set(UNIVERSE_KEY, &symbols, 0).await {
        log::warn!("universe set refresh failed: {e}");
    }

    Ok(json!({
        "listed": listed.len(),
        "upserted": upserted,
        "deactivated": deactivated,
    }))
}
