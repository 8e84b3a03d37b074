// src/services/maintenance/tasks/enrich_metadata.rs

//! Task 8: enrich warehouse metadata: market cap, sector, shares and
//! the rolling average-volume columns the filters bound against. The
//! Bus mirror is refreshed afterwards by sync_redis.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::queries;
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

const DETAIL_CONCURRENCY: usize = 10;

pub async fn execute(
    pg: &PgPool,
    client: &PolygonClient,
    _target_date: NaiveDate,
) -> Result<Value, MaintenanceError> {
    let mut rows = queries::all_ticker_rows(pg).await?;
    if rows.is_empty() {
        return Err(MaintenanceError::Other("empty ticker universe".into()));
    }

    // Vendor details fan-out with modest concurrency.
    let symbols: Vec<String> = rows.iter().map(|r| r.symbol.clone()).collect();
    let details = stream::iter(symbols)
        .map(|symbol| {
            let client = client.clone();
            async move { (symbol.clone(), client.ticker_details(&symbol).await) }
        })
        .buffer_unordered(DETAIL_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;
    let details: std::collections::HashMap<_, _> = details
        .into_iter()
        .filter_map(|(sym, res)| match res {
            Ok(Some(d)) => Some((sym, d)),
            _ => None,
        })
        .collect();

    let mut updated = 0usize;
    for row in rows.iter_mut() {
        if let Some(d) = details.get(&row.symbol) {
            row.company_name = d.name.clone().or(row.company_name.take());
            row.exchange = d.primary_exchange.clone().or(row.exchange.take());
            row.industry = d.sic_description.clone().or(row.industry.take());
            row.market_cap = d.market_cap.or(row.market_cap);
            row.shares_outstanding = d
                .weighted_shares_outstanding
                .or(d.share_class_shares_outstanding)
                .or(row.shares_outstanding);
        }

        // Average-volume columns from the daily history.
        let bars = queries::recent_daily_bars(pg, &row.symbol, 90).await?;
        let volumes: Vec<f64> = bars.iter().filter_map(|b| b.volume).collect();
        row.avg_volume_5d = avg_head(&volumes, 5);
        row.avg_volume_10d = avg_head(&volumes, 10);
        row.avg_volume_30d = avg_head(&volumes, 30);
        row.avg_volume_3m = avg_head(&volumes, 90);

        match queries::upsert_ticker(pg, row).await {
            Ok(()) => updated += 1,
            Err(e) => log::debug!("metadata upsert failed for {}: {e}", row.symbol),
        }
    }

    Ok(json!({
        "universe": rows.len(),
        "vendor_details": details.len(),
        "updated": updated,
    }))
}

fn avg_head(values: &[f64], n: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let head = &values[..values.len().min(n)];
    Some(head.iter().sum::<f64>() / head.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_head_uses_most_recent_prefix() {
        let v = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(avg_head(&v, 2), Some(15.0));
        assert_eq!(avg_head(&v, 10), Some(25.0));
        assert_eq!(avg_head(&[], 5), None);
    }
}
