// src/services/maintenance/tasks/calculate_trades_baselines.rs

//! Task 6: per-symbol mean + stdev of daily trade counts over the last
//! K trading days, for the Z-score anomaly detector. Bus hash
//! `trades:baseline:{symbol}:{days}` with a 14 h TTL: enough to cover
//! the trading day, gone before the next rebuild.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sqlx::PgPool;
use statrs::statistics::{Data, Distribution};

use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::services::analytics::anomaly::BASELINE_PREFIX;
use crate::utils::errors::MaintenanceError;

const BASELINE_TTL_SECS: usize = 50_400; // 14 h
const MIN_DAYS_REQUIRED: usize = 3;

pub async fn execute(
    pg: &PgPool,
    redis: &RedisPool,
    _target_date: NaiveDate,
    lookback_days: u32,
) -> Result<Value, MaintenanceError> {
    // Stale baselines from the prior build go first.
    match redis.delete_pattern(&format!("{BASELINE_PREFIX}:*")).await {
        Ok(n) => log::info!("cleared {n} stale trade baselines"),
        Err(e) => log::warn!("baseline clear failed: {e}"),
    }

    let symbols = queries::symbols_with_trades_data(pg, MIN_DAYS_REQUIRED as i64).await?;
    if symbols.is_empty() {
        return Err(MaintenanceError::Other(
            "no symbols with trade-count history".into(),
        ));
    }

    let mut written = 0usize;
    let mut insufficient = 0usize;

    for symbol in &symbols {
        let totals = queries::daily_trade_totals(pg, symbol, lookback_days as i64).await?;
        let Some((avg, std, days)) = baseline_stats(&totals) else {
            insufficient += 1;
            continue;
        };

        let key = format!("{BASELINE_PREFIX}:{symbol}:{lookback_days}");
        let fields = [
            ("avg", format!("{avg:.2}")),
            ("std", format!("{std:.2}")),
            ("days", days.to_string()),
        ];
        match redis.hset_all(key.as_str(), &fields, BASELINE_TTL_SECS).await {
            Ok(()) => written += 1,
            Err(e) => log::warn!("trade baseline write failed for {symbol}: {e}"),
        }
    }

    log::info!(
        "trade baselines written for {written}/{} symbols",
        symbols.len()
    );
    Ok(json!({
        "symbols": symbols.len(),
        "written": written,
        "insufficient_history": insufficient,
        "lookback_days": lookback_days,
    }))
}

/// (mean, sample stdev, sample size); None below the minimum-days bar.
/// A single repeated value legitimately yields stdev 0: the detector
/// has its own rule for that case.
pub fn baseline_stats(daily_totals: &[f64]) -> Option<(f64, f64, usize)> {
    if daily_totals.len() < MIN_DAYS_REQUIRED {
        return None;
    }
    let days = daily_totals.len();
    let data = Data::new(daily_totals.to_vec());
    let avg = data.mean()?;
    let std = data.std_dev().unwrap_or(0.0);
    Some((avg, std, days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_at_least_three_days() {
        assert!(baseline_stats(&[100.0, 200.0]).is_none());
        assert!(baseline_stats(&[100.0, 200.0, 300.0]).is_some());
    }

    #[test]
    fn mean_and_sample_stdev() {
        let (avg, std, days) = baseline_stats(&[600.0, 660.0, 720.0]).unwrap();
        assert!((avg - 660.0).abs() < 1e-9);
        assert_eq!(days, 3);
        // Sample stdev of {600, 660, 720} = 60.
        assert!((std - 60.0).abs() < 1e-9);
    }

    #[test]
    fn constant_series_has_zero_stdev() {
        let (avg, std, _) = baseline_stats(&[500.0, 500.0, 500.0, 500.0, 500.0]).unwrap();
        assert_eq!(avg, 500.0);
        assert_eq!(std, 0.0);
    }
}
