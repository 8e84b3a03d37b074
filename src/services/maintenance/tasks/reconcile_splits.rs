// src/services/maintenance/tasks/reconcile_splits.rs

//! Task 9: reverse-adjust warehouse rows that predate a recent split.
//!
//! For each recent split, the vendor's adjusted close for the last
//! pre-split day is compared with the warehouse close on that date. A
//! mismatch beyond tolerance means the old rows were loaded before the
//! vendor re-adjusted history: prices × factor, volumes ÷ factor.

use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::queries;
use crate::models::polygon::PolygonSplit;
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

pub const SPLIT_LOOKBACK_DAYS: i64 = 30;
/// Closes differing by more than this are treated as unadjusted.
pub const MISMATCH_TOLERANCE: f64 = 0.10;
/// The detected factor must sit within this band around the declared
/// ratio; outside it the warehouse-derived factor is still used, with a
/// log line.
pub const RATIO_CONFIRMATION_TOLERANCE: f64 = 0.05;

pub async fn execute(
    pg: &PgPool,
    client: &PolygonClient,
    target_date: NaiveDate,
) -> Result<Value, MaintenanceError> {
    let since = target_date - Duration::days(SPLIT_LOOKBACK_DAYS);
    let splits = client.splits(since, target_date).await?;
    let significant = significant_splits(&splits);

    if significant.is_empty() {
        return Ok(json!({"splits_found": splits.len(), "tickers_fixed": 0}));
    }

    let mut fixed = 0usize;
    let mut rows_adjusted = 0u64;

    for (ticker, exec_date, expected_factor) in &significant {
        let Some(pre_split_date) = queries::last_date_before(pg, ticker, *exec_date).await? else {
            continue;
        };
        let Some(warehouse_close) = queries::close_on_date(pg, ticker, pre_split_date).await?
        else {
            continue;
        };
        let vendor_close = match client.daily_bar(ticker, pre_split_date).await {
            Ok(Some(bar)) => bar.c,
            _ => None,
        };
        let Some(vendor_close) = vendor_close.filter(|c| *c > 0.0) else {
            continue;
        };
        if warehouse_close <= 0.0 {
            continue;
        }

        let detected = vendor_close / warehouse_close;
        if (detected - 1.0).abs() <= MISMATCH_TOLERANCE {
            log::debug!("{ticker}: warehouse already adjusted (factor {detected:.4})");
            continue;
        }

        let ratio_diff = (detected - expected_factor).abs() / expected_factor;
        if ratio_diff > RATIO_CONFIRMATION_TOLERANCE {
            log::warn!(
                "{ticker}: detected factor {detected:.4} deviates from declared {expected_factor:.4}, using detected"
            );
        }

        let affected = queries::apply_split_adjustment(pg, ticker, *exec_date, detected).await?;
        log::info!(
            "{ticker}: reverse-adjusted {affected} daily rows before {exec_date} by {detected:.4}"
        );
        fixed += 1;
        rows_adjusted += affected;
    }

    Ok(json!({
        "splits_found": splits.len(),
        "significant": significant.len(),
        "tickers_fixed": fixed,
        "rows_adjusted": rows_adjusted,
    }))
}

/// (ticker, execution date, declared price factor) for splits whose
/// factor moves the price more than the mismatch tolerance. ~1% stock
/// dividends are ignored.
pub fn significant_splits(splits: &[PolygonSplit]) -> Vec<(String, NaiveDate, f64)> {
    splits
        .iter()
        .filter_map(|s| {
            let ticker = s.ticker.clone()?;
            let exec = s
                .execution_date
                .as_deref()
                .and_then(|d| d.parse::<NaiveDate>().ok())?;
            let from = s.split_from.filter(|v| *v > 0.0)?;
            let to = s.split_to.filter(|v| *v > 0.0)?;
            let factor = from / to;
            if (factor - 1.0).abs() < MISMATCH_TOLERANCE {
                return None;
            }
            Some((ticker, exec, factor))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(ticker: &str, from: f64, to: f64) -> PolygonSplit {
        PolygonSplit {
            ticker: Some(ticker.into()),
            execution_date: Some("2024-09-15".into()),
            split_from: Some(from),
            split_to: Some(to),
        }
    }

    #[test]
    fn reverse_split_one_for_ten_has_factor_ten() {
        let splits = vec![split("QQQQ", 1.0, 10.0)];
        // split_from/split_to is shares-based: 1-for-10 reverse split is
        // declared 10 from, 1 to → price factor 10.
        let sig = significant_splits(&[split("QQQQ", 10.0, 1.0)]);
        assert_eq!(sig.len(), 1);
        assert_eq!(sig[0].2, 10.0);
        // Forward 1:10 declared the other way round gives 0.1.
        let fwd = significant_splits(&splits);
        assert!((fwd[0].2 - 0.1).abs() < 1e-9);
    }

    #[test]
    fn trivial_dividend_ratios_are_skipped() {
        let sig = significant_splits(&[split("DIV", 1.02, 1.0)]);
        assert!(sig.is_empty());
    }

    #[test]
    fn malformed_split_rows_are_skipped() {
        let broken = PolygonSplit {
            ticker: None,
            execution_date: Some("2024-09-15".into()),
            split_from: Some(10.0),
            split_to: Some(1.0),
        };
        assert!(significant_splits(&[broken]).is_empty());
    }
}
