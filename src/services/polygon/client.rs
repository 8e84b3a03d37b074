// src/services/polygon/client.rs

//! Vendor HTTP client: full-market snapshot, reference data, aggregate
//! bars, splits and the market-status calendar. Bearer key goes in the
//! query string; every call carries a bounded timeout and 429/5xx map
//! to `ApiError::RateLimited` / `ApiError::Other` so callers can back
//! off without crashing.

use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::settings::Settings;
use crate::models::polygon::{
    PolygonDailyBar, PolygonMarketStatus, PolygonRangeBar, PolygonSplit, PolygonTickerDetails,
    PolygonUpcoming,
};
use crate::utils::errors::ApiError;

const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct PolygonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Raw snapshot response: rows stay as JSON values so that one
/// malformed row can be counted and skipped instead of failing the
/// whole batch.
pub struct RawSnapshotResponse {
    pub tickers: Vec<Value>,
}

impl PolygonClient {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.polygon_base_url.clone(),
            api_key: settings.polygon_api_key.clone(),
        })
    }

    async fn get_json(&self, path: &str, extra: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut query: Vec<(&str, String)> = vec![("apiKey", self.api_key.clone())];
        query.extend_from_slice(extra);

        let resp = self.http.get(&url).query(&query).send().await?;
        match resp.status().as_u16() {
            200 => Ok(resp.json::<Value>().await?),
            429 => Err(ApiError::RateLimited),
            code => Err(ApiError::Other(format!("vendor HTTP {code} on {path}"))),
        }
    }

    fn results<T: DeserializeOwned>(body: &Value) -> Vec<T> {
        body.get("results")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full-market snapshot (~11k rows). Rows come back raw.
    pub async fn full_market_snapshot(&self) -> Result<RawSnapshotResponse, ApiError> {
        let body = self
            .get_json("/v2/snapshot/locale/us/markets/stocks/tickers", &[])
            .await?;
        let tickers = body
            .get("tickers")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(RawSnapshotResponse { tickers })
    }

    pub async fn market_status(&self) -> Result<PolygonMarketStatus, ApiError> {
        let body = self.get_json("/v1/marketstatus/now", &[]).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn upcoming_holidays(&self) -> Result<Vec<PolygonUpcoming>, ApiError> {
        let body = self.get_json("/v1/marketstatus/upcoming", &[]).await?;
        // This endpoint returns a bare array rather than a results wrapper.
        let arr = body.as_array().cloned().unwrap_or_default();
        Ok(arr
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Splits declared in the window [since, until].
    pub async fn splits(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<PolygonSplit>, ApiError> {
        let body = self
            .get_json(
                "/v3/reference/splits",
                &[
                    ("execution_date.gte", since.to_string()),
                    ("execution_date.lte", until.to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;
        Ok(Self::results(&body))
    }

    pub async fn ticker_details(&self, symbol: &str) -> Result<Option<PolygonTickerDetails>, ApiError> {
        let body = self
            .get_json(&format!("/v3/reference/tickers/{symbol}"), &[])
            .await?;
        Ok(body
            .get("results")
            .and_then(|r| serde_json::from_value(r.clone()).ok()))
    }

    /// Active ticker universe, paginated client-side by the caller via
    /// the cursor in `next_url` being collapsed to one big page here.
    pub async fn active_tickers(&self, limit: usize) -> Result<Vec<PolygonTickerDetails>, ApiError> {
        let body = self
            .get_json(
                "/v3/reference/tickers",
                &[
                    ("market", "stocks".to_string()),
                    ("active", "true".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(Self::results(&body))
    }

    /// Grouped daily bars for the whole market on one date.
    pub async fn grouped_daily(&self, date: NaiveDate) -> Result<Vec<PolygonDailyBar>, ApiError> {
        let body = self
            .get_json(
                &format!("/v2/aggs/grouped/locale/us/market/stocks/{date}"),
                &[("adjusted", "true".to_string())],
            )
            .await?;
        Ok(Self::results(&body))
    }

    /// Adjusted daily bar for one symbol on one date (split detection).
    pub async fn daily_bar(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<PolygonRangeBar>, ApiError> {
        let body = self
            .get_json(
                &format!("/v2/aggs/ticker/{symbol}/range/1/day/{date}/{date}"),
                &[("adjusted", "true".to_string())],
            )
            .await?;
        let bars: Vec<PolygonRangeBar> = Self::results(&body);
        Ok(bars.into_iter().next())
    }

    /// 5-minute bars for one symbol over one day (volume-slot loader).
    pub async fn minute_range_bars(
        &self,
        symbol: &str,
        date: NaiveDate,
        multiplier: u32,
    ) -> Result<Vec<PolygonRangeBar>, ApiError> {
        let body = self
            .get_json(
                &format!("/v2/aggs/ticker/{symbol}/range/{multiplier}/minute/{date}/{date}"),
                &[
                    ("adjusted", "true".to_string()),
                    ("sort", "asc".to_string()),
                    ("limit", "50000".to_string()),
                ],
            )
            .await?;
        Ok(Self::results(&body))
    }
}

/// Exponential backoff for transient vendor failures, capped at 30 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt.min(5));
    Duration::from_secs(base.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_30s() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn results_extracts_and_skips_malformed() {
        let body: Value = serde_json::from_str(
            r#"{"results":[{"ticker":"AAA","split_from":1.0,"split_to":10.0,
                            "execution_date":"2024-09-15"},
                           {"split_from":"not-a-number"}]}"#,
        )
        .unwrap();
        let splits: Vec<PolygonSplit> = PolygonClient::results(&body);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].ticker.as_deref(), Some("AAA"));
    }
}
