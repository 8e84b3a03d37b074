// src/services/ingest/snapshot.rs

//! Snapshot ingestor: pulls the vendor full-market snapshot on a fixed
//! cadence, drops sub-$0.50 rows and writes the complete surviving list
//! to one single-slot key. Only one snapshot is ever "current": a slow
//! consumer that misses one simply processes the next.

use chrono::Utc;
use serde_json::Value;

use crate::db::redis::RedisPool;
use crate::models::polygon::{PolygonSnapshot, SnapshotEnvelope};
use crate::services::polygon::client::{backoff_delay, PolygonClient};
use crate::utils::errors::ApiError;

pub const SNAPSHOT_KEY: &str = "snapshot:polygon:latest";
const SNAPSHOT_TTL_SECS: usize = 60;
const MIN_PRICE: f64 = 0.50;
/// Above this share of malformed rows the cycle logs at error level,
/// but the parseable subset still gets published.
const PARSE_FAILURE_ALERT_RATIO: f64 = 0.20;

pub struct SnapshotIngestor {
    client: PolygonClient,
    redis: RedisPool,
    backoff_attempt: u32,
}

/// Enriched snapshot row as stored on the Bus: the raw vendor row plus
/// the derived price/volume so downstream stages never re-derive them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestedRow {
    #[serde(flatten)]
    pub snapshot: PolygonSnapshot,
    pub current_price: f64,
    pub current_volume: f64,
}

impl SnapshotIngestor {
    pub fn new(client: PolygonClient, redis: RedisPool) -> Self {
        Self {
            client,
            redis,
            backoff_attempt: 0,
        }
    }

    /// One ingest cycle. Returns the published row count; 0 on a
    /// skipped tick (timeout / rate limit).
    pub async fn fetch_snapshot(&mut self) -> usize {
        let raw = match self.client.full_market_snapshot().await {
            Ok(r) => {
                self.backoff_attempt = 0;
                r
            }
            Err(ApiError::RateLimited) => {
                self.backoff_attempt += 1;
                let delay = backoff_delay(self.backoff_attempt);
                log::warn!("snapshot rate limited, backing off {:?}", delay);
                tokio::time::sleep(delay).await;
                return 0;
            }
            Err(e) => {
                log::warn!("snapshot fetch failed, skipping tick: {e}");
                metrics::counter!("snapshot_fetch_failures", 1);
                return 0;
            }
        };

        let (rows, failed, low_price) = parse_and_filter(&raw.tickers);
        let raw_total = raw.tickers.len();

        if raw_total > 0 {
            let fail_ratio = failed as f64 / raw_total as f64;
            if fail_ratio > PARSE_FAILURE_ALERT_RATIO {
                log::error!(
                    "snapshot parse degraded: {failed}/{raw_total} rows malformed, publishing {} parseable",
                    rows.len()
                );
            }
        }
        metrics::counter!("snapshot_parse_failures", failed as u64);
        metrics::gauge!("snapshot_rows_published", rows.len() as f64);

        let count = rows.len();
        let envelope = SnapshotEnvelope {
            timestamp: Utc::now().to_rfc3339(),
            count,
            tickers: rows,
        };

        if let Err(e) = self
            .redis
            .set_json(SNAPSHOT_KEY, &envelope, SNAPSHOT_TTL_SECS)
            .await
        {
            log::error!("snapshot publish failed: {e}");
            return 0;
        }

        log::debug!(
            "snapshot published: {count} rows ({low_price} below ${MIN_PRICE:.2}, {failed} malformed)"
        );
        count
    }

    /// Fixed-cadence loop; rate-limit backoff happens inside the fetch.
    pub async fn run(mut self, interval_secs: u64) {
        let mut iv = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            iv.tick().await;
            self.fetch_snapshot().await;
        }
    }
}

/// Tolerant parse: malformed rows and sub-$0.50 rows are counted and
/// dropped; everything else becomes an `IngestedRow`.
fn parse_and_filter(raw_rows: &[Value]) -> (Vec<IngestedRow>, usize, usize) {
    let mut rows = Vec::with_capacity(raw_rows.len());
    let mut failed = 0usize;
    let mut low_price = 0usize;

    for value in raw_rows {
        let snapshot: PolygonSnapshot = match serde_json::from_value(value.clone()) {
            Ok(s) => s,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        let price = match snapshot.current_price() {
            Some(p) if p >= MIN_PRICE => p,
            _ => {
                low_price += 1;
                continue;
            }
        };
        let volume = snapshot.current_volume();
        if volume < 0.0 {
            failed += 1;
            continue;
        }
        rows.push(IngestedRow {
            snapshot,
            current_price: price,
            current_volume: volume,
        });
    }

    (rows, failed, low_price)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticker: &str, last_trade: f64) -> Value {
        serde_json::json!({
            "ticker": ticker,
            "day": {"o": 1.0, "h": 1.2, "l": 0.9, "c": 1.1, "v": 5000.0},
            "prevDay": {"c": 1.0, "v": 4000.0},
            "lastTrade": {"p": last_trade},
        })
    }

    #[test]
    fn price_floor_is_half_dollar_inclusive() {
        let rows = vec![row("LOW", 0.4999), row("EDGE", 0.5000), row("OK", 12.10)];
        let (kept, failed, low) = parse_and_filter(&rows);
        assert_eq!(failed, 0);
        assert_eq!(low, 1);
        let symbols: Vec<&str> = kept.iter().map(|r| r.snapshot.ticker.as_str()).collect();
        assert_eq!(symbols, vec!["EDGE", "OK"]);
    }

    #[test]
    fn malformed_rows_counted_not_fatal() {
        let rows = vec![
            serde_json::json!({"day": {"c": 3.0}}), // no ticker
            row("OK", 3.0),
        ];
        let (kept, failed, _) = parse_and_filter(&rows);
        assert_eq!(failed, 1);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn row_without_any_price_is_dropped() {
        let rows = vec![serde_json::json!({"ticker": "EMPT"})];
        let (kept, failed, low) = parse_and_filter(&rows);
        assert!(kept.is_empty());
        assert_eq!(failed, 0);
        assert_eq!(low, 1);
    }

    #[test]
    fn derived_fields_ride_along() {
        let rows = vec![row("ABCD", 12.10)];
        let (kept, _, _) = parse_and_filter(&rows);
        assert_eq!(kept[0].current_price, 12.10);
        assert_eq!(kept[0].current_volume, 5000.0);
        // and survive a serde round trip through the Bus payload shape
        let json = serde_json::to_string(&kept[0]).unwrap();
        let back: IngestedRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_price, 12.10);
        assert_eq!(back.snapshot.ticker, "ABCD");
    }
}
