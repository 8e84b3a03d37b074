// src/services/analytics/price_window.rs

//! Mirror of the volume window over close price:
//! chg_5min = (p_now − p_5min_ago) / p_5min_ago · 100.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;

use crate::db::redis::{entry_f64, entry_field, RedisPool};
use crate::services::analytics::volume_window::{window_delta, WINDOW_SPAN_SECS};
use crate::services::polygon::ws::STREAM_AGGREGATES;

const RETENTION_SECS: i64 = 900;

const CONSUMER_GROUP: &str = "analytics_price_window";
const CONSUMER_NAME: &str = "analytics_price_window_1";

#[derive(Default)]
pub struct PriceWindowTracker {
    windows: DashMap<String, VecDeque<(i64, f64)>>,
}

impl PriceWindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, close: f64, ts_secs: i64) {
        if close <= 0.0 {
            return;
        }
        let mut window = self.windows.entry(symbol.to_string()).or_default();
        if let Some(&(last_ts, _)) = window.back() {
            if ts_secs <= last_ts {
                return;
            }
        }
        window.push_back((ts_secs, close));
        let cutoff = ts_secs - RETENTION_SECS;
        while let Some(&(front_ts, _)) = window.front() {
            if front_ts < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Percent change over the trailing 5 minutes, None without enough
    /// history.
    pub fn chg_5min(&self, symbol: &str) -> Option<f64> {
        let window = self.windows.get(symbol)?;
        let &(_, now_price) = window.back()?;
        let delta = window_delta(&window, WINDOW_SPAN_SECS)?;
        let base = now_price - delta;
        if base <= 0.0 {
            return None;
        }
        Some(delta / base * 100.0)
    }

    pub fn symbols_active(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

pub async fn run_consumer(redis: RedisPool, tracker: std::sync::Arc<PriceWindowTracker>) {
    log::info!("price window consumer started on {STREAM_AGGREGATES}");
    if let Err(e) = redis.ensure_group(STREAM_AGGREGATES, CONSUMER_GROUP).await {
        log::warn!("price window group create: {e}");
    }

    loop {
        let reply = match redis
            .read_group(STREAM_AGGREGATES, CONSUMER_GROUP, CONSUMER_NAME, 500, 1000)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.to_string().contains("NOGROUP") {
                    let _ = redis.ensure_group(STREAM_AGGREGATES, CONSUMER_GROUP).await;
                    continue;
                }
                log::error!("price window read: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut ids = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let (Some(symbol), Some(close)) =
                    (entry_field(&entry, "symbol"), entry_f64(&entry, "close"))
                {
                    let ts = entry_f64(&entry, "timestamp_end")
                        .map(|ms| (ms / 1000.0) as i64)
                        .unwrap_or_else(|| chrono::Utc::now().timestamp());
                    tracker.update(&symbol, close, ts);
                }
                ids.push(entry.id.clone());
            }
        }
        if let Err(e) = redis.ack(STREAM_AGGREGATES, CONSUMER_GROUP, &ids).await {
            log::error!("price window ack: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_minute_change_percent() {
        let tracker = PriceWindowTracker::new();
        tracker.update("TSLA", 100.0, 1_000);
        tracker.update("TSLA", 101.5, 1_300);
        let chg = tracker.chg_5min("TSLA").unwrap();
        assert!((chg - 1.5).abs() < 1e-9);
    }

    #[test]
    fn negative_change_comes_out_negative() {
        let tracker = PriceWindowTracker::new();
        tracker.update("TSLA", 200.0, 0);
        tracker.update("TSLA", 190.0, 300);
        let chg = tracker.chg_5min("TSLA").unwrap();
        assert!((chg + 5.0).abs() < 1e-9);
    }

    #[test]
    fn no_history_is_none() {
        let tracker = PriceWindowTracker::new();
        tracker.update("TSLA", 100.0, 1_000);
        assert_eq!(tracker.chg_5min("TSLA"), None);
    }

    #[test]
    fn zero_prices_are_rejected() {
        let tracker = PriceWindowTracker::new();
        tracker.update("TSLA", 0.0, 1_000);
        assert_eq!(tracker.symbols_active(), 0);
    }
}
