// src/services/analytics/minute_bars.rs

//! Minute-bar close engine. Reads the minute stream in large batches
//! (burst tolerance: one XREADGROUP of up to 15 000 messages, 2 s
//! block), keeps the most recent closed bar per symbol and reinforces
//! the intraday high/low the enrichment stage reads.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::db::redis::{entry_f64, entry_field, RedisPool};
use crate::services::polygon::ws::STREAM_MINUTES;

const CONSUMER_GROUP: &str = "analytics_bar_engine";
const CONSUMER_NAME: &str = "analytics_bar_engine_1";
const BATCH_SIZE: usize = 15_000;
const BLOCK_MS: usize = 2_000;
const BACKLOG_ALERT: usize = 50_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MinuteBar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
    pub trades: Option<u64>,
    pub end_ts: i64,
}

#[derive(Default)]
pub struct BarEngine {
    bars: DashMap<String, MinuteBar>,
    range: DashMap<String, (f64, f64)>,
}

impl BarEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close a bar. A later bar for the same (symbol, minute)
    /// supersedes the earlier one; an older bar never regresses state.
    pub fn on_bar(&self, bar: MinuteBar) {
        if let Some(existing) = self.bars.get(&bar.symbol) {
            if bar.end_ts < existing.end_ts {
                return;
            }
        }
        if bar.high > 0.0 {
            self.range
                .entry(bar.symbol.clone())
                .and_modify(|(high, low)| {
                    if bar.high > *high {
                        *high = bar.high;
                    }
                    if bar.low > 0.0 && bar.low < *low {
                        *low = bar.low;
                    }
                })
                .or_insert((bar.high, if bar.low > 0.0 { bar.low } else { bar.high }));
        }
        self.bars.insert(bar.symbol.clone(), bar);
    }

    pub fn last_bar(&self, symbol: &str) -> Option<MinuteBar> {
        self.bars.get(symbol).map(|b| b.clone())
    }

    /// (intraday high, intraday low) seen through the minute stream,
    /// including pre/post market.
    pub fn intraday_range(&self, symbol: &str) -> Option<(f64, f64)> {
        self.range.get(symbol).map(|r| *r)
    }

    pub fn symbols_tracked(&self) -> usize {
        self.bars.len()
    }

    pub fn clear(&self) {
        self.bars.clear();
        self.range.clear();
    }
}

pub async fn run_consumer(redis: RedisPool, engine: std::sync::Arc<BarEngine>) {
    log::info!("minute bar consumer started on {STREAM_MINUTES}");
    if let Err(e) = redis.ensure_group(STREAM_MINUTES, CONSUMER_GROUP).await {
        log::warn!("bar engine group create: {e}");
    }

    loop {
        let reply = match redis
            .read_group(STREAM_MINUTES, CONSUMER_GROUP, CONSUMER_NAME, BATCH_SIZE, BLOCK_MS)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.to_string().contains("NOGROUP") {
                    let _ = redis.ensure_group(STREAM_MINUTES, CONSUMER_GROUP).await;
                    continue;
                }
                log::error!("bar engine read: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let started = Instant::now();
        let mut ids = Vec::new();
        let mut processed = 0usize;

        for key in reply.keys {
            for entry in key.ids {
                if let Some(bar) = bar_from_entry(&entry) {
                    engine.on_bar(bar);
                    processed += 1;
                }
                ids.push(entry.id.clone());
            }
        }
        if let Err(e) = redis.ack(STREAM_MINUTES, CONSUMER_GROUP, &ids).await {
            log::error!("bar engine ack: {e}");
        }

        if processed > 0 {
            metrics::histogram!(
                "analytics_bar_batch_ms",
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
        if let Ok(backlog) = redis.stream_len(STREAM_MINUTES).await {
            metrics::gauge!("analytics_bar_backlog", backlog as f64);
            if backlog > BACKLOG_ALERT {
                log::warn!("minute bar backlog {backlog} exceeds {BACKLOG_ALERT}");
            }
        }
    }
}

fn bar_from_entry(entry: &redis::streams::StreamId) -> Option<MinuteBar> {
    let symbol = entry_field(entry, "symbol")?;
    let close = entry_f64(entry, "close")?;
    if close <= 0.0 {
        return None;
    }
    Some(MinuteBar {
        symbol,
        open: entry_f64(entry, "open").unwrap_or(close),
        high: entry_f64(entry, "high").unwrap_or(close),
        low: entry_f64(entry, "low").unwrap_or(close),
        close,
        volume: entry_f64(entry, "volume").unwrap_or(0.0),
        vwap: entry_f64(entry, "vwap").filter(|v| *v > 0.0),
        trades: entry_f64(entry, "trades").map(|n| n as u64),
        end_ts: entry_f64(entry, "timestamp_end").map(|ms| ms as i64).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, high: f64, low: f64, close: f64, end_ts: i64) -> MinuteBar {
        MinuteBar {
            symbol: symbol.into(),
            open: close,
            high,
            low,
            close,
            volume: 100.0,
            vwap: None,
            trades: None,
            end_ts,
        }
    }

    #[test]
    fn later_bar_supersedes_same_minute() {
        let engine = BarEngine::new();
        engine.on_bar(bar("TSLA", 10.0, 9.0, 9.5, 1_000));
        engine.on_bar(bar("TSLA", 10.2, 9.1, 9.8, 1_000));
        assert_eq!(engine.last_bar("TSLA").unwrap().close, 9.8);
    }

    #[test]
    fn older_bar_never_regresses_latest() {
        let engine = BarEngine::new();
        engine.on_bar(bar("TSLA", 10.0, 9.0, 9.5, 2_000));
        engine.on_bar(bar("TSLA", 11.0, 9.0, 10.5, 1_000));
        assert_eq!(engine.last_bar("TSLA").unwrap().close, 9.5);
    }

    #[test]
    fn intraday_range_widens_only() {
        let engine = BarEngine::new();
        engine.on_bar(bar("TSLA", 10.0, 9.0, 9.5, 1_000));
        engine.on_bar(bar("TSLA", 12.0, 9.5, 11.0, 2_000));
        engine.on_bar(bar("TSLA", 11.0, 8.5, 9.0, 3_000));
        assert_eq!(engine.intraday_range("TSLA"), Some((12.0, 8.5)));
    }

    #[test]
    fn clear_resets_bars_and_range() {
        let engine = BarEngine::new();
        engine.on_bar(bar("TSLA", 10.0, 9.0, 9.5, 1_000));
        engine.clear();
        assert!(engine.last_bar("TSLA").is_none());
        assert!(engine.intraday_range("TSLA").is_none());
    }
}
