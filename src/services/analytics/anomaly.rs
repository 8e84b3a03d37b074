// src/services/analytics/anomaly.rs

//! Trade-count anomaly detection by Z-score.
//!
//! trades_today comes from the snapshot `day.n` field on every tick;
//! the baseline (mean, stdev of daily trade counts over the last K
//! trading days) is built nightly and mirrored in the Bus hash
//! `trades:baseline:{symbol}:{days}`. A row is anomalous iff z ≥ 3.0.

use dashmap::DashMap;

use crate::db::redis::RedisPool;

pub const BASELINE_PREFIX: &str = "trades:baseline";
const LOCAL_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyResult {
    pub trades_today: u64,
    pub avg_trades: f64,
    pub std_trades: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
}

/// In-day per-symbol trade counter, reset at the day boundary.
#[derive(Default)]
pub struct TradeCounter {
    counts: DashMap<String, u64>,
}

impl TradeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from `day.n`. Zero counts are noise.
    pub fn update(&self, symbol: &str, trades: u64) {
        if trades > 0 {
            self.counts.insert(symbol.to_uppercase(), trades);
        }
    }

    pub fn get(&self, symbol: &str) -> u64 {
        self.counts
            .get(&symbol.to_uppercase())
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&self) {
        self.counts.clear();
    }
}

pub struct TradeAnomalyDetector {
    redis: RedisPool,
    lookback_days: u32,
    z_threshold: f64,
    counter: TradeCounter,
    baselines: DashMap<String, (i64, Option<(f64, f64)>)>,
}

impl TradeAnomalyDetector {
    pub fn new(redis: RedisPool, lookback_days: u32, z_threshold: f64) -> Self {
        Self {
            redis,
            lookback_days,
            z_threshold,
            counter: TradeCounter::new(),
            baselines: DashMap::new(),
        }
    }

    pub fn update_trades_today(&self, symbol: &str, trades: u64) {
        self.counter.update(symbol, trades);
    }

    pub fn trades_today(&self, symbol: &str) -> u64 {
        self.counter.get(symbol)
    }

    /// Z-score detection. None without today's count or a baseline.
    pub async fn detect(&self, symbol: &str, trades_today: Option<u64>) -> Option<AnomalyResult> {
        let sym = symbol.to_uppercase();
        let today = match trades_today {
            Some(n) => n,
            None => self.counter.get(&sym),
        };
        if today == 0 {
            return None;
        }

        let (avg, std) = self.baseline(&sym).await?;
        let z = z_score(today, avg, std);
        let is_anomaly = z >= self.z_threshold;
        if is_anomaly {
            log::info!("trade anomaly: {sym} today={today} avg={avg:.1} std={std:.1} z={z:.2}");
            metrics::counter!("trade_anomalies_detected", 1);
        }
        Some(AnomalyResult {
            trades_today: today,
            avg_trades: avg,
            std_trades: std,
            z_score: z,
            is_anomaly,
        })
    }

    async fn baseline(&self, symbol: &str) -> Option<(f64, f64)> {
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.baselines.get(symbol) {
            let (cached_at, value) = *entry;
            if now - cached_at < LOCAL_TTL_SECS {
                return value;
            }
        }

        let key = format!("{BASELINE_PREFIX}:{symbol}:{}", self.lookback_days);
        let fetched = match self.redis.hget_all(&key).await {
            Ok(raw) => {
                let avg = raw.get("avg").and_then(|v| v.parse::<f64>().ok());
                let std = raw.get("std").and_then(|v| v.parse::<f64>().ok());
                match (avg, std) {
                    (Some(a), Some(s)) => Some((a, s)),
                    _ => None,
                }
            }
            Err(e) => {
                log::debug!("trades baseline read failed for {symbol}: {e}");
                None
            }
        };
        self.baselines.insert(symbol.to_string(), (now, fetched));
        fetched
    }

    /// Day boundary: counters go, Bus baselines stay (their TTL is
    /// owned by maintenance) but local copies are dropped for a lazy
    /// re-read after the nightly refresh.
    pub fn reset_for_new_day(&self) {
        self.counter.clear();
        self.baselines.clear();
    }

    pub fn symbols_tracked(&self) -> usize {
        self.counter.len()
    }
}

/// stdev > 0 → (today − mean)/stdev; stdev = 0 → 10 when today more
/// than doubles the mean, else 0.
pub fn z_score(trades_today: u64, avg: f64, std: f64) -> f64 {
    let today = trades_today as f64;
    if std <= 0.0 {
        if avg > 0.0 && today > avg * 2.0 {
            10.0
        } else {
            0.0
        }
    } else {
        (today - avg) / std
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bivi_example_from_the_baseline() {
        // avg 660, std 156, today 159 263 → z ≈ 1016.7
        let z = z_score(159_263, 660.0, 156.0);
        assert!((z - (159_263.0 - 660.0) / 156.0).abs() < 1e-9);
        assert!(z > 1000.0);
    }

    #[test]
    fn zero_stdev_doubling_forces_ten() {
        assert_eq!(z_score(2_001, 1_000.0, 0.0), 10.0);
    }

    #[test]
    fn zero_stdev_without_doubling_forces_zero() {
        assert_eq!(z_score(2_000, 1_000.0, 0.0), 0.0);
        assert_eq!(z_score(500, 1_000.0, 0.0), 0.0);
    }

    #[test]
    fn negative_z_when_below_average() {
        assert!(z_score(100, 1_000.0, 100.0) < 0.0);
    }

    #[test]
    fn counter_is_case_insensitive_and_resets() {
        let counter = TradeCounter::new();
        counter.update("bivi", 42);
        assert_eq!(counter.get("BIVI"), 42);
        counter.update("BIVI", 0); // noise, ignored
        assert_eq!(counter.get("BIVI"), 42);
        counter.clear();
        assert_eq!(counter.get("BIVI"), 0);
        assert!(counter.is_empty());
    }
}
