// src/services/analytics/atr.rs

//! Read side of the ATR cache. Maintenance computes 14-day ATR per
//! symbol nightly and mirrors it in the Bus hash `atr:{symbol}`
//! ({atr, atr_percent}, 24 h TTL). Query returns (atr, atr%) or None.

use dashmap::DashMap;

use crate::db::redis::RedisPool;

pub const ATR_KEY_PREFIX: &str = "atr";
const LOCAL_TTL_SECS: i64 = 600;

pub struct AtrCache {
    redis: RedisPool,
    local: DashMap<String, (i64, Option<(f64, f64)>)>,
}

impl AtrCache {
    pub fn new(redis: RedisPool) -> Self {
        Self {
            redis,
            local: DashMap::new(),
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<(f64, f64)> {
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.local.get(symbol) {
            let (cached_at, value) = *entry;
            if now - cached_at < LOCAL_TTL_SECS {
                return value;
            }
        }

        let key = format!("{ATR_KEY_PREFIX}:{symbol}");
        let fetched = match self.redis.hget_all(&key).await {
            Ok(raw) => {
                let atr = raw.get("atr").and_then(|v| v.parse::<f64>().ok());
                let pct = raw.get("atr_percent").and_then(|v| v.parse::<f64>().ok());
                match (atr, pct) {
                    (Some(a), Some(p)) => Some((a, p)),
                    _ => None,
                }
            }
            Err(e) => {
                log::debug!("atr read failed for {symbol}: {e}");
                None
            }
        };
        self.local.insert(symbol.to_string(), (now, fetched));
        fetched
    }

    pub fn invalidate(&self) {
        self.local.clear();
    }
}

/// True-range ATR over daily bars, newest bar first. Returns
/// (atr, atr_percent-of-last-close); None with fewer than `period` + 1
/// bars.
pub fn atr_from_bars(bars: &[(f64, f64, f64)], period: usize) -> Option<(f64, f64)> {
    // bars: (high, low, close), index 0 = most recent
    if bars.len() < period + 1 || period == 0 {
        return None;
    }
    let mut trs = Vec::with_capacity(period);
    for i in 0..period {
        let (high, low, _) = bars[i];
        let (_, _, prev_close) = bars[i + 1];
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        trs.push(tr);
    }
    let atr = trs.iter().sum::<f64>() / period as f64;
    let last_close = bars[0].2;
    if last_close <= 0.0 {
        return None;
    }
    Some((atr, atr / last_close * 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let bars = vec![(10.0, 9.0, 9.5); 14];
        assert!(atr_from_bars(&bars, 14).is_none());
    }

    #[test]
    fn flat_bars_give_range_atr() {
        // Every day: high 10, low 9, close 9.5 → TR = 1.0 each day.
        let bars = vec![(10.0, 9.0, 9.5); 15];
        let (atr, pct) = atr_from_bars(&bars, 14).unwrap();
        assert!((atr - 1.0).abs() < 1e-9);
        assert!((pct - (1.0 / 9.5 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn gap_day_uses_prev_close_in_true_range() {
        // Most recent bar gapped: high 20, low 19, prev close 10 → TR 10.
        let mut bars = vec![(10.0, 9.0, 9.5); 15];
        bars[0] = (20.0, 19.0, 19.5);
        bars[1] = (10.0, 9.0, 10.0);
        let (atr, _) = atr_from_bars(&bars, 14).unwrap();
        let expected = (10.0 + 13.0) / 14.0; // 10 from the gap day, 13×1.0
        assert!((atr - expected).abs() < 1e-9);
    }
}
