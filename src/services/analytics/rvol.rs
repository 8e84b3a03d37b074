// src/services/analytics/rvol.rs

//! RVOL by intraday slot. Baselines (mean accumulated volume at each
//! slot over the last K trading days) are built nightly by maintenance
//! and mirrored in the Bus hash `rvol:hist:avg:{symbol}`; this side
//! only reads. Missing baseline → None, never zero.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::db::redis::RedisPool;
use crate::services::analytics::slots::SlotManager;

pub const RVOL_BASELINE_PREFIX: &str = "rvol:hist:avg";
/// Baselines change once a night; a short local TTL keeps the hot path
/// off the Bus for repeat symbols.
const LOCAL_TTL_SECS: i64 = 600;

pub struct RvolCalculator {
    redis: RedisPool,
    slots: SlotManager,
    local: DashMap<String, (i64, Option<HashMap<u16, f64>>)>,
}

impl RvolCalculator {
    pub fn new(redis: RedisPool, slots: SlotManager) -> Self {
        Self {
            redis,
            slots,
            local: DashMap::new(),
        }
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    /// RVOL = accumulated volume now / baseline mean at the current
    /// slot. None when outside the extended day or without a baseline.
    pub async fn rvol(
        &self,
        symbol: &str,
        accumulated_volume: f64,
        now_et: chrono::NaiveTime,
    ) -> Option<f64> {
        if accumulated_volume <= 0.0 {
            return None;
        }
        let slot = self.slots.slot_index(now_et)?;
        let baselines = self.baselines(symbol).await?;
        let mean = baselines.get(&slot).copied()?;
        if mean <= 0.0 {
            return None;
        }
        Some(accumulated_volume / mean)
    }

    async fn baselines(&self, symbol: &str) -> Option<HashMap<u16, f64>> {
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.local.get(symbol) {
            let (cached_at, ref value) = *entry;
            if now - cached_at < LOCAL_TTL_SECS {
                return value.clone();
            }
        }

        let key = format!("{RVOL_BASELINE_PREFIX}:{symbol}");
        let fetched = match self.redis.hget_all(&key).await {
            Ok(raw) if !raw.is_empty() => Some(parse_baseline_hash(&raw)),
            Ok(_) => None,
            Err(e) => {
                log::debug!("rvol baseline read failed for {symbol}: {e}");
                None
            }
        };
        self.local.insert(symbol.to_string(), (now, fetched.clone()));
        fetched
    }

    /// Lazy re-read after the nightly refresh: drop local copies.
    pub fn invalidate(&self) {
        self.local.clear();
    }
}

pub(crate) fn parse_baseline_hash(raw: &HashMap<String, String>) -> HashMap<u16, f64> {
    raw.iter()
        .filter_map(|(slot, mean)| {
            let slot = slot.parse::<u16>().ok()?;
            let mean = mean.parse::<f64>().ok()?;
            Some((slot, mean))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_hash_parses_slot_indices() {
        let mut raw = HashMap::new();
        raw.insert("66".to_string(), "125000.5".to_string());
        raw.insert("bogus".to_string(), "1".to_string());
        raw.insert("67".to_string(), "not-a-number".to_string());
        let parsed = parse_baseline_hash(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get(&66), Some(&125000.5));
    }
}
