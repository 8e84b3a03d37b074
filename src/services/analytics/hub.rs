// src/services/analytics/hub.rs

//! Shared handle over every in-process analytics engine. The consumers
//! write, the enrichment stage reads; a day-changed event drops all
//! in-day state before the next message is processed.

use std::sync::Arc;

use crate::config::settings::Settings;
use crate::db::redis::RedisPool;
use crate::models::session::MarketSession;
use crate::services::analytics::{
    anomaly::TradeAnomalyDetector,
    atr::AtrCache,
    minute_bars::BarEngine,
    price_window::PriceWindowTracker,
    rvol::RvolCalculator,
    slots::{SlotManager, SlotVolumeCache},
    volume_window::VolumeWindowTracker,
    vwap::VwapCache,
};

#[derive(Clone)]
pub struct AnalyticsHub {
    pub vwap: Arc<VwapCache>,
    pub volume_windows: Arc<VolumeWindowTracker>,
    pub price_windows: Arc<PriceWindowTracker>,
    pub bars: Arc<BarEngine>,
    pub slot_volumes: Arc<SlotVolumeCache>,
    pub rvol: Arc<RvolCalculator>,
    pub atr: Arc<AtrCache>,
    pub anomaly: Arc<TradeAnomalyDetector>,
}

impl AnalyticsHub {
    pub fn new(settings: &Settings, redis: RedisPool) -> Self {
        let slots = SlotManager::new(
            settings.slot_size_minutes,
            parse_hhmm(&settings.pre_market_start),
            parse_hhmm(&settings.market_open),
            parse_hhmm(&settings.market_close),
            parse_hhmm(&settings.post_market_end),
        );
        Self {
            vwap: Arc::new(VwapCache::new()),
            volume_windows: Arc::new(VolumeWindowTracker::new()),
            price_windows: Arc::new(PriceWindowTracker::new()),
            bars: Arc::new(BarEngine::new()),
            slot_volumes: Arc::new(SlotVolumeCache::new()),
            rvol: Arc::new(RvolCalculator::new(redis.clone(), slots)),
            atr: Arc::new(AtrCache::new(redis.clone())),
            anomaly: Arc::new(TradeAnomalyDetector::new(
                redis,
                settings.rvol_lookback_days,
                settings.trades_zscore_threshold,
            )),
        }
    }

    /// Fast-path cancellation on day-changed: deques, minute buffers
    /// and in-day counters go; baselines and Bus caches are untouched
    /// until maintenance refreshes them.
    pub fn clear_in_day_state(&self) {
        self.vwap.clear();
        self.volume_windows.clear();
        self.price_windows.clear();
        self.bars.clear();
        self.slot_volumes.reset();
        self.anomaly.reset_for_new_day();
        self.rvol.invalidate();
        self.atr.invalidate();
        log::info!("analytics in-day state cleared for new trading day");
    }

    /// Current ET slot session, handy for consumers pausing outside
    /// extended hours.
    pub fn slot_session_now(&self, now_et: chrono::NaiveTime) -> MarketSession {
        match self.rvol.slots().slot_index(now_et) {
            Some(idx) => self.rvol.slots().slot_session(idx),
            None => MarketSession::Closed,
        }
    }
}

/// "HH:MM" → NaiveTime; malformed values fall back to midnight.
pub fn parse_hhmm(raw: &str) -> chrono::NaiveTime {
    let mut parts = raw.splitn(2, ':');
    let hour: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minute: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    chrono::NaiveTime::from_hms_opt(hour, minute, 0)
        .unwrap_or_else(|| chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parses_session_boundaries() {
        assert_eq!(parse_hhmm("09:30"), chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(parse_hhmm("04:00"), chrono::NaiveTime::from_hms_opt(4, 0, 0).unwrap());
        assert_eq!(parse_hhmm("garbage"), chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }
}
