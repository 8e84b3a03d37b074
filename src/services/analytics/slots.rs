// src/services/analytics/slots.rs

//! Slot math for RVOL: the extended-hours day (04:00–20:00 ET) divided
//! into N-minute buckets, 192 at the 5-minute default. The in-day cache
//! stores the vendor's accumulated day volume as of slot end, not a
//! per-slot delta, and is reset at every trading-day boundary.

use chrono::{NaiveTime, Timelike};
use dashmap::DashMap;
use std::collections::HashMap;

use crate::models::session::MarketSession;

#[derive(Debug, Clone)]
pub struct SlotManager {
    pub slot_size_minutes: u32,
    pub day_start: NaiveTime,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
    pub day_end: NaiveTime,
    pub total_slots: u16,
}

impl SlotManager {
    pub fn new(
        slot_size_minutes: u32,
        day_start: NaiveTime,
        market_open: NaiveTime,
        market_close: NaiveTime,
        day_end: NaiveTime,
    ) -> Self {
        let total_minutes = minutes_between(day_start, day_end);
        let total_slots = (total_minutes / slot_size_minutes) as u16;
        Self {
            slot_size_minutes,
            day_start,
            market_open,
            market_close,
            day_end,
            total_slots,
        }
    }

    /// Standard 04:00 / 09:30 / 16:00 / 20:00 day.
    pub fn standard(slot_size_minutes: u32) -> Self {
        Self::new(
            slot_size_minutes,
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        )
    }

    /// 0-based slot index for a wall-clock ET time, None outside the
    /// extended-hours day.
    pub fn slot_index(&self, t: NaiveTime) -> Option<u16> {
        if t < self.day_start || t >= self.day_end {
            return None;
        }
        let offset = minutes_between(self.day_start, t);
        Some((offset / self.slot_size_minutes) as u16)
    }

    /// Slot start time for an index (inverse of `slot_index`).
    pub fn slot_time(&self, index: u16) -> Option<NaiveTime> {
        if index >= self.total_slots {
            return None;
        }
        let minutes = index as u32 * self.slot_size_minutes;
        let secs = self.day_start.num_seconds_from_midnight() + minutes * 60;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
    }

    pub fn slot_session(&self, index: u16) -> MarketSession {
        match self.slot_time(index) {
            None => MarketSession::Closed,
            Some(t) => {
                if t < self.market_open {
                    MarketSession::PreMarket
                } else if t < self.market_close {
                    MarketSession::MarketOpen
                } else {
                    MarketSession::PostMarket
                }
            }
        }
    }
}

fn minutes_between(start: NaiveTime, end: NaiveTime) -> u32 {
    let s = start.num_seconds_from_midnight();
    let e = end.num_seconds_from_midnight();
    e.saturating_sub(s) / 60
}

/// In-day accumulated volume per (symbol, slot). Value semantics: the
/// vendor's accumulated day volume as of slot end.
#[derive(Default)]
pub struct SlotVolumeCache {
    slots: DashMap<String, HashMap<u16, f64>>,
}

impl SlotVolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_volume(&self, symbol: &str, slot: u16, accumulated: f64) {
        let mut entry = self.slots.entry(symbol.to_string()).or_default();
        let current = entry.entry(slot).or_insert(0.0);
        // Accumulated volume never shrinks within a day; keep the max.
        if accumulated > *current {
            *current = accumulated;
        }
    }

    pub fn get_volume(&self, symbol: &str, slot: u16) -> Option<f64> {
        self.slots.get(symbol).and_then(|m| m.get(&slot).copied())
    }

    pub fn symbols_tracked(&self) -> usize {
        self.slots.len()
    }

    /// Trading-day boundary: every slot restarts.
    pub fn reset(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_day_has_192_slots() {
        let slots = SlotManager::standard(5);
        assert_eq!(slots.total_slots, 192);
    }

    #[test]
    fn slot_index_boundaries() {
        let slots = SlotManager::standard(5);
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(slots.slot_index(t(3, 59)), None);
        assert_eq!(slots.slot_index(t(4, 0)), Some(0));
        assert_eq!(slots.slot_index(t(4, 4)), Some(0));
        assert_eq!(slots.slot_index(t(4, 5)), Some(1));
        assert_eq!(slots.slot_index(t(9, 30)), Some(66));
        assert_eq!(slots.slot_index(t(19, 55)), Some(191));
        assert_eq!(slots.slot_index(t(20, 0)), None);
    }

    #[test]
    fn slot_time_inverts_index() {
        let slots = SlotManager::standard(5);
        let t930 = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        assert_eq!(slots.slot_time(66), Some(t930));
        assert_eq!(slots.slot_time(192), None);
    }

    #[test]
    fn slot_sessions_follow_market_hours() {
        let slots = SlotManager::standard(5);
        assert_eq!(slots.slot_session(0), MarketSession::PreMarket);
        assert_eq!(slots.slot_session(65), MarketSession::PreMarket);
        assert_eq!(slots.slot_session(66), MarketSession::MarketOpen);
        assert_eq!(slots.slot_session(143), MarketSession::MarketOpen);
        assert_eq!(slots.slot_session(144), MarketSession::PostMarket);
    }

    #[test]
    fn slot_volume_keeps_running_maximum_and_resets() {
        let cache = SlotVolumeCache::new();
        cache.update_volume("TSLA", 10, 1_000.0);
        cache.update_volume("TSLA", 10, 900.0); // stale duplicate, ignored
        cache.update_volume("TSLA", 10, 1_500.0);
        assert_eq!(cache.get_volume("TSLA", 10), Some(1_500.0));
        cache.reset();
        assert_eq!(cache.get_volume("TSLA", 10), None);
    }
}
