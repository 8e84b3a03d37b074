// src/services/analytics/volume_window.rs

//! Rolling accumulated-volume windows fed from per-second aggregates.
//!
//! Deques are keyed by the VENDOR aggregate timestamp, not wall clock,
//! so replay and back-pressure do not distort the 5-minute window.
//! Formula: vol_5min = av[now] − av[5 min ago], linearly interpolated
//! to the exact boundary. Missing history returns None, never zero.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::America::New_York;
use dashmap::DashMap;

use crate::db::redis::{entry_f64, entry_field, RedisPool};
use crate::services::analytics::slots::{SlotManager, SlotVolumeCache};
use crate::services::polygon::ws::STREAM_AGGREGATES;

pub const WINDOW_SPAN_SECS: i64 = 300;
const RETENTION_SECS: i64 = 900;

const CONSUMER_GROUP: &str = "analytics_volume_window";
const CONSUMER_NAME: &str = "analytics_volume_window_1";

#[derive(Default)]
pub struct VolumeWindowTracker {
    windows: DashMap<String, VecDeque<(i64, f64)>>,
}

impl VolumeWindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one (vendor-ts, accumulated-volume) observation.
    /// Out-of-order or duplicate timestamps are dropped.
    pub fn update(&self, symbol: &str, accumulated: f64, ts_secs: i64) {
        let mut window = self.windows.entry(symbol.to_string()).or_default();
        if let Some(&(last_ts, _)) = window.back() {
            if ts_secs <= last_ts {
                return;
            }
        }
        window.push_back((ts_secs, accumulated));
        let cutoff = ts_secs - RETENTION_SECS;
        while let Some(&(front_ts, _)) = window.front() {
            if front_ts < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// av_now − av_5min_ago. None when the deque does not reach back to
    /// the 5-minute boundary yet.
    pub fn vol_5min(&self, symbol: &str) -> Option<f64> {
        let window = self.windows.get(symbol)?;
        window_delta(&window, WINDOW_SPAN_SECS)
    }

    pub fn symbols_active(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

/// Value delta over `span` seconds ending at the newest observation,
/// interpolating the older endpoint between its bracketing samples.
pub(crate) fn window_delta(window: &VecDeque<(i64, f64)>, span: i64) -> Option<f64> {
    let &(now_ts, now_val) = window.back()?;
    let target = now_ts - span;
    let &(first_ts, _) = window.front()?;
    if first_ts > target {
        return None; // not enough history
    }

    // Walk to the bracketing pair around `target`.
    let mut before = None;
    let mut after = None;
    for &(ts, val) in window.iter() {
        if ts <= target {
            before = Some((ts, val));
        } else {
            after = Some((ts, val));
            break;
        }
    }
    let (t0, v0) = before?;
    let base = match after {
        Some((t1, v1)) if t1 > t0 => {
            let frac = (target - t0) as f64 / (t1 - t0) as f64;
            v0 + (v1 - v0) * frac
        }
        _ => v0,
    };
    Some(now_val - base)
}

/// Consumer loop feeding the window tracker and the in-day slot cache
/// from `stream:realtime:aggregates`.
pub async fn run_consumer(
    redis: RedisPool,
    tracker: Arc<VolumeWindowTracker>,
    slot_volumes: Arc<SlotVolumeCache>,
    slots: SlotManager,
) {
    log::info!("volume window consumer started on {STREAM_AGGREGATES}");
    if let Err(e) = redis.ensure_group(STREAM_AGGREGATES, CONSUMER_GROUP).await {
        log::warn!("volume window group create: {e}");
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
                log::error!("volume window read: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut ids = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let (Some(symbol), Some(av)) = (
                    entry_field(&entry, "symbol"),
                    entry_f64(&entry, "volume_accumulated"),
                ) {
                    if av > 0.0 {
                        let ts = entry_f64(&entry, "timestamp_end")
                            .map(|ms| (ms / 1000.0) as i64)
                            .unwrap_or_else(|| chrono::Utc::now().timestamp());
                        tracker.update(&symbol, av, ts);

                        // In-day slot cache keyed by the vendor timestamp in ET.
                        if let Some(dt) = chrono::DateTime::from_timestamp(ts, 0) {
                            let et_time = dt.with_timezone(&New_York).time();
                            if let Some(slot) = slots.slot_index(et_time) {
                                slot_volumes.update_volume(&symbol, slot, av);
                            }
                        }
                    }
                }
                ids.push(entry.id.clone());
            }
        }
        if let Err(e) = redis.ack(STREAM_AGGREGATES, CONSUMER_GROUP, &ids).await {
            log::error!("volume window ack: {e}");
        }
        metrics::gauge!(
            "analytics_volume_window_symbols",
            tracker.symbols_active() as f64
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_minute_delta_with_exact_points() {
        let tracker = VolumeWindowTracker::new();
        tracker.update("TSLA", 1_000.0, 1_000);
        tracker.update("TSLA", 5_000.0, 1_300);
        assert_eq!(tracker.vol_5min("TSLA"), Some(4_000.0));
    }

    #[test]
    fn interpolates_to_the_boundary() {
        let tracker = VolumeWindowTracker::new();
        // Points at t=0 (av 0) and t=200 (av 2000); now at t=400 (av 4000).
        // Target = 400 - 300 = 100 → interpolated av 1000.
        tracker.update("TSLA", 0.0, 0);
        tracker.update("TSLA", 2_000.0, 200);
        tracker.update("TSLA", 4_000.0, 400);
        assert_eq!(tracker.vol_5min("TSLA"), Some(3_000.0));
    }

    #[test]
    fn missing_history_returns_none_not_zero() {
        let tracker = VolumeWindowTracker::new();
        tracker.update("TSLA", 9_000.0, 1_000);
        tracker.update("TSLA", 9_500.0, 1_100); // only 100 s of history
        assert_eq!(tracker.vol_5min("TSLA"), None);
        assert_eq!(tracker.vol_5min("UNKNOWN"), None);
    }

    #[test]
    fn evicts_entries_older_than_15_minutes() {
        let tracker = VolumeWindowTracker::new();
        tracker.update("TSLA", 100.0, 0);
        tracker.update("TSLA", 200.0, 901); // pushes t=0 past retention
        let window = tracker.windows.get("TSLA").unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window.front().unwrap().0, 901);
    }

    #[test]
    fn out_of_order_updates_are_ignored() {
        let tracker = VolumeWindowTracker::new();
        tracker.update("TSLA", 1_000.0, 500);
        tracker.update("TSLA", 900.0, 400); // replayed older message
        let window = tracker.windows.get("TSLA").unwrap();
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn clear_drops_all_state() {
        let tracker = VolumeWindowTracker::new();
        tracker.update("TSLA", 1_000.0, 500);
        tracker.clear();
        assert_eq!(tracker.symbols_active(), 0);
    }
}
