// src/services/scanner/gaps.rs

//! Gap computation by session, plus the per-symbol day tracker that
//! latches the pre-market peak and the gap at the open.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::scanner::{GapDirection, GapSizeClass, ScannerTicker};
use crate::models::session::MarketSession;

/// All gaps derivable from one row. Session decides which of the
/// specific gaps is populated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapSet {
    pub gap_from_prev_close: Option<f64>,
    pub gap_from_open: Option<f64>,
    pub gap_premarket: Option<f64>,
    pub gap_postmarket: Option<f64>,
    pub gap_fill_progress: Option<f64>,
    pub position_in_range: Option<f64>,
    pub direction: GapDirection,
    pub size_class: GapSizeClass,
}

pub fn pct(value: f64, reference: f64) -> Option<f64> {
    if reference > 0.0 {
        Some((value - reference) / reference * 100.0)
    } else {
        None
    }
}

/// Compute every gap for a row. `day_close` is the 4 PM close used as
/// the post-market reference.
pub fn calculate_gaps(
    price: f64,
    prev_close: Option<f64>,
    day_open: Option<f64>,
    day_close: Option<f64>,
    day_high: Option<f64>,
    day_low: Option<f64>,
    session: MarketSession,
) -> GapSet {
    let gap_from_prev_close = prev_close.and_then(|pc| pct(price, pc));
    let gap_from_open = day_open.and_then(|o| pct(price, o));

    let (gap_premarket, gap_postmarket) = match session {
        MarketSession::PreMarket => (gap_from_prev_close, None),
        MarketSession::MarketOpen => (None, None),
        MarketSession::PostMarket => (None, day_close.and_then(|c| pct(price, c))),
        MarketSession::Closed => (None, None),
    };

    let direction = match gap_from_prev_close {
        Some(g) if g > 0.0 => GapDirection::Up,
        Some(g) if g < 0.0 => GapDirection::Down,
        Some(_) => GapDirection::Flat,
        None => GapDirection::Unknown,
    };

    // Gap-fill progress: how far the price has retraced back toward the
    // previous close, 0–100.
    let gap_fill_progress = match (prev_close, day_open) {
        (Some(pc), Some(o)) if o > pc && o > 0.0 => {
            if price < o {
                Some(((o - price) / (o - pc) * 100.0).clamp(0.0, 100.0))
            } else {
                Some(0.0)
            }
        }
        (Some(pc), Some(o)) if o < pc => {
            if price > o {
                Some(((price - o) / (pc - o) * 100.0).clamp(0.0, 100.0))
            } else {
                Some(0.0)
            }
        }
        (Some(_), Some(_)) => Some(0.0),
        _ => None,
    };

    let position_in_range = match (day_high, day_low) {
        (Some(h), Some(l)) if h > l => Some(((price - l) / (h - l) * 100.0).clamp(0.0, 100.0)),
        _ => None,
    };

    GapSet {
        gap_from_prev_close,
        gap_from_open,
        gap_premarket,
        gap_postmarket,
        gap_fill_progress,
        position_in_range,
        direction,
        size_class: GapSizeClass::classify(gap_from_prev_close),
    }
}

/// Attach the gap set to an enriched row in place.
pub fn apply_gaps(ticker: &mut ScannerTicker, gaps: &GapSet) {
    ticker.gap_from_prev_close = gaps.gap_from_prev_close;
    ticker.gap_percent = gaps.gap_from_prev_close;
    ticker.gap_from_open = gaps.gap_from_open;
    ticker.change_from_open = gaps.gap_from_open;
    ticker.gap_premarket = gaps.gap_premarket;
    ticker.gap_postmarket = gaps.gap_postmarket;
    ticker.gap_fill_progress = gaps.gap_fill_progress;
    ticker.position_in_range = gaps.position_in_range;
    ticker.gap_direction = gaps.direction;
    ticker.gap_size_class = gaps.size_class;
    if ticker.session == MarketSession::PostMarket {
        ticker.postmarket_change_percent = gaps.gap_postmarket;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GapRecord {
    /// Peak |gap| seen during pre-market.
    pub premarket_gap: Option<f64>,
    /// Latched at the first observation after this symbol's own
    /// PRE_MARKET → MARKET_OPEN transition; never overwritten.
    pub open_gap: Option<f64>,
    /// Running max |gap| for the day.
    pub high_gap: Option<f64>,
    pub current_gap: f64,
    pub last_update: DateTime<Utc>,
    last_session: MarketSession,
}

/// Per-symbol gap latching over the trading day. The open-gap latch
/// needs the symbol's own previous session, not the global one: a
/// symbol first seen mid-morning never gets a synthetic open gap.
#[derive(Default)]
pub struct GapTracker {
    tracking: DashMap<String, GapRecord>,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(
        &self,
        symbol: &str,
        session: MarketSession,
        gap_percent: f64,
        timestamp: DateTime<Utc>,
    ) {
        let mut entry = self
            .tracking
            .entry(symbol.to_string())
            .or_insert_with(|| GapRecord {
                premarket_gap: None,
                open_gap: None,
                high_gap: None,
                current_gap: gap_percent,
                last_update: timestamp,
                last_session: session,
            });
        let record = entry.value_mut();

        match session {
            MarketSession::PreMarket => {
                let peak = record
                    .premarket_gap
                    .map(|g| gap_percent.abs() > g.abs())
                    .unwrap_or(true);
                if peak {
                    record.premarket_gap = Some(gap_percent);
                }
            }
            MarketSession::MarketOpen => {
                if record.open_gap.is_none()
                    && record.last_session == MarketSession::PreMarket
                {
                    record.open_gap = Some(gap_percent);
                }
                let high = record
                    .high_gap
                    .map(|g| gap_percent.abs() > g.abs())
                    .unwrap_or(true);
                if high {
                    record.high_gap = Some(gap_percent);
                }
            }
            _ => {}
        }

        record.current_gap = gap_percent;
        record.last_update = timestamp;
        record.last_session = session;
    }

    pub fn get(&self, symbol: &str) -> Option<GapRecord> {
        self.tracking.get(symbol).map(|r| r.clone())
    }

    pub fn symbols_tracked(&self) -> usize {
        self.tracking.len()
    }

    pub fn clear_for_new_day(&self) {
        self.tracking.clear();
        log::info!("gap tracker cleared for new trading day");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premarket_gap_maps_from_prev_close() {
        // ABCD 12.10 over prev close 11.00 → 10%
        let gaps = calculate_gaps(
            12.10,
            Some(11.0),
            None,
            None,
            None,
            None,
            MarketSession::PreMarket,
        );
        let g = gaps.gap_from_prev_close.unwrap();
        assert!((g - 10.0).abs() < 1e-9);
        assert_eq!(gaps.gap_premarket, gaps.gap_from_prev_close);
        assert_eq!(gaps.gap_postmarket, None);
        assert_eq!(gaps.direction, GapDirection::Up);
        assert_eq!(gaps.size_class, GapSizeClass::Extreme);
    }

    #[test]
    fn postmarket_gap_uses_day_close() {
        let gaps = calculate_gaps(
            10.1,
            Some(9.0),
            Some(9.5),
            Some(10.0),
            None,
            None,
            MarketSession::PostMarket,
        );
        let pm = gaps.gap_postmarket.unwrap();
        assert!((pm - 1.0).abs() < 1e-9);
        assert_eq!(gaps.gap_premarket, None);
    }

    #[test]
    fn closed_session_has_no_session_gaps() {
        let gaps = calculate_gaps(
            10.0,
            Some(9.0),
            Some(9.5),
            Some(10.0),
            None,
            None,
            MarketSession::Closed,
        );
        assert_eq!(gaps.gap_premarket, None);
        assert_eq!(gaps.gap_postmarket, None);
        assert!(gaps.gap_from_prev_close.is_some());
    }

    #[test]
    fn zero_denominators_give_none() {
        let gaps = calculate_gaps(
            10.0,
            Some(0.0),
            Some(0.0),
            None,
            None,
            None,
            MarketSession::MarketOpen,
        );
        assert_eq!(gaps.gap_from_prev_close, None);
        assert_eq!(gaps.gap_from_open, None);
        assert_eq!(gaps.direction, GapDirection::Unknown);
    }

    #[test]
    fn gap_fill_progress_on_fading_gap_up() {
        // Open 11 over prev close 10, price back down to 10.5 → 50% filled.
        let gaps = calculate_gaps(
            10.5,
            Some(10.0),
            Some(11.0),
            None,
            None,
            None,
            MarketSession::MarketOpen,
        );
        assert!((gaps.gap_fill_progress.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn open_gap_latches_once_per_symbol() {
        let tracker = GapTracker::new();
        let t0 = Utc::now();

        // Pre-market observations, peak 8%.
        tracker.track("SYMB", MarketSession::PreMarket, 6.0, t0);
        tracker.track("SYMB", MarketSession::PreMarket, 8.0, t0);
        tracker.track("SYMB", MarketSession::PreMarket, 7.0, t0);

        // First tick after the open latches open_gap…
        tracker.track("SYMB", MarketSession::MarketOpen, 7.5, t0);
        // …and later ticks move high_gap but never open_gap.
        tracker.track("SYMB", MarketSession::MarketOpen, 9.0, t0);

        let record = tracker.get("SYMB").unwrap();
        assert_eq!(record.premarket_gap, Some(8.0));
        assert_eq!(record.open_gap, Some(7.5));
        assert_eq!(record.high_gap, Some(9.0));
        assert_eq!(record.current_gap, 9.0);
    }

    #[test]
    fn symbol_first_seen_intraday_gets_no_open_gap() {
        let tracker = GapTracker::new();
        let t0 = Utc::now();
        tracker.track("LATE", MarketSession::MarketOpen, 3.0, t0);
        tracker.track("LATE", MarketSession::MarketOpen, 4.0, t0);
        let record = tracker.get("LATE").unwrap();
        assert_eq!(record.open_gap, None);
        assert_eq!(record.high_gap, Some(4.0));
    }

    #[test]
    fn premarket_peak_is_absolute() {
        let tracker = GapTracker::new();
        let t0 = Utc::now();
        tracker.track("DOWN", MarketSession::PreMarket, -3.0, t0);
        tracker.track("DOWN", MarketSession::PreMarket, -9.0, t0);
        tracker.track("DOWN", MarketSession::PreMarket, -4.0, t0);
        assert_eq!(tracker.get("DOWN").unwrap().premarket_gap, Some(-9.0));
    }

    #[test]
    fn day_change_clears_tracking() {
        let tracker = GapTracker::new();
        tracker.track("SYMB", MarketSession::PreMarket, 2.0, Utc::now());
        tracker.clear_for_new_day();
        assert_eq!(tracker.symbols_tracked(), 0);
        assert!(tracker.get("SYMB").is_none());
    }
}
