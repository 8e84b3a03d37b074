// src/services/scanner/categories.rs

//! Category assignment and per-category ranking.
//!
//! Single pass: every predicate is evaluated once per row and rows are
//! bucketed as they qualify; only non-empty buckets get sorted. That is
//! the difference between ~11 000 predicate evaluations per tick and
//! ~1 300.

use std::collections::HashMap;

use crate::models::scanner::{ScannerCategory, ScannerTicker};
use crate::models::session::MarketSession;

// GAPPERS
const GAP_UP_MIN: f64 = 2.0;
const GAP_DOWN_MAX: f64 = -2.0;

// MOMENTUM_UP ignition: 5-min move, proximity to HOD, price over VWAP,
// heavy relative volume. All four must hold.
const MOMENTUM_5MIN_IGNITION: f64 = 1.5;
const MOMENTUM_HOD_THRESHOLD: f64 = -2.0;
const MOMENTUM_RVOL_MIN: f64 = 5.0;

const MOMENTUM_STRONG: f64 = 3.0;
const MOMENTUM_EXTREME: f64 = 5.0;

// ANOMALIES: z-score only, no RVOL fallback.
const TRADES_ZSCORE_ANOMALY_MIN: f64 = 3.0;

const HIGH_VOLUME_RVOL_MIN: f64 = 2.0;

// NEW_HIGHS / NEW_LOWS: within 0.1% of the intraday extreme.
const NEAR_HIGH_RATIO: f64 = 0.999;
const NEAR_LOW_RATIO: f64 = 1.001;

const POSTMARKET_MIN_VOLUME: f64 = 20_000.0;
const POSTMARKET_MIN_CHANGE: f64 = 0.5;

pub struct Categorizer {
    pub limit_per_category: usize,
    pub hard_cap: usize,
}

impl Categorizer {
    pub fn new(limit_per_category: usize, hard_cap: usize) -> Self {
        Self {
            limit_per_category,
            hard_cap,
        }
    }

    /// Which categories one row belongs to. A row may land in several.
    pub fn categorize(&self, t: &ScannerTicker) -> Vec<ScannerCategory> {
        let mut categories = Vec::new();

        let gap = t.gap_percent;
        let change_total = t.change_percent;
        let change_from_open = t.change_from_open;

        // 1. GAPPERS
        if let Some(g) = gap {
            if g >= GAP_UP_MIN {
                categories.push(ScannerCategory::GappersUp);
            } else if g <= GAP_DOWN_MAX {
                categories.push(ScannerCategory::GappersDown);
            }
        }

        // 2. MOMENTUM_UP ignition
        let price_vs_vwap = t.vwap.and_then(|vw| {
            if vw > 0.0 {
                Some((t.price - vw) / vw * 100.0)
            } else {
                None
            }
        });
        if let (Some(chg5), Some(from_hod), Some(vs_vwap), Some(rvol)) = (
            t.chg_5min,
            t.price_from_intraday_high,
            price_vs_vwap,
            t.effective_rvol(),
        ) {
            if chg5 >= MOMENTUM_5MIN_IGNITION
                && from_hod >= MOMENTUM_HOD_THRESHOLD
                && vs_vwap > 0.0
                && rvol >= MOMENTUM_RVOL_MIN
            {
                categories.push(ScannerCategory::MomentumUp);
            }
        }

        // MOMENTUM_DOWN: strong negative day change
        if let Some(chg) = change_total {
            if chg <= -MOMENTUM_STRONG {
                categories.push(ScannerCategory::MomentumDown);
            }
        }

        // 3. WINNERS / LOSERS
        if let Some(chg) = change_total {
            if chg >= MOMENTUM_EXTREME {
                categories.push(ScannerCategory::Winners);
            } else if chg <= -MOMENTUM_EXTREME {
                categories.push(ScannerCategory::Losers);
            }
        }

        // 4. ANOMALIES: statistical only
        let is_anomaly = t
            .trades_z_score
            .map(|z| z >= TRADES_ZSCORE_ANOMALY_MIN)
            .unwrap_or(false)
            || t.is_trade_anomaly;
        if is_anomaly {
            categories.push(ScannerCategory::Anomalies);
        }

        // 5. HIGH VOLUME
        if let Some(rvol) = t.effective_rvol() {
            if rvol >= HIGH_VOLUME_RVOL_MIN {
                categories.push(ScannerCategory::HighVolume);
            }
        }

        // 6. NEW HIGHS / LOWS against the intraday extremes (pre/post
        // market included)
        if let Some(high) = t.intraday_high {
            if high > 0.0 && t.price >= NEAR_HIGH_RATIO * high {
                categories.push(ScannerCategory::NewHighs);
            }
        }
        if let Some(low) = t.intraday_low {
            if low > 0.0 && t.price <= NEAR_LOW_RATIO * low {
                categories.push(ScannerCategory::NewLows);
            }
        }

        // 7. REVERSALS: gapped one way, moving the other since the open
        if let (Some(g), Some(from_open)) = (gap, change_from_open) {
            if (g >= 2.0 && from_open <= -1.0) || (g <= -2.0 && from_open >= 1.0) {
                categories.push(ScannerCategory::Reversals);
            }
        }

        // 8. POST_MARKET activity
        if t.session == MarketSession::PostMarket {
            let has_volume = t
                .postmarket_volume
                .map(|v| v >= POSTMARKET_MIN_VOLUME)
                .unwrap_or(false);
            let has_change = t
                .postmarket_change_percent
                .map(|c| c.abs() >= POSTMARKET_MIN_CHANGE)
                .unwrap_or(false);
            if has_volume || has_change {
                categories.push(ScannerCategory::PostMarket);
            }
        }

        categories
    }

    /// All category rankings in a single pass over the filtered rows.
    pub fn rank_all(
        &self,
        tickers: &[ScannerTicker],
    ) -> HashMap<ScannerCategory, Vec<ScannerTicker>> {
        let limit = self.limit_per_category.min(self.hard_cap);

        let mut buckets: HashMap<ScannerCategory, Vec<ScannerTicker>> = HashMap::new();
        for ticker in tickers {
            for category in self.categorize(ticker) {
                buckets.entry(category).or_default().push(ticker.clone());
            }
        }

        for (category, rows) in buckets.iter_mut() {
            sort_category(*category, rows);
            rows.truncate(limit);
            for (idx, row) in rows.iter_mut().enumerate() {
                row.rank = idx as u32 + 1;
            }
        }

        buckets
    }
}

/// Per-category sort key. Ties always break by symbol ascending so a
/// re-derivation yields the same order.
fn sort_category(category: ScannerCategory, rows: &mut [ScannerTicker]) {
    use ScannerCategory::*;

    let key = |t: &ScannerTicker| -> f64 {
        match category {
            GappersUp | GappersDown => t.gap_percent.unwrap_or(0.0),
            MomentumUp => t.chg_5min.unwrap_or(0.0),
            Winners | MomentumDown | Losers => t.change_percent.unwrap_or(0.0),
            Anomalies => t.trades_z_score.unwrap_or(0.0),
            HighVolume => t.volume_today,
            NewHighs => t.price_from_intraday_high.map(|d| d.abs()).unwrap_or(999.0),
            NewLows => t.price_from_intraday_low.map(|d| d.abs()).unwrap_or(999.0),
            Reversals => t.score,
            PostMarket => t.postmarket_change_percent.map(|c| c.abs()).unwrap_or(0.0),
        }
    };
    let ascending = matches!(category, GappersDown | MomentumDown | Losers | NewHighs | NewLows);

    rows.sort_by(|a, b| {
        let (ka, kb) = (key(a), key(b));
        let ord = if ascending {
            ka.partial_cmp(&kb)
        } else {
            kb.partial_cmp(&ka)
        }
        .unwrap_or(std::cmp::Ordering::Equal);
        ord.then_with(|| a.symbol.cmp(&b.symbol))
    });
}
