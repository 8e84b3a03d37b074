// src/models/scanner.rs

//! Scanner domain types: the enriched working row, filter definitions,
//! category names and the delta records the ranking stream carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::session::MarketSession;

/// Ticker metadata, built nightly by maintenance and cached in the Bus
/// under `ticker:metadata:{symbol}` (24 h TTL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerMetadata {
    pub symbol: String,
    pub company_name: Option<String>,
    pub exchange: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub shares_outstanding: Option<f64>,
    pub float_shares: Option<f64>,
    pub avg_volume_3m: Option<f64>,
    pub avg_volume_10d: Option<f64>,
    pub avg_volume_30d: Option<f64>,
    pub avg_volume_5d: Option<f64>,
    pub beta: Option<f64>,
    #[serde(default)]
    pub is_etf: bool,
    #[serde(default = "default_true")]
    pub is_actively_trading: bool,
}

fn default_true() -> bool {
    true
}

impl TickerMetadata {
    /// Placeholder for a symbol with no reference data yet: every
    /// metadata-dependent field stays null so range-bound filters can
    /// reject the row on their own terms.
    pub fn empty(symbol: impl Into<String>) -> Self {
        TickerMetadata {
            symbol: symbol.into(),
            company_name: None,
            exchange: None,
            sector: None,
            industry: None,
            market_cap: None,
            shares_outstanding: None,
            float_shares: None,
            avg_volume_3m: None,
            avg_volume_10d: None,
            avg_volume_30d: None,
            avg_volume_5d: None,
            beta: None,
            is_etf: false,
            is_actively_trading: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GapDirection {
    Up,
    Down,
    Flat,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GapSizeClass {
    Small,
    Medium,
    Large,
    Extreme,
    #[default]
    Unknown,
}

impl GapSizeClass {
    /// |gap| < 2 → Small, < 5 → Medium, < 10 → Large, else Extreme.
    pub fn classify(gap_percent: Option<f64>) -> GapSizeClass {
        match gap_percent {
            None => GapSizeClass::Unknown,
            Some(g) => {
                let a = g.abs();
                if a < 2.0 {
                    GapSizeClass::Small
                } else if a < 5.0 {
                    GapSizeClass::Medium
                } else if a < 10.0 {
                    GapSizeClass::Large
                } else {
                    GapSizeClass::Extreme
                }
            }
        }
    }
}

/// The working unit inside the scanner. Lives for one scan cycle: it is
/// either discarded by a filter or emitted as part of the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerTicker {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,

    // Snapshot fields
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_size: Option<f64>,
    pub volume_today: f64,
    pub minute_volume: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub prev_close: Option<f64>,
    pub prev_volume: Option<f64>,
    pub last_trade_timestamp: Option<i64>,
    pub trades_today: Option<u64>,

    // Metadata
    pub company_name: Option<String>,
    pub exchange: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub shares_outstanding: Option<f64>,
    pub float_shares: Option<f64>,
    pub avg_volume_5d: Option<f64>,
    pub avg_volume_10d: Option<f64>,
    pub avg_volume_30d: Option<f64>,
    pub avg_volume_3m: Option<f64>,

    // Analytics
    pub rvol: Option<f64>,
    pub rvol_slot: Option<f64>,
    pub atr: Option<f64>,
    pub atr_percent: Option<f64>,
    pub vwap: Option<f64>,
    pub intraday_high: Option<f64>,
    pub intraday_low: Option<f64>,
    pub chg_5min: Option<f64>,
    pub vol_5min: Option<f64>,
    pub trades_z_score: Option<f64>,
    pub is_trade_anomaly: bool,

    // Derived
    pub change_percent: Option<f64>,
    pub change_from_open: Option<f64>,
    pub price_from_intraday_high: Option<f64>,
    pub price_from_intraday_low: Option<f64>,
    pub position_in_range: Option<f64>,
    pub spread: Option<f64>,
    pub distance_from_nbbo: Option<f64>,
    pub dollar_volume: Option<f64>,
    pub volume_today_pct: Option<f64>,
    pub volume_yesterday_pct: Option<f64>,

    // Gaps (session-dependent, see gaps.rs)
    pub gap_percent: Option<f64>,
    pub gap_from_prev_close: Option<f64>,
    pub gap_from_open: Option<f64>,
    pub gap_premarket: Option<f64>,
    pub gap_at_open: Option<f64>,
    pub gap_postmarket: Option<f64>,
    pub gap_fill_progress: Option<f64>,
    pub gap_direction: GapDirection,
    pub gap_size_class: GapSizeClass,

    // Post-market
    pub postmarket_change_percent: Option<f64>,
    pub postmarket_volume: Option<f64>,

    pub session: MarketSession,
    pub score: f64,
    pub rank: u32,
    pub filters_matched: Vec<String>,
}

impl ScannerTicker {
    /// Blank row carrying only identity; everything else is attached by
    /// the enrichment stage.
    pub fn new(symbol: impl Into<String>, price: f64, session: MarketSession) -> Self {
        ScannerTicker {
            symbol: symbol.into(),
            timestamp: Utc::now(),
            price,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            volume_today: 0.0,
            minute_volume: None,
            open: None,
            high: None,
            low: None,
            prev_close: None,
            prev_volume: None,
            last_trade_timestamp: None,
            trades_today: None,
            company_name: None,
            exchange: None,
            sector: None,
            industry: None,
            market_cap: None,
            shares_outstanding: None,
            float_shares: None,
            avg_volume_5d: None,
            avg_volume_10d: None,
            avg_volume_30d: None,
            avg_volume_3m: None,
            rvol: None,
            rvol_slot: None,
            atr: None,
            atr_percent: None,
            vwap: None,
            intraday_high: None,
            intraday_low: None,
            chg_5min: None,
            vol_5min: None,
            trades_z_score: None,
            is_trade_anomaly: false,
            change_percent: None,
            change_from_open: None,
            price_from_intraday_high: None,
            price_from_intraday_low: None,
            position_in_range: None,
            spread: None,
            distance_from_nbbo: None,
            dollar_volume: None,
            volume_today_pct: None,
            volume_yesterday_pct: None,
            gap_percent: None,
            gap_from_prev_close: None,
            gap_from_open: None,
            gap_premarket: None,
            gap_at_open: None,
            gap_postmarket: None,
            gap_fill_progress: None,
            gap_direction: GapDirection::Unknown,
            gap_size_class: GapSizeClass::Unknown,
            postmarket_change_percent: None,
            postmarket_volume: None,
            session,
            score: 0.0,
            rank: 0,
            filters_matched: Vec::new(),
        }
    }

    /// Effective RVOL for categorisation: slot-accurate first.
    pub fn effective_rvol(&self) -> Option<f64> {
        self.rvol_slot.or(self.rvol)
    }
}

// ─── Filters ────────────────────────────────────────────────────────────

/// Declarative range bounds over the enriched-ticker fields. A row
/// passes iff every non-null bound is satisfied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterParams {
    pub min_rvol: Option<f64>,
    pub max_rvol: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_spread: Option<f64>,
    pub max_spread: Option<f64>,
    pub min_bid_size: Option<f64>,
    pub max_bid_size: Option<f64>,
    pub min_ask_size: Option<f64>,
    pub max_ask_size: Option<f64>,
    pub min_distance_from_nbbo: Option<f64>,
    pub max_distance_from_nbbo: Option<f64>,
    pub min_volume: Option<f64>,
    pub min_minute_volume: Option<f64>,
    pub min_avg_volume_5d: Option<f64>,
    pub max_avg_volume_5d: Option<f64>,
    pub min_avg_volume_10d: Option<f64>,
    pub max_avg_volume_10d: Option<f64>,
    pub min_avg_volume_3m: Option<f64>,
    pub max_avg_volume_3m: Option<f64>,
    pub min_dollar_volume: Option<f64>,
    pub max_dollar_volume: Option<f64>,
    pub min_volume_today_pct: Option<f64>,
    pub max_volume_today_pct: Option<f64>,
    pub min_volume_yesterday_pct: Option<f64>,
    pub max_volume_yesterday_pct: Option<f64>,
    pub min_change_percent: Option<f64>,
    pub max_change_percent: Option<f64>,
    pub min_gap: Option<f64>,
    pub max_gap: Option<f64>,
    pub min_market_cap: Option<f64>,
    pub max_market_cap: Option<f64>,
    pub min_float: Option<f64>,
    pub max_float: Option<f64>,
    pub max_data_age_seconds: Option<f64>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub exchanges: Vec<String>,
    pub min_postmarket_change_percent: Option<f64>,
    pub max_postmarket_change_percent: Option<f64>,
    pub min_postmarket_volume: Option<f64>,
    pub max_postmarket_volume: Option<f64>,
}

/// One row of `scanner_filters`. Immutable between reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    /// Sessions the filter applies to; empty = all sessions.
    #[serde(default)]
    pub sessions: Vec<MarketSession>,
    pub parameters: FilterParams,
}

impl FilterConfig {
    pub fn applies_to_session(&self, session: MarketSession) -> bool {
        self.sessions.is_empty() || self.sessions.contains(&session)
    }
}

// ─── Categories ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerCategory {
    GappersUp,
    GappersDown,
    MomentumUp,
    MomentumDown,
    Anomalies,
    NewHighs,
    NewLows,
    Losers,
    Winners,
    HighVolume,
    Reversals,
    PostMarket,
}

impl ScannerCategory {
    pub const ALL: [ScannerCategory; 12] = [
        ScannerCategory::GappersUp,
        ScannerCategory::GappersDown,
        ScannerCategory::MomentumUp,
        ScannerCategory::MomentumDown,
        ScannerCategory::Anomalies,
        ScannerCategory::NewHighs,
        ScannerCategory::NewLows,
        ScannerCategory::Losers,
        ScannerCategory::Winners,
        ScannerCategory::HighVolume,
        ScannerCategory::Reversals,
        ScannerCategory::PostMarket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerCategory::GappersUp => "gappers_up",
            ScannerCategory::GappersDown => "gappers_down",
            ScannerCategory::MomentumUp => "momentum_up",
            ScannerCategory::MomentumDown => "momentum_down",
            ScannerCategory::Anomalies => "anomalies",
            ScannerCategory::NewHighs => "new_highs",
            ScannerCategory::NewLows => "new_lows",
            ScannerCategory::Losers => "losers",
            ScannerCategory::Winners => "winners",
            ScannerCategory::HighVolume => "high_volume",
            ScannerCategory::Reversals => "reversals",
            ScannerCategory::PostMarket => "post_market",
        }
    }
}

// ─── Deltas ─────────────────────────────────────────────────────────────

/// Incremental change between two rankings of one category. Batch order
/// is removes, adds, reranks, updates; the whole batch shares one
/// sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RankingDelta {
    Add {
        rank: u32,
        symbol: String,
        data: Box<ScannerTicker>,
    },
    Remove {
        symbol: String,
    },
    Rerank {
        symbol: String,
        old_rank: u32,
        new_rank: u32,
    },
    Update {
        rank: u32,
        symbol: String,
        data: Box<ScannerTicker>,
    },
}

impl RankingDelta {
    pub fn symbol(&self) -> &str {
        match self {
            RankingDelta::Add { symbol, .. } => symbol,
            RankingDelta::Remove { symbol } => symbol,
            RankingDelta::Rerank { symbol, .. } => symbol,
            RankingDelta::Update { symbol, .. } => symbol,
        }
    }
}

/// Result of one scan cycle (stats surface).
#[derive(Debug, Clone, Serialize)]
pub struct ScannerResult {
    pub timestamp: DateTime<Utc>,
    pub session: MarketSession,
    pub total_universe_size: usize,
    pub filtered_count: usize,
    pub scan_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_size_boundaries() {
        assert_eq!(GapSizeClass::classify(Some(1.99)), GapSizeClass::Small);
        assert_eq!(GapSizeClass::classify(Some(2.0)), GapSizeClass::Medium);
        assert_eq!(GapSizeClass::classify(Some(-4.99)), GapSizeClass::Medium);
        assert_eq!(GapSizeClass::classify(Some(5.0)), GapSizeClass::Large);
        assert_eq!(GapSizeClass::classify(Some(10.0)), GapSizeClass::Extreme);
        assert_eq!(GapSizeClass::classify(None), GapSizeClass::Unknown);
    }

    #[test]
    fn filter_session_gating() {
        let mut f = FilterConfig {
            id: Uuid::new_v4(),
            name: "premarket-watchlist".into(),
            enabled: true,
            priority: 0,
            sessions: vec![MarketSession::PreMarket],
            parameters: FilterParams::default(),
        };
        assert!(f.applies_to_session(MarketSession::PreMarket));
        assert!(!f.applies_to_session(MarketSession::MarketOpen));
        f.sessions.clear();
        assert!(f.applies_to_session(MarketSession::Closed));
    }

    #[test]
    fn delta_serializes_with_action_tag() {
        let d = RankingDelta::Rerank {
            symbol: "TSLA".into(),
            old_rank: 5,
            new_rank: 3,
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["action"], "rerank");
        assert_eq!(json["old_rank"], 5);
    }
}
