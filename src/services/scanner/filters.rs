// src/services/scanner/filters.rs

//! Declarative filter evaluation. Filters are data (rows of
//! `scanner_filters`), not code: a fixed table of
//! (min-bound, max-bound, row-field) triples is walked per row, so a
//! new bound is one table line, not a new comparator.

use chrono::Utc;

use crate::db::models::FilterRow;
use crate::models::scanner::{FilterConfig, FilterParams, ScannerTicker};
use crate::models::session::MarketSession;

type ParamGet = fn(&FilterParams) -> Option<f64>;
type FieldGet = fn(&ScannerTicker) -> Option<f64>;

/// (min bound, max bound, row field, pass-when-row-value-missing).
///
/// RVOL is the one field where a missing value passes: early pre-market
/// legitimately has no baseline yet.
const FILTER_DEFINITIONS: &[(Option<ParamGet>, Option<ParamGet>, FieldGet, bool)] = &[
    (
        Some(|p| p.min_rvol),
        Some(|p| p.max_rvol),
        |t| t.rvol,
        true,
    ),
    (
        Some(|p| p.min_price),
        Some(|p| p.max_price),
        |t| Some(t.price),
        false,
    ),
    (
        Some(|p| p.min_spread),
        Some(|p| p.max_spread),
        |t| t.spread,
        false,
    ),
    (
        Some(|p| p.min_bid_size),
        Some(|p| p.max_bid_size),
        |t| t.bid_size,
        false,
    ),
    (
        Some(|p| p.min_ask_size),
        Some(|p| p.max_ask_size),
        |t| t.ask_size,
        false,
    ),
    (
        Some(|p| p.min_distance_from_nbbo),
        Some(|p| p.max_distance_from_nbbo),
        |t| t.distance_from_nbbo,
        false,
    ),
    (Some(|p| p.min_volume), None, |t| Some(t.volume_today), false),
    (
        Some(|p| p.min_minute_volume),
        None,
        |t| t.minute_volume,
        false,
    ),
    (
        Some(|p| p.min_avg_volume_5d),
        Some(|p| p.max_avg_volume_5d),
        |t| t.avg_volume_5d,
        false,
    ),
    (
        Some(|p| p.min_avg_volume_10d),
        Some(|p| p.max_avg_volume_10d),
        |t| t.avg_volume_10d,
        false,
    ),
    (
        Some(|p| p.min_avg_volume_3m),
        Some(|p| p.max_avg_volume_3m),
        |t| t.avg_volume_3m,
        false,
    ),
    (
        Some(|p| p.min_dollar_volume),
        Some(|p| p.max_dollar_volume),
        |t| t.dollar_volume,
        false,
    ),
    (
        Some(|p| p.min_volume_today_pct),
        Some(|p| p.max_volume_today_pct),
        |t| t.volume_today_pct,
        false,
    ),
    (
        Some(|p| p.min_volume_yesterday_pct),
        Some(|p| p.max_volume_yesterday_pct),
        |t| t.volume_yesterday_pct,
        false,
    ),
    (
        Some(|p| p.min_change_percent),
        Some(|p| p.max_change_percent),
        |t| t.change_percent,
        false,
    ),
    (
        Some(|p| p.min_gap),
        Some(|p| p.max_gap),
        |t| t.gap_percent,
        false,
    ),
    (
        Some(|p| p.min_market_cap),
        Some(|p| p.max_market_cap),
        |t| t.market_cap,
        false,
    ),
    (
        Some(|p| p.min_float),
        Some(|p| p.max_float),
        |t| t.float_shares,
        false,
    ),
];

/// [min, max] check. No bound set → pass; value missing → pass only
/// where the table says so.
fn check_min_max(
    value: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    allow_missing: bool,
) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let value = match value {
        Some(v) => v,
        None => return allow_missing,
    };
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}

/// All bounds of one filter against one row.
pub fn apply_filter(
    ticker: &ScannerTicker,
    params: &FilterParams,
    current_session: MarketSession,
) -> bool {
    for &(min_get, max_get, field_get, allow_missing) in FILTER_DEFINITIONS {
        let min = min_get.and_then(|f| f(params));
        let max = max_get.and_then(|f| f(params));
        if !check_min_max(field_get(ticker), min, max, allow_missing) {
            return false;
        }
    }

    // Data freshness needs its own rule: a missing trade timestamp
    // fails the bound rather than passing it.
    if let Some(max_age) = params.max_data_age_seconds {
        match ticker.last_trade_timestamp {
            Some(ts_ns) => {
                let age_secs = (Utc::now().timestamp_nanos_opt().unwrap_or(0) - ts_ns) as f64
                    / 1_000_000_000.0;
                if age_secs > max_age {
                    return false;
                }
            }
            None => return false,
        }
    }

    // Whitelists
    if !params.sectors.is_empty() {
        match &ticker.sector {
            Some(s) if params.sectors.contains(s) => {}
            _ => return false,
        }
    }
    if !params.industries.is_empty() {
        match &ticker.industry {
            Some(i) if params.industries.contains(i) => {}
            _ => return false,
        }
    }
    if !params.exchanges.is_empty() {
        match &ticker.exchange {
            Some(e) if params.exchanges.contains(e) => {}
            _ => return false,
        }
    }

    // Post-market bounds only bind during POST_MARKET.
    if current_session == MarketSession::PostMarket {
        if !check_min_max(
            ticker.postmarket_change_percent,
            params.min_postmarket_change_percent,
            params.max_postmarket_change_percent,
            false,
        ) {
            return false;
        }
        if !check_min_max(
            ticker.postmarket_volume,
            params.min_postmarket_volume,
            params.max_postmarket_volume,
            false,
        ) {
            return false;
        }
    }

    true
}

pub struct FilterEngine {
    filters: Vec<FilterConfig>,
    current_session: MarketSession,
}

impl FilterEngine {
    pub fn new(filters: Vec<FilterConfig>, current_session: MarketSession) -> Self {
        Self {
            filters,
            current_session,
        }
    }

    pub fn set_session(&mut self, session: MarketSession) {
        self.current_session = session;
    }

    pub fn set_filters(&mut self, filters: Vec<FilterConfig>) {
        self.filters = filters;
    }

    pub fn filters(&self) -> &[FilterConfig] {
        &self.filters
    }

    /// A row passes the set iff it passes every enabled filter whose
    /// session set contains the current session. The names of the
    /// filters it matched are returned for the emitted row; None means
    /// rejected (early exit on the first failure).
    pub fn passes_all(&self, ticker: &ScannerTicker) -> Option<Vec<String>> {
        let mut matched = Vec::new();
        for filter in &self.filters {
            if !filter.enabled {
                continue;
            }
            if !filter.applies_to_session(self.current_session) {
                continue;
            }
            if apply_filter(ticker, &filter.parameters, self.current_session) {
                matched.push(filter.name.clone());
            } else {
                return None;
            }
        }
        Some(matched)
    }
}

/// Decode one warehouse row into the typed config. Malformed JSON in
/// `sessions` or `parameters` disables the filter rather than the scan.
pub fn filter_from_row(row: &FilterRow) -> Option<FilterConfig> {
    let sessions: Vec<MarketSession> = match serde_json::from_value(row.sessions.clone()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("filter {} has malformed sessions: {e}", row.name);
            return None;
        }
    };
    let parameters: FilterParams = match serde_json::from_value(row.parameters.clone()) {
        Ok(p) => p,
        Err(e) => {
            log::error!("filter {} has malformed parameters: {e}", row.name);
            return None;
        }
    };
    Some(FilterConfig {
        id: row.id,
        name: row.name.clone(),
        enabled: row.enabled,
        priority: row.priority,
        sessions,
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ticker(price: f64) -> ScannerTicker {
        let mut t = ScannerTicker::new("TEST", price, MarketSession::MarketOpen);
        t.volume_today = 100_000.0;
        t
    }

    fn config(name: &str, params: FilterParams, sessions: Vec<MarketSession>) -> FilterConfig {
        FilterConfig {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            priority: 0,
            sessions,
            parameters: params,
        }
    }

    #[test]
    fn price_bounds_reject_and_admit() {
        let params = FilterParams {
            min_price: Some(1.0),
            max_price: Some(20.0),
            ..Default::default()
        };
        assert!(apply_filter(&ticker(12.1), &params, MarketSession::MarketOpen));
        assert!(!apply_filter(&ticker(0.8), &params, MarketSession::MarketOpen));
        assert!(!apply_filter(&ticker(25.0), &params, MarketSession::MarketOpen));
    }

    #[test]
    fn missing_rvol_passes_rvol_bound() {
        let params = FilterParams {
            min_rvol: Some(2.0),
            ..Default::default()
        };
        let t = ticker(10.0); // rvol None
        assert!(apply_filter(&t, &params, MarketSession::MarketOpen));

        let mut t2 = ticker(10.0);
        t2.rvol = Some(1.0);
        assert!(!apply_filter(&t2, &params, MarketSession::MarketOpen));
    }

    #[test]
    fn missing_market_cap_fails_cap_bound() {
        let params = FilterParams {
            min_market_cap: Some(1e9),
            ..Default::default()
        };
        assert!(!apply_filter(&ticker(10.0), &params, MarketSession::MarketOpen));
    }

    #[test]
    fn sector_whitelist() {
        let params = FilterParams {
            sectors: vec!["Healthcare".into()],
            ..Default::default()
        };
        let mut t = ticker(10.0);
        assert!(!apply_filter(&t, &params, MarketSession::MarketOpen));
        t.sector = Some("Healthcare".into());
        assert!(apply_filter(&t, &params, MarketSession::MarketOpen));
        t.sector = Some("Energy".into());
        assert!(!apply_filter(&t, &params, MarketSession::MarketOpen));
    }

    #[test]
    fn max_data_age_rejects_missing_timestamp() {
        let params = FilterParams {
            max_data_age_seconds: Some(30.0),
            ..Default::default()
        };
        assert!(!apply_filter(&ticker(10.0), &params, MarketSession::MarketOpen));

        let mut fresh = ticker(10.0);
        fresh.last_trade_timestamp = Utc::now().timestamp_nanos_opt();
        assert!(apply_filter(&fresh, &params, MarketSession::MarketOpen));
    }

    #[test]
    fn postmarket_bounds_only_bind_in_postmarket() {
        let params = FilterParams {
            min_postmarket_volume: Some(20_000.0),
            ..Default::default()
        };
        let t = ticker(10.0); // no postmarket volume
        assert!(apply_filter(&t, &params, MarketSession::MarketOpen));
        assert!(!apply_filter(&t, &params, MarketSession::PostMarket));
    }

    #[test]
    fn engine_respects_session_sets_and_collects_names() {
        let premarket = config(
            "premarket-watchlist",
            FilterParams {
                min_gap: Some(5.0),
                min_price: Some(1.0),
                ..Default::default()
            },
            vec![MarketSession::PreMarket],
        );
        let always = config("liquid", FilterParams::default(), vec![]);

        let mut t = ScannerTicker::new("ABCD", 12.1, MarketSession::PreMarket);
        t.gap_percent = Some(10.0);

        let engine = FilterEngine::new(vec![premarket.clone(), always.clone()], MarketSession::PreMarket);
        let matched = engine.passes_all(&t).unwrap();
        assert_eq!(matched, vec!["premarket-watchlist".to_string(), "liquid".to_string()]);

        // Outside pre-market the gap filter no longer applies at all.
        let engine = FilterEngine::new(vec![premarket, always], MarketSession::MarketOpen);
        let mut flat = ScannerTicker::new("FLAT", 12.1, MarketSession::MarketOpen);
        flat.gap_percent = Some(0.1);
        assert!(engine.passes_all(&flat).is_some());
    }

    #[test]
    fn first_failing_filter_rejects_row() {
        let strict = config(
            "strict",
            FilterParams {
                min_price: Some(100.0),
                ..Default::default()
            },
            vec![],
        );
        let engine = FilterEngine::new(vec![strict], MarketSession::MarketOpen);
        assert!(engine.passes_all(&ticker(10.0)).is_none());
    }

    #[test]
    fn disabled_filters_are_skipped() {
        let mut off = config(
            "off",
            FilterParams {
                min_price: Some(1_000.0),
                ..Default::default()
            },
            vec![],
        );
        off.enabled = false;
        let engine = FilterEngine::new(vec![off], MarketSession::MarketOpen);
        assert_eq!(engine.passes_all(&ticker(10.0)), Some(vec![]));
    }

    #[test]
    fn filter_row_with_bad_json_is_dropped() {
        let row = FilterRow {
            id: Uuid::new_v4(),
            name: "broken".into(),
            enabled: true,
            priority: 1,
            sessions: serde_json::json!("not-a-list"),
            parameters: serde_json::json!({}),
        };
        assert!(filter_from_row(&row).is_none());
    }
}
