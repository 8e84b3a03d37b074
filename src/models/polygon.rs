// src/models/polygon.rs

//! Vendor wire types. Deserialization is tolerant: unknown fields are
//! ignored and every numeric is optional, so one malformed row never
//! sinks a whole snapshot batch.

use serde::{Deserialize, Serialize};

/// OHLCV block inside a snapshot row (`day`, `prevDay`, `min`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotBar {
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
    /// Accumulated day volume (per-second aggregates only).
    pub av: Option<f64>,
    pub vw: Option<f64>,
    /// Trade count for the bar; `day.n` is trades-today.
    pub n: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotLastTrade {
    pub p: Option<f64>,
    pub s: Option<f64>,
    pub x: Option<i64>,
    pub t: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotLastQuote {
    /// Bid price / size
    pub p: Option<f64>,
    pub s: Option<f64>,
    /// Ask price / size
    #[serde(rename = "P")]
    pub ask: Option<f64>,
    #[serde(rename = "S")]
    pub ask_size: Option<f64>,
    pub t: Option<i64>,
}

/// One symbol row from the full-market snapshot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolygonSnapshot {
    pub ticker: String,
    #[serde(default)]
    pub day: Option<SnapshotBar>,
    #[serde(rename = "prevDay", default)]
    pub prev_day: Option<SnapshotBar>,
    #[serde(rename = "lastTrade", default)]
    pub last_trade: Option<SnapshotLastTrade>,
    #[serde(rename = "lastQuote", default)]
    pub last_quote: Option<SnapshotLastQuote>,
    #[serde(rename = "min", default)]
    pub minute: Option<SnapshotBar>,
    #[serde(rename = "todaysChange", default)]
    pub todays_change: Option<f64>,
    #[serde(rename = "todaysChangePerc", default)]
    pub todays_change_perc: Option<f64>,
    #[serde(default)]
    pub updated: Option<i64>,
}

impl PolygonSnapshot {
    /// First positive of last-trade price, day close, prev-day close.
    pub fn current_price(&self) -> Option<f64> {
        if let Some(p) = self.last_trade.as_ref().and_then(|t| t.p) {
            if p > 0.0 {
                return Some(p);
            }
        }
        if let Some(c) = self.day.as_ref().and_then(|d| d.c) {
            if c > 0.0 {
                return Some(c);
            }
        }
        if let Some(c) = self.prev_day.as_ref().and_then(|d| d.c) {
            if c > 0.0 {
                return Some(c);
            }
        }
        None
    }

    pub fn current_volume(&self) -> f64 {
        self.day.as_ref().and_then(|d| d.v).unwrap_or(0.0)
    }

    /// Trades executed today (`day.n`), feeding the anomaly detector.
    pub fn trades_today(&self) -> Option<u64> {
        self.day.as_ref().and_then(|d| d.n)
    }
}

/// The single-slot value stored under `snapshot:polygon:latest` and
/// `snapshot:enriched:latest` (`timestamp` identifies the tick).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope<T> {
    pub timestamp: String,
    pub count: usize,
    pub tickers: Vec<T>,
}

// ─── WebSocket events ───────────────────────────────────────────────────

/// Inbound WS frame entries, tagged by `ev`. Frames arrive as JSON
/// arrays; unrecognised tags are skipped by the demux loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "ev")]
pub enum PolygonWsEvent {
    #[serde(rename = "T")]
    Trade(WsTrade),
    #[serde(rename = "Q")]
    Quote(WsQuote),
    #[serde(rename = "A")]
    Aggregate(WsAggregate),
    #[serde(rename = "AM")]
    MinuteAggregate(WsAggregate),
    #[serde(rename = "status")]
    Status(WsStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTrade {
    pub sym: String,
    pub p: Option<f64>,
    pub s: Option<f64>,
    pub x: Option<i64>,
    pub t: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsQuote {
    pub sym: String,
    pub bp: Option<f64>,
    pub bs: Option<f64>,
    pub ap: Option<f64>,
    #[serde(rename = "as")]
    pub ask_size: Option<f64>,
    pub t: Option<i64>,
}

/// Per-second or per-minute aggregate. `av` is vendor-accumulated day
/// volume, `vw` the session VWAP, `e` the bar-end timestamp (ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsAggregate {
    pub sym: String,
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
    pub av: Option<f64>,
    pub vw: Option<f64>,
    pub n: Option<u64>,
    pub s: Option<i64>,
    pub e: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsStatus {
    pub status: Option<String>,
    pub message: Option<String>,
}

// ─── Reference endpoints ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PolygonMarketStatus {
    pub market: Option<String>,
    #[serde(rename = "earlyHours", default)]
    pub early_hours: Option<bool>,
    #[serde(rename = "afterHours", default)]
    pub after_hours: Option<bool>,
    #[serde(rename = "serverTime", default)]
    pub server_time: Option<String>,
}

impl PolygonMarketStatus {
    /// Vendor status → session. `market` is "open"/"closed"/"extended-hours".
    pub fn session(&self) -> Option<crate::models::session::MarketSession> {
        use crate::models::session::MarketSession;
        match self.market.as_deref() {
            Some("open") => Some(MarketSession::MarketOpen),
            Some("extended-hours") => {
                if self.early_hours == Some(true) {
                    Some(MarketSession::PreMarket)
                } else {
                    Some(MarketSession::PostMarket)
                }
            }
            Some("closed") => Some(MarketSession::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolygonUpcoming {
    pub date: Option<String>,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub open: Option<String>,
    #[serde(default)]
    pub close: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolygonSplit {
    pub ticker: Option<String>,
    pub execution_date: Option<String>,
    pub split_from: Option<f64>,
    pub split_to: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolygonTickerDetails {
    pub ticker: Option<String>,
    pub name: Option<String>,
    pub market: Option<String>,
    pub primary_exchange: Option<String>,
    pub sic_description: Option<String>,
    pub market_cap: Option<f64>,
    pub share_class_shares_outstanding: Option<f64>,
    pub weighted_shares_outstanding: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(rename = "type", default)]
    pub ticker_type: Option<String>,
}

/// Daily aggregate bar from the grouped-daily endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PolygonDailyBar {
    #[serde(rename = "T")]
    pub ticker: Option<String>,
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
    pub vw: Option<f64>,
    pub n: Option<u64>,
    pub t: Option<i64>,
}

/// Intraday 5-minute bar from the range-aggregates endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PolygonRangeBar {
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    pub c: Option<f64>,
    pub v: Option<f64>,
    pub vw: Option<f64>,
    pub n: Option<u64>,
    pub t: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_price_prefers_last_trade() {
        let snap: PolygonSnapshot = serde_json::from_str(
            r#"{"ticker":"ABCD","day":{"c":11.9},"prevDay":{"c":11.0},"lastTrade":{"p":12.1}}"#,
        )
        .unwrap();
        assert_eq!(snap.current_price(), Some(12.1));
    }

    #[test]
    fn current_price_falls_back_to_prev_close() {
        let snap: PolygonSnapshot = serde_json::from_str(
            r#"{"ticker":"ABCD","day":{"c":0.0},"prevDay":{"c":11.0}}"#,
        )
        .unwrap();
        assert_eq!(snap.current_price(), Some(11.0));
    }

    #[test]
    fn current_price_none_when_everything_missing() {
        let snap: PolygonSnapshot = serde_json::from_str(r#"{"ticker":"ABCD"}"#).unwrap();
        assert_eq!(snap.current_price(), None);
        assert_eq!(snap.current_volume(), 0.0);
    }

    #[test]
    fn ws_event_demux_by_tag() {
        let raw = r#"[{"ev":"A","sym":"TSLA","c":240.1,"av":1000000,"vw":239.8,"e":1700000000000},
                      {"ev":"status","status":"connected","message":"ok"}]"#;
        let events: Vec<serde_json::Value> = serde_json::from_str(raw).unwrap();
        let parsed: Vec<PolygonWsEvent> = events
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        assert_eq!(parsed.len(), 2);
        match &parsed[0] {
            PolygonWsEvent::Aggregate(a) => assert_eq!(a.sym, "TSLA"),
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn unknown_event_tags_are_skipped_not_fatal() {
        let raw = r#"[{"ev":"LULD","sym":"XXXX"},{"ev":"T","sym":"TSLA","p":240.0}]"#;
        let events: Vec<serde_json::Value> = serde_json::from_str(raw).unwrap();
        let parsed: Vec<PolygonWsEvent> = events
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        assert_eq!(parsed.len(), 1);
    }
}
