// src/models/session.rs

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Market session as defined by the exchange calendar.
///
/// Within one trading date the session only moves forward:
/// PRE_MARKET → MARKET_OPEN → POST_MARKET → CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSession {
    PreMarket,
    MarketOpen,
    PostMarket,
    Closed,
}

impl MarketSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSession::PreMarket => "pre_market",
            MarketSession::MarketOpen => "market_open",
            MarketSession::PostMarket => "post_market",
            MarketSession::Closed => "closed",
        }
    }

    /// Ordinal used by the forward-only invariant (CLOSED wraps the day).
    pub fn ordinal(&self) -> u8 {
        match self {
            MarketSession::PreMarket => 0,
            MarketSession::MarketOpen => 1,
            MarketSession::PostMarket => 2,
            MarketSession::Closed => 3,
        }
    }

    pub fn parse(s: &str) -> Option<MarketSession> {
        match s {
            "pre_market" => Some(MarketSession::PreMarket),
            "market_open" => Some(MarketSession::MarketOpen),
            "post_market" => Some(MarketSession::PostMarket),
            "closed" => Some(MarketSession::Closed),
            _ => None,
        }
    }
}

/// Full market status snapshot, owned by the session detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStatus {
    pub timestamp: DateTime<Utc>,
    pub current_session: MarketSession,
    pub trading_date: NaiveDate,
    pub is_trading_day: bool,
    pub is_holiday: bool,
    pub is_early_close: bool,
    pub market_close: NaiveTime,
    pub next_session: Option<MarketSession>,
    pub seconds_until_next_session: Option<i64>,
}

/// Emitted whenever the session or the trading date changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionChangeEvent {
    pub from_session: MarketSession,
    pub to_session: MarketSession,
    pub timestamp: DateTime<Utc>,
    pub trading_date: NaiveDate,
    pub is_new_day: bool,
    pub should_clear_buffers: bool,
}

/// Cached market holiday entry (`market:holiday:{date}:{exchange}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoliday {
    pub date: String,
    pub name: String,
    pub exchange: String,
    pub status: String,
    #[serde(default)]
    pub open: Option<String>,
    #[serde(default)]
    pub close: Option<String>,
}

impl MarketHoliday {
    pub fn is_closed(&self) -> bool {
        self.status == "closed"
    }

    pub fn is_early_close(&self) -> bool {
        self.status == "early-close"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_roundtrips_through_str() {
        for s in [
            MarketSession::PreMarket,
            MarketSession::MarketOpen,
            MarketSession::PostMarket,
            MarketSession::Closed,
        ] {
            assert_eq!(MarketSession::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn session_ordinals_are_forward_only() {
        assert!(MarketSession::PreMarket.ordinal() < MarketSession::MarketOpen.ordinal());
        assert!(MarketSession::MarketOpen.ordinal() < MarketSession::PostMarket.ordinal());
        assert!(MarketSession::PostMarket.ordinal() < MarketSession::Closed.ordinal());
    }
}
