use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/* -----------------------  TICKERS  ----------------------- */
/// Row of `tickers_unified` (authoritative metadata copy).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TickerRow {
    pub symbol: String,
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
    pub beta: Option<f64>,
    pub is_etf: bool,
    pub is_actively_trading: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/* ---------------------- DAILY BARS ----------------------- */
/// Row of `market_data_daily` (split-adjusted, source of truth).
#[derive(Debug, Clone, FromRow)]
pub struct DailyBarRow {
    pub symbol: String,
    pub trading_date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub vwap: Option<f64>,
    pub trades_count: Option<i64>,
}

/* --------------------- VOLUME SLOTS ---------------------- */
/// Row of `volume_slots` (5-minute bars, compound PK).
#[derive(Debug, Clone, FromRow)]
pub struct VolumeSlotRow {
    pub trading_date: NaiveDate,
    pub symbol: String,
    pub slot_time: NaiveTime,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub vwap: Option<f64>,
    pub trades_count: Option<i64>,
}

/* ----------------------- FILTERS ------------------------- */
/// Row of `scanner_filters`; `sessions` and `parameters` are JSONB and
/// decoded into the typed filter config by the loader.
#[derive(Debug, Clone, FromRow)]
pub struct FilterRow {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub sessions: serde_json::Value,
    pub parameters: serde_json::Value,
}

/* --------------------- SCAN RESULTS ---------------------- */
#[derive(Debug, Clone, FromRow)]
pub struct ScanResultRow {
    pub time: DateTime<Utc>,
    pub symbol: String,
    pub session: String,
    pub price: f64,
    pub change_percent: Option<f64>,
    pub rvol: Option<f64>,
    pub score: f64,
    pub rank: i32,
}

/* ------------------- EARNINGS CALENDAR ------------------- */
#[derive(Debug, Clone, FromRow)]
pub struct EarningsRow {
    pub symbol: String,
    pub report_date: NaiveDate,
    pub time_slot: Option<String>,
    pub fiscal_quarter: Option<String>,
    pub eps_estimate: Option<f64>,
    pub eps_actual: Option<f64>,
    pub revenue_estimate: Option<f64>,
    pub revenue_actual: Option<f64>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
}
