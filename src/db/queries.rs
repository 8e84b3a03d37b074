use crate::db::models::*;
use chrono::NaiveDate;
use sqlx::{PgPool, Result};

/* ---------------------- FILTERS ----------------------- */
pub async fn get_enabled_filters(pool: &PgPool) -> Result<Vec<FilterRow>> {
    sqlx::query_as::<_, FilterRow>(
        r#"SELECT id, name, enabled, priority, sessions, parameters
             FROM scanner_filters
            WHERE enabled = true
            ORDER BY priority DESC, name"#,
    )
    .fetch_all(pool)
    .await
}

/* --------------------- DAILY BARS --------------------- */
pub async fn upsert_daily_bar(pool: &PgPool, bar: &DailyBarRow) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO market_data_daily
               (symbol, trading_date, open, high, low, close, volume, vwap, trades_count)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
           ON CONFLICT (symbol, trading_date) DO UPDATE
              SET open = EXCLUDED.open,
                  high = EXCLUDED.high,
                  low  = EXCLUDED.low,
                  close = EXCLUDED.close,
                  volume = EXCLUDED.volume,
                  vwap = EXCLUDED.vwap,
                  trades_count = EXCLUDED.trades_count"#,
    )
    .bind(&bar.symbol)
    .bind(bar.trading_date)
    .bind(bar.open)
    .bind(bar.high)
    .bind(bar.low)
    .bind(bar.close)
    .bind(bar.volume)
    .bind(bar.vwap)
    .bind(bar.trades_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_daily_bars(pool: &PgPool, date: NaiveDate) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM market_data_daily WHERE trading_date = $1")
            .bind(date)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Last `limit` daily bars for a symbol, newest first (ATR source).
pub async fn recent_daily_bars(pool: &PgPool, symbol: &str, limit: i64) -> Result<Vec<DailyBarRow>> {
    sqlx::query_as::<_, DailyBarRow>(
        r#"SELECT symbol, trading_date, open, high, low, close, volume, vwap, trades_count
             FROM market_data_daily
            WHERE symbol = $1
            ORDER BY trading_date DESC
            LIMIT $2"#,
    )
    .bind(symbol)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn close_on_date(pool: &PgPool, symbol: &str, date: NaiveDate) -> Result<Option<f64>> {
    let row: Option<(Option<f64>,)> = sqlx::query_as(
        "SELECT close FROM market_data_daily WHERE symbol = $1 AND trading_date = $2",
    )
    .bind(symbol)
    .bind(date)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(|r| r.0))
}

/// Last trading date with data strictly before `date` for a symbol.
pub async fn last_date_before(
    pool: &PgPool,
    symbol: &str,
    date: NaiveDate,
) -> Result<Option<NaiveDate>> {
    let row: Option<(NaiveDate,)> = sqlx::query_as(
        r#"SELECT trading_date FROM market_data_daily
            WHERE symbol = $1 AND trading_date < $2
            ORDER BY trading_date DESC LIMIT 1"#,
    )
    .bind(symbol)
    .bind(date)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Reverse-adjust warehouse rows predating a split: price × factor,
/// volume ÷ factor. Trade counts stay untouched.
pub async fn apply_split_adjustment(
    pool: &PgPool,
    symbol: &str,
    before: NaiveDate,
    factor: f64,
) -> Result<u64> {
    let daily = sqlx::query(
        r#"UPDATE market_data_daily
              SET open = open * $3, high = high * $3, low = low * $3,
                  close = close * $3, volume = volume / $3
            WHERE symbol = $1 AND trading_date < $2"#,
    )
    .bind(symbol)
    .bind(before)
    .bind(factor)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"UPDATE volume_slots
              SET open = open * $3, high = high * $3, low = low * $3,
                  close = close * $3, vwap = vwap * $3, volume = volume / $3
            WHERE symbol = $1 AND trading_date < $2"#,
    )
    .bind(symbol)
    .bind(before)
    .bind(factor)
    .execute(pool)
    .await?;

    Ok(daily.rows_affected())
}

/* --------------------- VOLUME SLOTS ------------------- */
pub async fn upsert_volume_slot(pool: &PgPool, slot: &VolumeSlotRow) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO volume_slots
               (trading_date, symbol, slot_time, open, high, low, close, volume, vwap, trades_count)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
           ON CONFLICT (trading_date, symbol, slot_time) DO NOTHING"#,
    )
    .bind(slot.trading_date)
    .bind(&slot.symbol)
    .bind(slot.slot_time)
    .bind(slot.open)
    .bind(slot.high)
    .bind(slot.low)
    .bind(slot.close)
    .bind(slot.volume)
    .bind(slot.vwap)
    .bind(slot.trades_count)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_volume_slots(pool: &PgPool, date: NaiveDate) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM volume_slots WHERE trading_date = $1")
            .bind(date)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Per-slot volumes for the last `days` distinct trading dates of one
/// symbol, ordered by date then slot (RVOL baseline source).
pub async fn slot_volume_history(
    pool: &PgPool,
    symbol: &str,
    days: i64,
) -> Result<Vec<VolumeSlotRow>> {
    sqlx::query_as::<_, VolumeSlotRow>(
        r#"SELECT vs.trading_date, vs.symbol, vs.slot_time,
                  vs.open, vs.high, vs.low, vs.close, vs.volume, vs.vwap, vs.trades_count
             FROM volume_slots vs
             JOIN (SELECT DISTINCT trading_date
                     FROM volume_slots
                    WHERE symbol = $1 AND trading_date < CURRENT_DATE
                    ORDER BY trading_date DESC
                    LIMIT $2) td ON vs.trading_date = td.trading_date
            WHERE vs.symbol = $1
            ORDER BY vs.trading_date, vs.slot_time"#,
    )
    .bind(symbol)
    .bind(days)
    .fetch_all(pool)
    .await
}

/// Daily trade-count totals for the last `days` trading dates, newest
/// first (anomaly baseline source).
pub async fn daily_trade_totals(pool: &PgPool, symbol: &str, days: i64) -> Result<Vec<f64>> {
    let rows: Vec<(Option<i64>,)> = sqlx::query_as(
        r#"SELECT SUM(trades_count)
             FROM volume_slots
            WHERE symbol = $1 AND trading_date < CURRENT_DATE
              AND trades_count IS NOT NULL AND trades_count > 0
            GROUP BY trading_date
            ORDER BY trading_date DESC
            LIMIT $2"#,
    )
    .bind(symbol)
    .bind(days)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(|r| r.0).map(|v| v as f64).collect())
}

/// Symbols with at least `min_days` days of trade-count data recently.
pub async fn symbols_with_trades_data(pool: &PgPool, min_days: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT symbol FROM (
               SELECT symbol, COUNT(DISTINCT trading_date) AS days_count
                 FROM volume_slots
                WHERE trades_count IS NOT NULL AND trades_count > 0
                  AND trading_date >= CURRENT_DATE - INTERVAL '10 days'
                GROUP BY symbol
               HAVING COUNT(DISTINCT trading_date) >= $1
           ) sub ORDER BY symbol"#,
    )
    .bind(min_days)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/* ----------------------- UNIVERSE --------------------- */
pub async fn active_symbols(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT symbol FROM tickers_unified WHERE is_actively_trading = true ORDER BY symbol",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn all_ticker_rows(pool: &PgPool) -> Result<Vec<TickerRow>> {
    sqlx::query_as::<_, TickerRow>(
        r#"SELECT symbol, company_name, exchange, sector, industry, market_cap,
                  shares_outstanding, float_shares, avg_volume_5d, avg_volume_10d,
                  avg_volume_30d, avg_volume_3m, beta, is_etf, is_actively_trading,
                  updated_at
             FROM tickers_unified
            WHERE is_actively_trading = true"#,
    )
    .fetch_all(pool)
    .await
}

pub async fn upsert_ticker(pool: &PgPool, row: &TickerRow) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO tickers_unified
               (symbol, company_name, exchange, sector, industry, market_cap,
                shares_outstanding, float_shares, avg_volume_5d, avg_volume_10d,
                avg_volume_30d, avg_volume_3m, beta, is_etf, is_actively_trading,
                updated_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
           ON CONFLICT (symbol) DO UPDATE
              SET company_name = COALESCE(EXCLUDED.company_name, tickers_unified.company_name),
                  exchange = COALESCE(EXCLUDED.exchange, tickers_unified.exchange),
                  sector = COALESCE(EXCLUDED.sector, tickers_unified.sector),
                  industry = COALESCE(EXCLUDED.industry, tickers_unified.industry),
                  market_cap = COALESCE(EXCLUDED.market_cap, tickers_unified.market_cap),
                  shares_outstanding = COALESCE(EXCLUDED.shares_outstanding, tickers_unified.shares_outstanding),
                  float_shares = COALESCE(EXCLUDED.float_shares, tickers_unified.float_shares),
                  avg_volume_5d = COALESCE(EXCLUDED.avg_volume_5d, tickers_unified.avg_volume_5d),
                  avg_volume_10d = COALESCE(EXCLUDED.avg_volume_10d, tickers_unified.avg_volume_10d),
                  avg_volume_30d = COALESCE(EXCLUDED.avg_volume_30d, tickers_unified.avg_volume_30d),
                  avg_volume_3m = COALESCE(EXCLUDED.avg_volume_3m, tickers_unified.avg_volume_3m),
                  beta = COALESCE(EXCLUDED.beta, tickers_unified.beta),
                  is_etf = EXCLUDED.is_etf,
                  is_actively_trading = EXCLUDED.is_actively_trading,
                  updated_at = NOW()"#,
    )
    .bind(&row.symbol)
    .bind(&row.company_name)
    .bind(&row.exchange)
    .bind(&row.sector)
    .bind(&row.industry)
    .bind(row.market_cap)
    .bind(row.shares_outstanding)
    .bind(row.float_shares)
    .bind(row.avg_volume_5d)
    .bind(row.avg_volume_10d)
    .bind(row.avg_volume_30d)
    .bind(row.avg_volume_3m)
    .bind(row.beta)
    .bind(row.is_etf)
    .bind(row.is_actively_trading)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flag every symbol NOT in `still_listed` as no longer trading.
pub async fn deactivate_delisted(pool: &PgPool, still_listed: &[String]) -> Result<u64> {
    let res = sqlx::query(
        r#"UPDATE tickers_unified
              SET is_actively_trading = false, updated_at = NOW()
            WHERE is_actively_trading = true
              AND NOT (symbol = ANY($1))"#,
    )
    .bind(still_listed)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/* ------------------- EARNINGS CALENDAR ---------------- */
pub async fn earnings_between(
    pool: &PgPool,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<EarningsRow>> {
    sqlx::query_as::<_, EarningsRow>(
        r#"SELECT symbol, report_date, time_slot, fiscal_quarter,
                  eps_estimate, eps_actual, revenue_estimate, revenue_actual,
                  source, confidence
             FROM earnings_calendar
            WHERE report_date BETWEEN $1 AND $2
            ORDER BY report_date, symbol"#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

/* --------------------- SCAN RESULTS ------------------- */
pub async fn insert_scan_results(pool: &PgPool, rows: &[ScanResultRow]) -> Result<()> {
    for row in rows {
        sqlx::query(
            r#"INSERT INTO scan_results
                   (time, symbol, session, price, change_percent, rvol, score, rank)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(row.time)
        .bind(&row.symbol)
        .bind(&row.session)
        .bind(row.price)
        .bind(row.change_percent)
        .bind(row.rvol)
        .bind(row.score)
        .bind(row.rank)
        .execute(pool)
        .await?;
    }
    Ok(())
}
