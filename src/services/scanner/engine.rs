// src/services/scanner/engine.rs

//! The scan cycle: read the latest snapshot, enrich every row from the
//! in-process analytics layer, filter with early exit, score, rank,
//! categorise and delta-emit. The Warehouse is never touched on the
//! hot path except the sampled scan-result insert.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use chrono_tz::America::New_York;
use sqlx::PgPool;

use crate::config::settings::Settings;
use crate::db::models::ScanResultRow;
use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::models::polygon::SnapshotEnvelope;
use crate::models::scanner::{ScannerResult, ScannerTicker, TickerMetadata};
use crate::models::session::MarketSession;
use crate::services::analytics::hub::AnalyticsHub;
use crate::services::ingest::snapshot::{IngestedRow, SNAPSHOT_KEY};
use crate::services::scanner::categories::Categorizer;
use crate::services::scanner::deltas::DeltaEngine;
use crate::services::scanner::filters::{filter_from_row, FilterEngine};
use crate::services::scanner::gaps::{apply_gaps, calculate_gaps, GapTracker};
use crate::utils::errors::ScanError;

pub const ENRICHED_KEY: &str = "snapshot:enriched:latest";
const METADATA_KEY_PREFIX: &str = "ticker:metadata";
const METADATA_CACHE_MAX: usize = 200_000;
const METADATA_CACHE_TTL_SECS: i64 = 1_800;
const METADATA_MGET_CHUNK: usize = 1_000;
const RESULTS_PERSIST_EVERY_SECS: i64 = 30;
const RESULTS_PERSIST_TOP: usize = 100;

pub struct ScannerEngine {
    redis: RedisPool,
    pg: PgPool,
    settings: Settings,
    hub: AnalyticsHub,
    filter_engine: FilterEngine,
    categorizer: Categorizer,
    pub deltas: DeltaEngine,
    pub gap_tracker: GapTracker,

    metadata_cache: HashMap<String, (i64, TickerMetadata)>,
    current_session: MarketSession,
    last_snapshot_timestamp: Option<String>,
    last_filter_reload: Option<Instant>,
    last_results_persist: i64,

    pub total_scans: u64,
    pub total_rows_scanned: u64,
    pub total_rows_emitted: u64,
}

impl ScannerEngine {
    pub fn new(redis: RedisPool, pg: PgPool, settings: Settings, hub: AnalyticsHub) -> Self {
        let categorizer = Categorizer::new(
            settings.default_category_limit,
            settings.max_category_limit,
        );
        Self {
            deltas: DeltaEngine::new(redis.clone()),
            redis,
            pg,
            hub,
            filter_engine: FilterEngine::new(Vec::new(), MarketSession::Closed),
            categorizer,
            gap_tracker: GapTracker::new(),
            metadata_cache: HashMap::new(),
            current_session: MarketSession::Closed,
            last_snapshot_timestamp: None,
            last_filter_reload: None,
            last_results_persist: 0,
            total_scans: 0,
            total_rows_scanned: 0,
            total_rows_emitted: 0,
            settings,
        }
    }

    pub async fn initialize(&mut self) -> Result<(), ScanError> {
        self.reload_filters().await?;
        self.update_session().await;
        log::info!(
            "scanner initialized: {} filters, session {:?}",
            self.filter_engine.filters().len(),
            self.current_session
        );
        Ok(())
    }

    /// Filters are data in the Warehouse; between reloads they are
    /// in-memory immutable.
    pub async fn reload_filters(&mut self) -> Result<(), ScanError> {
        let rows = queries::get_enabled_filters(&self.pg).await?;
        let filters: Vec<_> = rows.iter().filter_map(filter_from_row).collect();
        log::info!("loaded {} scanner filters", filters.len());
        self.filter_engine.set_filters(filters);
        self.last_filter_reload = Some(Instant::now());
        Ok(())
    }

    async fn maybe_reload_filters(&mut self) {
        let due = self
            .last_filter_reload
            .map(|at| at.elapsed().as_secs() >= self.settings.filter_reload_secs)
            .unwrap_or(true);
        if due {
            if let Err(e) = self.reload_filters().await {
                log::error!("filter reload failed: {e}");
            }
        }
    }

    async fn update_session(&mut self) {
        if let Ok(Some(raw)) = self.redis.get_string("market:session:current").await {
            if let Some(session) = MarketSession::parse(&raw) {
                if session != self.current_session {
                    log::info!(
                        "scanner session {:?} -> {:?}",
                        self.current_session,
                        session
                    );
                    self.current_session = session;
                }
            }
        }
        self.filter_engine.set_session(self.current_session);
    }

    /// One complete scan cycle. None when there is no new snapshot:
    /// every tick must be a new tick.
    pub async fn run_scan(&mut self) -> Result<Option<ScannerResult>, ScanError> {
        let started = Instant::now();

        self.maybe_reload_filters().await;
        self.update_session().await;

        let envelope: SnapshotEnvelope<IngestedRow> =
            match self.redis.get_json(SNAPSHOT_KEY).await? {
                Some(env) => env,
                None => return Ok(None),
            };

        if self.last_snapshot_timestamp.as_deref() == Some(envelope.timestamp.as_str()) {
            return Ok(None); // already processed this moment in time
        }

        // Dedupe by symbol, keep first occurrence.
        let mut seen = HashSet::with_capacity(envelope.tickers.len());
        let rows: Vec<IngestedRow> = envelope
            .tickers
            .into_iter()
            .filter(|r| seen.insert(r.snapshot.ticker.clone()))
            .collect();
        let universe = rows.len();

        let symbols: Vec<String> = rows.iter().map(|r| r.snapshot.ticker.clone()).collect();
        let metadata = self.metadata_batch(&symbols).await;

        let now_et = Utc::now().with_timezone(&New_York).time();
        let mut emitted: Vec<ScannerTicker> = Vec::new();
        // Missing reference data never drops a row: the metadata fields
        // stay null and filters with bounds on them do the rejecting.
        let no_metadata = TickerMetadata::empty("");

        for row in &rows {
            // Feed the anomaly counter on every tick, filtered or not.
            if let Some(n) = row.snapshot.trades_today() {
                self.hub.anomaly.update_trades_today(&row.snapshot.ticker, n);
            }

            let meta = metadata.get(&row.snapshot.ticker).unwrap_or(&no_metadata);

            let mut ticker = self.build_ticker(row, meta, now_et).await;

            // Filters: early exit on the first failure. An evaluation
            // error counts as "does not pass".
            let matched = match self.filter_engine.passes_all(&ticker) {
                Some(m) => m,
                None => continue,
            };
            ticker.filters_matched = matched;

            // Score only survivors.
            ticker.score = score(&ticker);
            emitted.push(ticker);
        }

        emitted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        emitted.truncate(self.settings.max_filtered_tickers);
        for (idx, t) in emitted.iter_mut().enumerate() {
            t.rank = idx as u32 + 1;
        }

        // Publish the enriched snapshot + the per-session filtered key.
        let enriched = SnapshotEnvelope {
            timestamp: envelope.timestamp.clone(),
            count: emitted.len(),
            tickers: emitted.clone(),
        };
        self.redis.set_json(ENRICHED_KEY, &enriched, 60).await?;
        let session_key = format!(
            "scanner:filtered_complete:{}",
            self.current_session.as_str()
        );
        self.redis.set_json(&session_key, &emitted, 60).await?;

        // Categorise + delta-emit.
        let rankings = self.categorizer.rank_all(&emitted);
        for category in crate::models::scanner::ScannerCategory::ALL {
            let ranking = rankings.get(&category).cloned().unwrap_or_default();
            self.deltas.publish(category, ranking).await;
        }

        self.persist_scan_results(&emitted).await;

        self.last_snapshot_timestamp = Some(envelope.timestamp);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.total_scans += 1;
        self.total_rows_scanned += universe as u64;
        self.total_rows_emitted += emitted.len() as u64;
        metrics::histogram!("scan_duration_ms", elapsed_ms);
        metrics::gauge!("scan_rows_emitted", emitted.len() as f64);

        Ok(Some(ScannerResult {
            timestamp: Utc::now(),
            session: self.current_session,
            total_universe_size: universe,
            filtered_count: emitted.len(),
            scan_duration_ms: elapsed_ms,
        }))
    }

    /// The enrichment join for one row: snapshot + metadata + the
    /// in-process analytics layer + gaps.
    async fn build_ticker(
        &self,
        row: &IngestedRow,
        meta: &TickerMetadata,
        now_et: chrono::NaiveTime,
    ) -> ScannerTicker {
        let snap = &row.snapshot;
        let symbol = snap.ticker.as_str();
        let price = row.current_price;

        let mut t = ScannerTicker::new(symbol, price, self.current_session);
        t.volume_today = row.current_volume;

        let day = snap.day.as_ref();
        let prev = snap.prev_day.as_ref();
        t.open = day.and_then(|d| d.o);
        t.high = day.and_then(|d| d.h);
        t.low = day.and_then(|d| d.l);
        t.prev_close = prev.and_then(|d| d.c);
        t.prev_volume = prev.and_then(|d| d.v);
        t.minute_volume = snap.minute.as_ref().and_then(|m| m.v);
        t.trades_today = snap.trades_today();
        t.last_trade_timestamp = snap.last_trade.as_ref().and_then(|lt| lt.t);

        if let Some(q) = snap.last_quote.as_ref() {
            t.bid = q.p;
            t.ask = q.ask;
            t.bid_size = q.s;
            t.ask_size = q.ask_size;
            if let (Some(bid), Some(ask)) = (q.p, q.ask) {
                if bid > 0.0 && ask >= bid {
                    t.spread = Some((ask - bid) * 100.0); // cents
                    let mid = (ask + bid) / 2.0;
                    if mid > 0.0 {
                        t.distance_from_nbbo = Some((price - mid).abs() / mid * 100.0);
                    }
                }
            }
        }

        // Metadata
        t.company_name = meta.company_name.clone();
        t.exchange = meta.exchange.clone();
        t.sector = meta.sector.clone();
        t.industry = meta.industry.clone();
        t.market_cap = meta.market_cap;
        t.shares_outstanding = meta.shares_outstanding;
        t.float_shares = meta.float_shares;
        t.avg_volume_5d = meta.avg_volume_5d;
        t.avg_volume_10d = meta.avg_volume_10d;
        t.avg_volume_30d = meta.avg_volume_30d;
        t.avg_volume_3m = meta.avg_volume_3m;

        // Derived volume metrics
        t.dollar_volume = Some(price * t.volume_today);
        t.volume_today_pct = meta
            .avg_volume_30d
            .filter(|v| *v > 0.0)
            .map(|v| t.volume_today / v * 100.0);
        t.volume_yesterday_pct = t
            .prev_volume
            .filter(|v| *v > 0.0)
            .map(|v| t.volume_today / v * 100.0);

        if let Some(pc) = t.prev_close.filter(|pc| *pc > 0.0) {
            t.change_percent = Some((price - pc) / pc * 100.0);
        }

        // Analytics layer
        t.vwap = self.hub.vwap.get(symbol);
        t.chg_5min = self.hub.price_windows.chg_5min(symbol);
        t.vol_5min = self.hub.volume_windows.vol_5min(symbol);
        t.rvol = self.hub.rvol.rvol(symbol, t.volume_today, now_et).await;
        t.rvol_slot = t.rvol;
        if let Some((atr, atr_pct)) = self.hub.atr.get(symbol).await {
            t.atr = Some(atr);
            t.atr_percent = Some(atr_pct);
        }

        // Intraday extremes: snapshot day range reinforced by the
        // minute-bar engine (covers pre/post market).
        let bar_range = self.hub.bars.intraday_range(symbol);
        t.intraday_high = max_opt(t.high, bar_range.map(|(h, _)| h));
        t.intraday_low = min_opt(t.low, bar_range.map(|(_, l)| l));
        t.price_from_intraday_high = t
            .intraday_high
            .filter(|h| *h > 0.0)
            .map(|h| (price - h) / h * 100.0);
        t.price_from_intraday_low = t
            .intraday_low
            .filter(|l| *l > 0.0)
            .map(|l| (price - l) / l * 100.0);

        // Trade anomaly
        if let Some(result) = self.hub.anomaly.detect(symbol, t.trades_today).await {
            t.trades_z_score = Some(result.z_score);
            t.is_trade_anomaly = result.is_anomaly;
        }

        // Gaps, with per-symbol latching
        let day_close = day.and_then(|d| d.c);
        let gaps = calculate_gaps(
            price,
            t.prev_close,
            t.open,
            day_close,
            t.high,
            t.low,
            self.current_session,
        );
        apply_gaps(&mut t, &gaps);
        if let Some(g) = t.gap_from_prev_close {
            self.gap_tracker
                .track(symbol, self.current_session, g, Utc::now());
            if let Some(record) = self.gap_tracker.get(symbol) {
                t.gap_at_open = record.open_gap;
            }
        }
        t.postmarket_volume = pm_volume(&t);

        t
    }

    /// Process-local LRU over `ticker:metadata:{sym}`, backed by
    /// paginated MGET for the misses. Keeps ~11k-key multi-gets off
    /// every tick.
    async fn metadata_batch(&mut self, symbols: &[String]) -> HashMap<String, TickerMetadata> {
        let now = Utc::now().timestamp();
        let mut results = HashMap::with_capacity(symbols.len());
        let mut misses: Vec<String> = Vec::new();

        for sym in symbols {
            match self.metadata_cache.get(sym) {
                Some((expires, meta)) if *expires > now => {
                    results.insert(sym.clone(), meta.clone());
                }
                _ => misses.push(sym.clone()),
            }
        }

        for chunk in misses.chunks(METADATA_MGET_CHUNK) {
            let keys: Vec<String> = chunk
                .iter()
                .map(|s| format!("{METADATA_KEY_PREFIX}:{s}"))
                .collect();
            let raw = match self.redis.mget_raw(&keys).await {
                Ok(r) => r,
                Err(e) => {
                    log::error!("metadata mget failed for {} keys: {e}", keys.len());
                    continue;
                }
            };
            for (sym, payload) in chunk.iter().zip(raw) {
                let Some(payload) = payload else { continue };
                match serde_json::from_str::<TickerMetadata>(&payload) {
                    Ok(meta) => {
                        self.metadata_cache_put(sym.clone(), meta.clone(), now);
                        results.insert(sym.clone(), meta);
                    }
                    Err(e) => log::debug!("metadata parse failed for {sym}: {e}"),
                }
            }
        }

        results
    }

    fn metadata_cache_put(&mut self, symbol: String, meta: TickerMetadata, now: i64) {
        if self.metadata_cache.len() >= METADATA_CACHE_MAX {
            // Shed ~1% arbitrary entries instead of churning one by one.
            let to_remove: Vec<String> = self
                .metadata_cache
                .keys()
                .take(METADATA_CACHE_MAX / 100)
                .cloned()
                .collect();
            for key in to_remove {
                self.metadata_cache.remove(&key);
            }
        }
        self.metadata_cache
            .insert(symbol, (now + METADATA_CACHE_TTL_SECS, meta));
    }

    /// History sink, sampled: top rows only, at most every 30 s.
    async fn persist_scan_results(&mut self, emitted: &[ScannerTicker]) {
        let now = Utc::now().timestamp();
        if emitted.is_empty() || now - self.last_results_persist < RESULTS_PERSIST_EVERY_SECS {
            return;
        }
        self.last_results_persist = now;

        let rows: Vec<ScanResultRow> = emitted
            .iter()
            .take(RESULTS_PERSIST_TOP)
            .map(|t| ScanResultRow {
                time: t.timestamp,
                symbol: t.symbol.clone(),
                session: t.session.as_str().to_string(),
                price: t.price,
                change_percent: t.change_percent,
                rvol: t.rvol,
                score: t.score,
                rank: t.rank as i32,
            })
            .collect();
        if let Err(e) = queries::insert_scan_results(&self.pg, &rows).await {
            log::warn!("scan result persist failed: {e}");
        }
    }

    /// Day boundary: rankings, gap latches and the freshness gate all
    /// restart.
    pub fn reset_for_new_day(&mut self) {
        self.deltas.clear_rankings();
        self.gap_tracker.clear_for_new_day();
        self.last_snapshot_timestamp = None;
    }

    /// Scan loop entry point.
    pub async fn run(mut self, mut day_events: tokio::sync::broadcast::Receiver<crate::services::events::BusEvent>) {
        if let Err(e) = self.initialize().await {
            log::error!("scanner init failed: {e}");
        }
        let mut iv = tokio::time::interval(std::time::Duration::from_secs(
            self.settings.scan_interval_secs.max(1),
        ));
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = iv.tick() => {
                    match self.run_scan().await {
                        Ok(Some(result)) => log::info!(
                            "scan: {}/{} rows in {:.1} ms ({:?})",
                            result.filtered_count,
                            result.total_universe_size,
                            result.scan_duration_ms,
                            result.session
                        ),
                        Ok(None) => {}
                        Err(e) => log::error!("scan cycle failed: {e}"),
                    }
                }
                event = day_events.recv() => {
                    if let Ok(crate::services::events::BusEvent::DayChanged { .. }) = event {
                        self.reset_for_new_day();
                    }
                }
            }
        }
    }
}

/// score = 10·rvol + 5·(volume_today / avg_volume_30d); null terms
/// contribute zero, and only filtered rows ever get here.
pub fn score(t: &ScannerTicker) -> f64 {
    let mut score = 0.0;
    if let Some(rvol) = t.rvol {
        score += rvol * 10.0;
    }
    if let Some(avg) = t.avg_volume_30d.filter(|v| *v > 0.0) {
        score += t.volume_today / avg * 5.0;
    }
    score
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (x, None) | (None, x) => x,
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

fn pm_volume(t: &ScannerTicker) -> Option<f64> {
    if t.session == MarketSession::PostMarket {
        // Accumulated volume since the 4 PM close, approximated by the
        // 5-minute window when the tracker has history.
        t.vol_5min
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_sums_rvol_and_volume_ratio() {
        let mut t = ScannerTicker::new("AAA", 10.0, MarketSession::MarketOpen);
        t.rvol = Some(3.0);
        t.volume_today = 2_000_000.0;
        t.avg_volume_30d = Some(1_000_000.0);
        assert!((score(&t) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn score_with_null_terms_contributes_zero() {
        let t = ScannerTicker::new("AAA", 10.0, MarketSession::MarketOpen);
        assert_eq!(score(&t), 0.0);

        let mut only_rvol = ScannerTicker::new("BBB", 10.0, MarketSession::MarketOpen);
        only_rvol.rvol = Some(2.0);
        assert!((score(&only_rvol) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn option_extreme_helpers() {
        assert_eq!(max_opt(Some(1.0), Some(2.0)), Some(2.0));
        assert_eq!(max_opt(None, Some(2.0)), Some(2.0));
        assert_eq!(min_opt(Some(1.0), None), Some(1.0));
        assert_eq!(min_opt(None, None), None);
    }
}
