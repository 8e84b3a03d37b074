// src/services/scanner/deltas.rs

//! Delta engine: diff the previous and new ranked list of a category
//! into remove/add/rerank/update records, stamped with one
//! monotonically increasing sequence per category. A late-joining
//! subscriber reads `scanner:category:{name}` + `scanner:sequence:{name}`
//! and applies deltas from any sequence strictly greater.

use std::collections::HashMap;

use chrono::Utc;

use crate::db::redis::RedisPool;
use crate::models::scanner::{RankingDelta, ScannerCategory, ScannerTicker};

pub const STREAM_RANKING_DELTAS: &str = "stream:ranking:deltas";
const MAXLEN_DELTAS: usize = 20_000;

// Update thresholds: anything smaller is noise, not a delta.
const PRICE_THRESHOLD: f64 = 0.01;
const VOLUME_THRESHOLD: f64 = 1_000.0;
const PERCENT_THRESHOLD: f64 = 0.01;
const RVOL_THRESHOLD: f64 = 0.05;

/// Pure diff. Output order within the batch: removes, adds, reranks,
/// updates. Deriving twice from the same pair yields the same records.
pub fn calculate_ranking_deltas(
    old_ranking: &[ScannerTicker],
    new_ranking: &[ScannerTicker],
) -> Vec<RankingDelta> {
    let old_by_symbol: HashMap<&str, (u32, &ScannerTicker)> = old_ranking
        .iter()
        .enumerate()
        .map(|(i, t)| (t.symbol.as_str(), (i as u32 + 1, t)))
        .collect();
    let new_by_symbol: HashMap<&str, (u32, &ScannerTicker)> = new_ranking
        .iter()
        .enumerate()
        .map(|(i, t)| (t.symbol.as_str(), (i as u32 + 1, t)))
        .collect();

    let mut deltas = Vec::new();

    // removes: present before, absent now (old order for determinism)
    for ticker in old_ranking {
        if !new_by_symbol.contains_key(ticker.symbol.as_str()) {
            deltas.push(RankingDelta::Remove {
                symbol: ticker.symbol.clone(),
            });
        }
    }

    // adds: absent before (new-ranking order)
    for (i, ticker) in new_ranking.iter().enumerate() {
        if !old_by_symbol.contains_key(ticker.symbol.as_str()) {
            deltas.push(RankingDelta::Add {
                rank: i as u32 + 1,
                symbol: ticker.symbol.clone(),
                data: Box::new(ticker.clone()),
            });
        }
    }

    // reranks: present in both, position changed
    for (i, ticker) in new_ranking.iter().enumerate() {
        if let Some(&(old_rank, _)) = old_by_symbol.get(ticker.symbol.as_str()) {
            let new_rank = i as u32 + 1;
            if old_rank != new_rank {
                deltas.push(RankingDelta::Rerank {
                    symbol: ticker.symbol.clone(),
                    old_rank,
                    new_rank,
                });
            }
        }
    }

    // updates: same position, watched field moved past its threshold
    for (i, ticker) in new_ranking.iter().enumerate() {
        if let Some(&(old_rank, old_ticker)) = old_by_symbol.get(ticker.symbol.as_str()) {
            let new_rank = i as u32 + 1;
            if old_rank == new_rank && ticker_data_changed(old_ticker, ticker) {
                deltas.push(RankingDelta::Update {
                    rank: new_rank,
                    symbol: ticker.symbol.clone(),
                    data: Box::new(ticker.clone()),
                });
            }
        }
    }

    deltas
}

fn ticker_data_changed(old: &ScannerTicker, new: &ScannerTicker) -> bool {
    if (new.price - old.price).abs() > PRICE_THRESHOLD {
        return true;
    }
    if (new.volume_today - old.volume_today).abs() > VOLUME_THRESHOLD {
        return true;
    }
    if let (Some(o), Some(n)) = (old.change_percent, new.change_percent) {
        if (n - o).abs() > PERCENT_THRESHOLD {
            return true;
        }
    }
    if let (Some(o), Some(n)) = (old.rvol, new.rvol) {
        if (n - o).abs() > RVOL_THRESHOLD {
            return true;
        }
    }
    false
}

/// Stateful emitter: holds per-category previous rankings + sequences,
/// writes batches to the delta stream and refreshes the snapshot keys.
pub struct DeltaEngine {
    redis: RedisPool,
    last_rankings: HashMap<ScannerCategory, Vec<ScannerTicker>>,
    sequences: HashMap<ScannerCategory, u64>,
}

impl DeltaEngine {
    pub fn new(redis: RedisPool) -> Self {
        Self {
            redis,
            last_rankings: HashMap::new(),
            sequences: HashMap::new(),
        }
    }

    pub fn sequence(&self, category: ScannerCategory) -> u64 {
        self.sequences.get(&category).copied().unwrap_or(0)
    }

    /// Publish one category's new ranking. The first emission is a full
    /// snapshot record; afterwards only deltas flow. Every batch bumps
    /// the sequence exactly once.
    pub async fn publish(&mut self, category: ScannerCategory, new_ranking: Vec<ScannerTicker>) {
        let first_emission = !self.last_rankings.contains_key(&category);

        if first_emission {
            let sequence = self.bump_sequence(category);
            self.emit_snapshot(category, &new_ranking, sequence).await;
        } else {
            let old_ranking = self.last_rankings.get(&category).cloned().unwrap_or_default();
            let deltas = calculate_ranking_deltas(&old_ranking, &new_ranking);
            if !deltas.is_empty() {
                let sequence = self.bump_sequence(category);
                self.emit_deltas(category, &deltas, sequence).await;
            }
        }

        self.save_ranking(category, &new_ranking).await;
        self.last_rankings.insert(category, new_ranking);
    }

    /// Resync path (ordering violation on the consumer side): force a
    /// fresh snapshot record.
    pub async fn emit_full_snapshot(&mut self, category: ScannerCategory) {
        let ranking = self.last_rankings.get(&category).cloned().unwrap_or_default();
        let sequence = self.bump_sequence(category);
        self.emit_snapshot(category, &ranking, sequence).await;
    }

    /// Day boundary: rankings restart, sequences keep counting so
    /// subscribers never see a sequence go backwards.
    pub fn clear_rankings(&mut self) {
        self.last_rankings.clear();
    }

    fn bump_sequence(&mut self, category: ScannerCategory) -> u64 {
        let seq = self.sequences.entry(category).or_insert(0);
        *seq += 1;
        *seq
    }

    async fn emit_snapshot(
        &self,
        category: ScannerCategory,
        ranking: &[ScannerTicker],
        sequence: u64,
    ) {
        let rows = match serde_json::to_string(ranking) {
            Ok(r) => r,
            Err(e) => {
                log::error!("snapshot serialize failed for {}: {e}", category.as_str());
                return;
            }
        };
        let fields = [
            ("type", "snapshot".to_string()),
            ("list", category.as_str().to_string()),
            ("sequence", sequence.to_string()),
            ("rows", rows),
            ("timestamp", Utc::now().to_rfc3339()),
            ("count", ranking.len().to_string()),
        ];
        if let Err(e) = self
            .redis
            .xadd_maxlen(STREAM_RANKING_DELTAS, MAXLEN_DELTAS, &fields)
            .await
        {
            log::error!("snapshot emit failed for {}: {e}", category.as_str());
        } else {
            log::info!(
                "emitted full snapshot list={} sequence={} rows={}",
                category.as_str(),
                sequence,
                ranking.len()
            );
        }
    }

    async fn emit_deltas(
        &self,
        category: ScannerCategory,
        deltas: &[RankingDelta],
        sequence: u64,
    ) {
        let payload = match serde_json::to_string(deltas) {
            Ok(p) => p,
            Err(e) => {
                log::error!("delta serialize failed for {}: {e}", category.as_str());
                return;
            }
        };
        let fields = [
            ("type", "delta".to_string()),
            ("list", category.as_str().to_string()),
            ("sequence", sequence.to_string()),
            ("deltas", payload),
            ("timestamp", Utc::now().to_rfc3339()),
            ("change_count", deltas.len().to_string()),
        ];
        if let Err(e) = self
            .redis
            .xadd_maxlen(STREAM_RANKING_DELTAS, MAXLEN_DELTAS, &fields)
            .await
        {
            log::error!("delta emit failed for {}: {e}", category.as_str());
            return;
        }
        log::debug!(
            "emitted deltas list={} sequence={} changes={}",
            category.as_str(),
            sequence,
            deltas.len()
        );
        metrics::counter!("ranking_deltas_emitted", deltas.len() as u64);
    }

    /// Snapshot + sequence keys for late joiners.
    async fn save_ranking(&self, category: ScannerCategory, ranking: &[ScannerTicker]) {
        let key = format!("scanner:category:{}", category.as_str());
        if let Err(e) = self.redis.set_json(&key, &ranking, 3600).await {
            log::error!("ranking save failed for {}: {e}", category.as_str());
        }
        let seq_key = format!("scanner:sequence:{}", category.as_str());
        let sequence = self.sequence(category);
        if let Err(e) = self
            .redis
            .set_string(&seq_key, &sequence.to_string(), 86_400)
            .await
        {
            log::error!("sequence save failed for {}: {e}", category.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::MarketSession;

    fn row(symbol: &str, price: f64) -> ScannerTicker {
        let mut t = ScannerTicker::new(symbol, price, MarketSession::MarketOpen);
        t.volume_today = 10_000.0;
        t
    }

    #[test]
    fn add_and_remove_detected() {
        let old = vec![row("AAA", 1.0), row("BBB", 2.0)];
        let new = vec![row("AAA", 1.0), row("CCC", 3.0)];
        let deltas = calculate_ranking_deltas(&old, &new);

        assert_eq!(deltas.len(), 2);
        match &deltas[0] {
            RankingDelta::Remove { symbol } => assert_eq!(symbol, "BBB"),
            other => panic!("expected remove first, got {other:?}"),
        }
        match &deltas[1] {
            RankingDelta::Add { rank, symbol, .. } => {
                assert_eq!(symbol, "CCC");
                assert_eq!(*rank, 2);
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn swap_produces_two_reranks_and_no_update_below_threshold() {
        // X moved by $0.001: below the price threshold.
        let old = vec![row("XXXX", 10.0), row("YYYY", 5.0)];
        let mut x2 = row("XXXX", 10.001);
        x2.price = 10.001;
        let new = vec![row("YYYY", 5.0), x2];

        let deltas = calculate_ranking_deltas(&old, &new);
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| matches!(d, RankingDelta::Rerank { .. })));

        let by_symbol: HashMap<&str, (u32, u32)> = deltas
            .iter()
            .map(|d| match d {
                RankingDelta::Rerank {
                    symbol,
                    old_rank,
                    new_rank,
                } => (symbol.as_str(), (*old_rank, *new_rank)),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(by_symbol["XXXX"], (1, 2));
        assert_eq!(by_symbol["YYYY"], (2, 1));
    }

    #[test]
    fn update_fires_only_past_thresholds() {
        let old = vec![row("AAA", 10.00)];
        // 1 cent exactly is NOT an update (strictly greater required)
        let new = vec![row("AAA", 10.01)];
        assert!(calculate_ranking_deltas(&old, &new).is_empty());

        let new = vec![row("AAA", 10.02)];
        let deltas = calculate_ranking_deltas(&old, &new);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], RankingDelta::Update { rank: 1, .. }));
    }

    #[test]
    fn volume_and_rvol_thresholds() {
        let mut old_row = row("AAA", 10.0);
        old_row.rvol = Some(2.00);
        let mut new_row = row("AAA", 10.0);
        new_row.volume_today = old_row.volume_today + 999.0;
        new_row.rvol = Some(2.04);
        assert!(calculate_ranking_deltas(&[old_row.clone()], &[new_row]).is_empty());

        let mut big = row("AAA", 10.0);
        big.volume_today = old_row.volume_today + 1_001.0;
        big.rvol = Some(2.00);
        let deltas = calculate_ranking_deltas(&[old_row], &[big]);
        assert_eq!(deltas.len(), 1);
    }

    #[test]
    fn batch_order_is_removes_adds_reranks_updates() {
        let old = vec![row("GONE", 1.0), row("STAY", 2.0), row("MOVE", 3.0)];
        let mut stay_updated = row("STAY", 2.5);
        stay_updated.volume_today = 99_999.0;
        let new = vec![stay_updated, row("NEWB", 4.0), row("MOVE", 3.0)];

        let deltas = calculate_ranking_deltas(&old, &new);
        let kinds: Vec<&'static str> = deltas
            .iter()
            .map(|d| match d {
                RankingDelta::Remove { .. } => "remove",
                RankingDelta::Add { .. } => "add",
                RankingDelta::Rerank { .. } => "rerank",
                RankingDelta::Update { .. } => "update",
            })
            .collect();
        let first_add = kinds.iter().position(|k| *k == "add").unwrap();
        let last_remove = kinds.iter().rposition(|k| *k == "remove").unwrap();
        assert!(last_remove < first_add);
        if let Some(first_update) = kinds.iter().position(|k| *k == "update") {
            let last_rerank = kinds.iter().rposition(|k| *k == "rerank").unwrap();
            assert!(last_rerank < first_update);
        }
    }

    #[test]
    fn derivation_is_idempotent() {
        let old = vec![row("AAA", 1.0), row("BBB", 2.0), row("CCC", 3.0)];
        let new = vec![row("CCC", 3.5), row("AAA", 1.0), row("DDDD", 9.0)];
        let first = calculate_ranking_deltas(&old, &new);
        let second = calculate_ranking_deltas(&old, &new);
        assert_eq!(first, second);
    }

    #[test]
    fn identical_rankings_yield_no_deltas() {
        let ranking = vec![row("AAA", 1.0), row("BBB", 2.0)];
        assert!(calculate_ranking_deltas(&ranking, &ranking).is_empty());
    }

    /// Snapshot + deltas applied in sequence order reconstruct the
    /// current ranking.
    #[test]
    fn replaying_deltas_reconstructs_ranking() {
        let old = vec![row("AAA", 1.0), row("BBB", 2.0), row("CCC", 3.0)];
        let new = vec![row("BBB", 2.0), row("DDD", 4.0), row("AAA", 1.5)];
        let deltas = calculate_ranking_deltas(&old, &new);

        // Replay over the old state.
        let mut state: Vec<ScannerTicker> = old.clone();
        for delta in &deltas {
            match delta {
                RankingDelta::Remove { symbol } => state.retain(|t| &t.symbol != symbol),
                RankingDelta::Add { rank, data, .. } => {
                    let idx = (*rank as usize - 1).min(state.len());
                    state.insert(idx, (**data).clone());
                }
                RankingDelta::Rerank { symbol, new_rank, .. } => {
                    if let Some(pos) = state.iter().position(|t| &t.symbol == symbol) {
                        let t = state.remove(pos);
                        let idx = (*new_rank as usize - 1).min(state.len());
                        state.insert(idx, t);
                    }
                }
                RankingDelta::Update { symbol, data, .. } => {
                    if let Some(pos) = state.iter().position(|t| &t.symbol == symbol) {
                        state[pos] = (**data).clone();
                    }
                }
            }
        }

        let reconstructed: Vec<&str> = state.iter().map(|t| t.symbol.as_str()).collect();
        let expected: Vec<&str> = new.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(reconstructed, expected);
    }
}
