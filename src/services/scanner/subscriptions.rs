// src/services/scanner/subscriptions.rs

//! Subscription reconciler: the union of symbols across every category
//! ranking decides what the WebSocket ingestor streams. Ordered by best
//! aggregate rank and truncated to the vendor cap, then diffed against
//! the previous union into subscribe/unsubscribe commands.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::db::redis::RedisPool;
use crate::models::scanner::{ScannerCategory, ScannerTicker};
use crate::models::session::MarketSession;
use crate::services::polygon::ws::COMMAND_STREAM;

pub const ACTIVE_TICKERS_KEY: &str = "polygon_ws:active_tickers";
const ACTIVE_TICKERS_TTL_SECS: usize = 3_600;
const COMMAND_MAXLEN: usize = 10_000;
/// Vendor plan cap on concurrent symbol subscriptions.
pub const SUBSCRIPTION_CAP: usize = 1_000;

pub struct SubscriptionManager {
    redis: RedisPool,
    previous: HashSet<String>,
}

impl SubscriptionManager {
    pub fn new(redis: RedisPool) -> Self {
        Self {
            redis,
            previous: HashSet::new(),
        }
    }

    /// One reconcile pass over the category keys.
    pub async fn reconcile(&mut self, session: MarketSession) {
        let current = match self.category_union().await {
            Some(set) if !set.is_empty() => set,
            _ => {
                log::debug!("no category symbols yet, skipping reconcile");
                return;
            }
        };

        let added: Vec<String> = current.difference(&self.previous).cloned().collect();
        let removed: Vec<String> = self.previous.difference(&current).cloned().collect();

        self.publish_commands(&added, "subscribe", session).await;
        self.publish_commands(&removed, "unsubscribe", session).await;

        let members: Vec<String> = current.iter().cloned().collect();
        if let Err(e) = self
            .redis
            .replace_set(ACTIVE_TICKERS_KEY, &members, ACTIVE_TICKERS_TTL_SECS)
            .await
        {
            log::warn!("active ticker set refresh failed: {e}");
        }

        if !added.is_empty() || !removed.is_empty() {
            log::info!(
                "subscriptions reconciled: {} active, +{} -{}",
                current.len(),
                added.len(),
                removed.len()
            );
        }
        metrics::gauge!("ws_subscriptions_active", current.len() as f64);
        self.previous = current;
    }

    /// Union of all category rankings, capped by best aggregate rank.
    async fn category_union(&self) -> Option<HashSet<String>> {
        let mut best_rank: HashMap<String, u32> = HashMap::new();

        for category in ScannerCategory::ALL {
            let key = format!("scanner:category:{}", category.as_str());
            let ranking: Vec<ScannerTicker> = match self.redis.get_json(&key).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("category read failed for {}: {e}", category.as_str());
                    continue;
                }
            };
            for row in ranking {
                let entry = best_rank.entry(row.symbol).or_insert(u32::MAX);
                if row.rank < *entry {
                    *entry = row.rank;
                }
            }
        }

        if best_rank.is_empty() {
            return None;
        }
        Some(cap_by_rank(best_rank, SUBSCRIPTION_CAP))
    }

    async fn publish_commands(&self, symbols: &[String], action: &str, session: MarketSession) {
        for symbol in symbols {
            let fields = [
                ("symbol", symbol.clone()),
                ("action", action.to_string()),
                ("source", "scanner_auto".to_string()),
                ("session", session.as_str().to_string()),
                ("timestamp", Utc::now().to_rfc3339()),
            ];
            if let Err(e) = self
                .redis
                .xadd_maxlen(COMMAND_STREAM, COMMAND_MAXLEN, &fields)
                .await
            {
                log::error!("{action} command publish failed for {symbol}: {e}");
            }
        }
    }

    /// Day boundary: start from an empty union.
    pub fn reset(&mut self) {
        self.previous.clear();
    }
}

/// Keep the `cap` symbols with the best (lowest) aggregate rank; ties
/// break by symbol so truncation is deterministic.
fn cap_by_rank(best_rank: HashMap<String, u32>, cap: usize) -> HashSet<String> {
    if best_rank.len() <= cap {
        return best_rank.into_keys().collect();
    }
    let mut entries: Vec<(String, u32)> = best_rank.into_iter().collect();
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(cap);
    entries.into_iter().map(|(s, _)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
        pairs.iter().map(|(s, r)| (s.to_string(), *r)).collect()
    }

    #[test]
    fn under_cap_everything_survives() {
        let capped = cap_by_rank(ranks(&[("AAA", 1), ("BBB", 7)]), 1000);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn over_cap_keeps_best_ranked() {
        let capped = cap_by_rank(ranks(&[("AAA", 3), ("BBB", 1), ("CCC", 2)]), 2);
        assert!(capped.contains("BBB"));
        assert!(capped.contains("CCC"));
        assert!(!capped.contains("AAA"));
    }

    #[test]
    fn cap_ties_break_by_symbol() {
        let capped = cap_by_rank(ranks(&[("ZZZ", 1), ("AAA", 1), ("MMM", 1)]), 2);
        assert!(capped.contains("AAA"));
        assert!(capped.contains("MMM"));
        assert!(!capped.contains("ZZZ"));
    }
}
