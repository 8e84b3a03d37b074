// src/services/analytics/vwap.rs

//! VWAP cache fed from per-second aggregates. A zero or missing vendor
//! VWAP preserves the previous value: VWAP never disappears
//! mid-session.

use std::time::Duration;

use dashmap::DashMap;

use crate::db::redis::{entry_f64, entry_field, RedisPool};
use crate::services::polygon::ws::STREAM_AGGREGATES;

const CONSUMER_GROUP: &str = "analytics_vwap";
const CONSUMER_NAME: &str = "analytics_vwap_1";

#[derive(Default)]
pub struct VwapCache {
    vwap: DashMap<String, f64>,
}

impl VwapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, vwap: f64) {
        if vwap > 0.0 {
            self.vwap.insert(symbol.to_string(), vwap);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.vwap.get(symbol).map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.vwap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vwap.is_empty()
    }

    pub fn clear(&self) {
        self.vwap.clear();
    }
}

pub async fn run_consumer(redis: RedisPool, cache: std::sync::Arc<VwapCache>) {
    log::info!("vwap consumer started on {STREAM_AGGREGATES}");
    if let Err(e) = redis.ensure_group(STREAM_AGGREGATES, CONSUMER_GROUP).await {
        log::warn!("vwap group create: {e}");
    }

    loop {
        let reply = match redis
            .read_group(STREAM_AGGREGATES, CONSUMER_GROUP, CONSUMER_NAME, 500, 1000)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.to_string().contains("NOGROUP") {
                    let _ = redis.ensure_group(STREAM_AGGREGATES, CONSUMER_GROUP).await;
                    continue;
                }
                log::error!("vwap read: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let mut ids = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let (Some(symbol), Some(vwap)) =
                    (entry_field(&entry, "symbol"), entry_f64(&entry, "vwap"))
                {
                    cache.update(&symbol, vwap);
                }
                ids.push(entry.id.clone());
            }
        }
        if let Err(e) = redis.ack(STREAM_AGGREGATES, CONSUMER_GROUP, &ids).await {
            log::error!("vwap ack: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_vwap_overwrites() {
        let cache = VwapCache::new();
        cache.update("TSLA", 239.8);
        cache.update("TSLA", 240.1);
        assert_eq!(cache.get("TSLA"), Some(240.1));
    }

    #[test]
    fn zero_vwap_preserves_previous_value() {
        let cache = VwapCache::new();
        cache.update("TSLA", 239.8);
        cache.update("TSLA", 0.0);
        assert_eq!(cache.get("TSLA"), Some(239.8));
    }

    #[test]
    fn unknown_symbol_is_none() {
        let cache = VwapCache::new();
        assert_eq!(cache.get("ZZZZ"), None);
    }
}
