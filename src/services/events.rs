//! Event bus: session / day / maintenance events.
//! -----------------------------------------------------------------
//! ‣ Local fan-out via `tokio::broadcast` (every engine holds a receiver)
//! ‣ Cross-process fan-out via Redis pub/sub on `events:{EventType}`
//!   plus the legacy `trading:new_day` / `maintenance:completed` channels.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::db::redis::RedisPool;
use crate::models::session::MarketSession;

const CAPACITY: usize = 256; // ring-buffer per topic

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    SessionChanged {
        from: MarketSession,
        to: MarketSession,
        trading_date: NaiveDate,
    },
    DayChanged {
        new_date: NaiveDate,
        previous_date: NaiveDate,
    },
    NewTradingDay {
        date: NaiveDate,
    },
    MaintenanceCompleted {
        date: NaiveDate,
    },
}

impl BusEvent {
    fn channel(&self) -> &'static str {
        match self {
            BusEvent::SessionChanged { .. } => "events:SessionChanged",
            BusEvent::DayChanged { .. } => "events:DayChanged",
            BusEvent::NewTradingDay { .. } => "trading:new_day",
            BusEvent::MaintenanceCompleted { .. } => "maintenance:completed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: Sender<BusEvent>,
    redis: RedisPool,
}

impl EventBus {
    pub fn new(redis: RedisPool) -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx, redis }
    }

    pub fn subscribe(&self) -> Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish locally and to Redis. The local send never fails the
    /// caller (no active receivers is fine); the Redis publish is
    /// best-effort with a warning.
    pub async fn publish(&self, event: BusEvent) {
        let channel = event.channel();
        let _ = self.tx.send(event.clone());

        let payload = match serde_json::to_string(&serde_json::json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
        })) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("event serialize failed: {e}");
                return;
            }
        };
        if let Err(e) = self.redis.publish(channel, &payload).await {
            log::warn!("event publish failed on {channel}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_their_channel() {
        let d = NaiveDate::from_ymd_opt(2024, 9, 16).unwrap();
        assert_eq!(BusEvent::NewTradingDay { date: d }.channel(), "trading:new_day");
        assert_eq!(
            BusEvent::MaintenanceCompleted { date: d }.channel(),
            "maintenance:completed"
        );
        assert_eq!(
            BusEvent::DayChanged { new_date: d, previous_date: d }.channel(),
            "events:DayChanged"
        );
    }

    #[test]
    fn event_json_is_tagged() {
        let d = NaiveDate::from_ymd_opt(2024, 9, 16).unwrap();
        let e = BusEvent::SessionChanged {
            from: MarketSession::PreMarket,
            to: MarketSession::MarketOpen,
            trading_date: d,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "session_changed");
        assert_eq!(v["to"], "market_open");
    }
}
