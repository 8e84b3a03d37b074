// src/services/maintenance/tasks/clear_caches.rs

//! Task 1: clear realtime caches and announce the new trading day.
//!
//! Scanner keys (`scanner:*`) are NOT cleared here: the 03:00 ET
//! realtime clear handles those after the vendor's own overnight reset,
//! so the scanner cannot repopulate them with stale data in between.

use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::db::redis::RedisPool;
use crate::utils::errors::MaintenanceError;

const PATTERNS: &[&str] = &["snapshot:enriched:*", "snapshot:polygon:*", "realtime:*"];

pub async fn execute(redis: &RedisPool, target_date: NaiveDate) -> Result<Value, MaintenanceError> {
    let mut total_deleted = 0usize;
    for pattern in PATTERNS {
        match redis.delete_pattern(pattern).await {
            Ok(n) => total_deleted += n,
            Err(e) => log::warn!("delete pattern {pattern} failed: {e}"),
        }
    }

    let payload = json!({
        "event": "new_trading_day",
        "date": target_date.to_string(),
        "action": "caches_cleared",
    })
    .to_string();
    redis.publish("trading:new_day", &payload).await?;

    Ok(json!({
        "keys_deleted": total_deleted,
        "patterns_processed": PATTERNS.len(),
    }))
}

/// 03:00 ET variant: realtime keys plus scanner rankings, one hour
/// before pre-market. No new-day event here.
pub async fn clear_realtime(redis: &RedisPool) -> Result<usize, MaintenanceError> {
    let mut total = 0usize;
    for pattern in ["realtime:*", "scanner:category:*", "scanner:filtered_complete:*"] {
        match redis.delete_pattern(pattern).await {
            Ok(n) => total += n,
            Err(e) => log::warn!("delete pattern {pattern} failed: {e}"),
        }
    }
    Ok(total)
}
