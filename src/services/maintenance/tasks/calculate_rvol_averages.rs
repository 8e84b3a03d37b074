// src/services/maintenance/tasks/calculate_rvol_averages.rs

//! Task 5: RVOL baselines. For every (symbol, slot) the mean
//! ACCUMULATED volume at that slot over the last K trading days, built
//! by cumulative-summing the per-slot bars per day, then averaging per
//! slot across days. Mirrored as the Bus hash `rvol:hist:avg:{symbol}`.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde_json::{json, Value};
use sqlx::PgPool;
use statrs::statistics::{Data, Distribution};

use crate::db::models::VolumeSlotRow;
use crate::db::queries;
use crate::db::redis::RedisPool;
use crate::services::analytics::rvol::RVOL_BASELINE_PREFIX;
use crate::services::analytics::slots::SlotManager;
use crate::utils::errors::MaintenanceError;

const BASELINE_TTL_SECS: usize = 86_400;

pub async fn execute(
    pg: &PgPool,
    redis: &RedisPool,
    _target_date: NaiveDate,
    slots: &SlotManager,
    lookback_days: u32,
) -> Result<Value, MaintenanceError> {
    let symbols = queries::active_symbols(pg).await?;
    if symbols.is_empty() {
        return Err(MaintenanceError::Other("no active symbols in universe".into()));
    }

    let mut written = 0usize;
    let mut empty = 0usize;

    for symbol in &symbols {
        let rows = queries::slot_volume_history(pg, symbol, lookback_days as i64).await?;
        let baselines = slot_baselines(&rows, slots);
        if baselines.is_empty() {
            empty += 1;
            continue;
        }

        let fields: Vec<(String, String)> = baselines
            .iter()
            .map(|(slot, mean)| (slot.to_string(), format!("{mean:.2}")))
            .collect();
        let field_refs: Vec<(&str, String)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        let key = format!("{RVOL_BASELINE_PREFIX}:{symbol}");
        if let Err(e) = redis.hset_all(key.as_str(), &field_refs, BASELINE_TTL_SECS).await {
            log::warn!("rvol baseline write failed for {symbol}: {e}");
            continue;
        }
        written += 1;
    }

    log::info!("rvol baselines written for {written}/{} symbols", symbols.len());
    Ok(json!({
        "symbols": symbols.len(),
        "written": written,
        "no_history": empty,
        "lookback_days": lookback_days,
    }))
}

/// Per-slot mean of accumulated-at-slot-end volume across days.
pub fn slot_baselines(rows: &[VolumeSlotRow], slots: &SlotManager) -> BTreeMap<u16, f64> {
    // Group by day, keeping slot order within the day.
    let mut days: BTreeMap<NaiveDate, Vec<(NaiveTime, f64)>> = BTreeMap::new();
    for row in rows {
        let volume = row.volume.unwrap_or(0.0);
        days.entry(row.trading_date)
            .or_default()
            .push((row.slot_time, volume));
    }

    // Cumulative sum per day → accumulated volume as of each slot end,
    // carried forward across empty slots.
    let mut per_slot: BTreeMap<u16, Vec<f64>> = BTreeMap::new();
    for (_, mut day_rows) in days {
        day_rows.sort_by_key(|(t, _)| *t);
        let mut accumulated = 0.0;
        let mut by_slot: BTreeMap<u16, f64> = BTreeMap::new();
        for (slot_time, volume) in day_rows {
            accumulated += volume;
            if let Some(idx) = slots.slot_index(slot_time) {
                by_slot.insert(idx, accumulated);
            }
        }
        let mut last = 0.0;
        for idx in 0..slots.total_slots {
            if let Some(v) = by_slot.get(&idx) {
                last = *v;
            }
            if last > 0.0 {
                per_slot.entry(idx).or_default().push(last);
            }
        }
    }

    per_slot
        .into_iter()
        .filter_map(|(slot, values)| {
            let data = Data::new(values);
            data.mean().map(|m| (slot, m))
        })
        .filter(|(_, mean)| *mean > 0.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_row(date: (i32, u32, u32), time: (u32, u32), volume: f64) -> VolumeSlotRow {
        VolumeSlotRow {
            trading_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            symbol: "TEST".into(),
            slot_time: NaiveTime::from_hms_opt(time.0, time.1, 0).unwrap(),
            open: None,
            high: None,
            low: None,
            close: None,
            volume: Some(volume),
            vwap: None,
            trades_count: None,
        }
    }

    #[test]
    fn accumulates_within_a_day_and_averages_across_days() {
        let slots = SlotManager::standard(5);
        // Day 1: 1000 at 04:00 slot, 2000 at 04:05 slot → accumulated 1000 / 3000.
        // Day 2: 3000 at 04:00 slot, 1000 at 04:05 slot → accumulated 3000 / 4000.
        let rows = vec![
            slot_row((2024, 9, 16), (4, 0), 1_000.0),
            slot_row((2024, 9, 16), (4, 5), 2_000.0),
            slot_row((2024, 9, 17), (4, 0), 3_000.0),
            slot_row((2024, 9, 17), (4, 5), 1_000.0),
        ];
        let baselines = slot_baselines(&rows, &slots);
        assert_eq!(baselines[&0], 2_000.0); // (1000 + 3000) / 2
        assert_eq!(baselines[&1], 3_500.0); // (3000 + 4000) / 2
    }

    #[test]
    fn accumulated_volume_carries_over_quiet_slots() {
        let slots = SlotManager::standard(5);
        // One bar at 04:00, nothing at 04:05: the 04:05 slot still has
        // accumulated volume 500.
        let rows = vec![slot_row((2024, 9, 16), (4, 0), 500.0)];
        let baselines = slot_baselines(&rows, &slots);
        assert_eq!(baselines[&0], 500.0);
        assert_eq!(baselines[&1], 500.0);
        assert_eq!(baselines[&191], 500.0);
    }

    #[test]
    fn no_rows_means_no_baselines() {
        let slots = SlotManager::standard(5);
        assert!(slot_baselines(&[], &slots).is_empty());
    }
}
