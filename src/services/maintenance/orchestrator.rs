// src/services/maintenance/orchestrator.rs

//! Nightly maintenance task graph.
//!
//! Each task is independent and reports its own success; the
//! orchestrator never validates results. A failed task does not abort
//! the graph: the remaining tasks still run, the failure is recorded
//! in the per-day state and retried by the next cycle. State lives in
//! the Bus under `maintenance:status:{date}` (7 d TTL) for recovery.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::config::settings::Settings;
use crate::db::redis::RedisPool;
use crate::services::analytics::hub::parse_hhmm;
use crate::services::analytics::slots::SlotManager;
use crate::services::events::{BusEvent, EventBus};
use crate::services::maintenance::tasks;
use crate::services::polygon::client::PolygonClient;
use crate::utils::errors::MaintenanceError;

const STATE_TTL_SECS: usize = 86_400 * 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub date: NaiveDate,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub all_success: Option<bool>,
    pub tasks: BTreeMap<String, TaskStatus>,
}

pub const FULL_TASK_LIST: &[&str] = &[
    "clear_caches",
    "load_ohlc",
    "load_volume_slots",
    "calculate_atr",
    "calculate_rvol_averages",
    "calculate_trades_baselines",
    "sync_ticker_universe",
    "enrich_metadata",
    "reconcile_splits",
    "reconcile_parquet_splits",
    "export_screener_metadata",
    "sync_redis",
    "notify_services",
];

/// Holiday mode keeps users on the prior day's view: no cache clear,
/// no mirror refresh, no completion broadcast: data-only.
pub const DATA_ONLY_TASK_LIST: &[&str] = &[
    "load_ohlc",
    "load_volume_slots",
    "calculate_atr",
    "calculate_rvol_averages",
    "calculate_trades_baselines",
    "sync_ticker_universe",
    "enrich_metadata",
    "reconcile_splits",
    "reconcile_parquet_splits",
    "export_screener_metadata",
];

pub struct MaintenanceOrchestrator {
    pub redis: RedisPool,
    pub pg: PgPool,
    pub client: PolygonClient,
    pub events: EventBus,
    pub settings: Settings,
    slots: SlotManager,
}

impl MaintenanceOrchestrator {
    pub fn new(
        redis: RedisPool,
        pg: PgPool,
        client: PolygonClient,
        events: EventBus,
        settings: Settings,
    ) -> Self {
        let slots = SlotManager::new(
            settings.slot_size_minutes,
            parse_hhmm(&settings.pre_market_start),
            parse_hhmm(&settings.market_open),
            parse_hhmm(&settings.market_close),
            parse_hhmm(&settings.post_market_end),
        );
        Self {
            redis,
            pg,
            client,
            events,
            settings,
            slots,
        }
    }

    /// Run the whole graph for one trading date. Returns true only when
    /// every task succeeded.
    pub async fn run_full_cycle(&self, target_date: NaiveDate, skip_cache_clear: bool) -> bool {
        log::info!(
            "maintenance cycle starting for {target_date} (data_only: {skip_cache_clear})"
        );
        let cycle_start = Utc::now();

        let task_names: &[&str] = if skip_cache_clear {
            DATA_ONLY_TASK_LIST
        } else {
            FULL_TASK_LIST
        };

        let mut state = CycleState {
            date: target_date,
            started_at: cycle_start.to_rfc3339(),
            completed_at: None,
            duration_seconds: None,
            all_success: None,
            tasks: FULL_TASK_LIST
                .iter()
                .map(|name| {
                    let status = if task_names.contains(name) {
                        TaskStatus::Pending
                    } else {
                        TaskStatus::Skipped
                    };
                    (name.to_string(), status)
                })
                .collect(),
        };

        let mut all_success = true;

        for idx in 0..task_names.len() {
            let name = task_names[idx];
            state.tasks.insert(name.to_string(), TaskStatus::Running);
            self.save_state(target_date, &state).await;

            let task_start = Utc::now();
            let result = self.run_task(name, target_date).await;
            let secs = (Utc::now() - task_start).num_milliseconds() as f64 / 1000.0;

            match result {
                Ok(stats) => {
                    state.tasks.insert(name.to_string(), TaskStatus::Success);
                    log::info!("task {name} completed in {secs:.1}s: {stats}");
                }
                Err(e) => {
                    state.tasks.insert(name.to_string(), TaskStatus::Failed);
                    all_success = false;
                    log::error!("task {name} failed after {secs:.1}s: {e}");
                }
            }
            self.save_state(target_date, &state).await;
        }

        let duration = (Utc::now() - cycle_start).num_milliseconds() as f64 / 1000.0;
        state.completed_at = Some(Utc::now().to_rfc3339());
        state.duration_seconds = Some(duration);
        state.all_success = Some(all_success);
        self.save_state(target_date, &state).await;

        let success_count = state
            .tasks
            .values()
            .filter(|s| **s == TaskStatus::Success)
            .count();
        log::info!(
            "maintenance cycle finished for {target_date}: {success_count}/{} ok in {duration:.0}s (all_success: {all_success})",
            task_names.len()
        );
        all_success
    }

    fn run_task<'a>(
        &'a self,
        name: &'a str,
        date: NaiveDate,
    ) -> futures::future::BoxFuture<'a, Result<Value, MaintenanceError>> {
        match name {
            "clear_caches" => Box::pin(tasks::clear_caches::execute(&self.redis, date)),
            "load_ohlc" => Box::pin(tasks::load_ohlc::execute(&self.pg, &self.client, date)),
            "load_volume_slots" => Box::pin(tasks::load_volume_slots::execute(
                &self.pg,
                &self.client,
                date,
                self.settings.slot_size_minutes,
            )),
            "calculate_atr" => Box::pin(tasks::calculate_atr::execute(
                &self.pg,
                &self.redis,
                date,
                self.settings.atr_period,
            )),
            "calculate_rvol_averages" => Box::pin(tasks::calculate_rvol_averages::execute(
                &self.pg,
                &self.redis,
                date,
                &self.slots,
                self.settings.rvol_lookback_days,
            )),
            "calculate_trades_baselines" => Box::pin(tasks::calculate_trades_baselines::execute(
                &self.pg,
                &self.redis,
                date,
                self.settings.rvol_lookback_days,
            )),
            "sync_ticker_universe" => Box::pin(tasks::sync_ticker_universe::execute(
                &self.pg,
                &self.redis,
                &self.client,
                date,
            )),
            "enrich_metadata" => Box::pin(tasks::enrich_metadata::execute(
                &self.pg,
                &self.client,
                date,
            )),
            "reconcile_splits" => Box::pin(tasks::reconcile_splits::execute(
                &self.pg,
                &self.client,
                date,
            )),
            "reconcile_parquet_splits" => Box::pin(tasks::reconcile_parquet::execute(
                &self.pg,
                &self.client,
                date,
                &self.settings.parquet_dir,
            )),
            "export_screener_metadata" => Box::pin(tasks::export_screener::execute(
                &self.pg,
                date,
                &self.settings.screener_export_dir,
            )),
            "sync_redis" => Box::pin(tasks::sync_redis::execute(&self.pg, &self.redis, date)),
            "notify_services" => Box::pin(self.notify_services(date)),
            other => {
                let msg = format!("unknown task {other}");
                Box::pin(async move { Err(MaintenanceError::Other(msg)) })
            }
        }
    }

    /// Task 13: broadcast completion and mark the day as executed.
    async fn notify_services(&self, date: NaiveDate) -> Result<Value, MaintenanceError> {
        self.events
            .publish(BusEvent::MaintenanceCompleted { date })
            .await;
        self.redis
            .set_string(
                &format!("maintenance:executed:{date}"),
                "1",
                STATE_TTL_SECS,
            )
            .await?;
        Ok(json!({"events_published": ["maintenance:completed"], "date": date.to_string()}))
    }

    async fn save_state(&self, date: NaiveDate, state: &CycleState) {
        let key = format!("maintenance:status:{date}");
        if let Err(e) = self.redis.set_json(&key, state, STATE_TTL_SECS).await {
            log::warn!("maintenance state save failed: {e}");
        }
    }

    pub async fn was_executed(&self, date: NaiveDate) -> bool {
        matches!(
            self.redis
                .get_string(&format!("maintenance:executed:{date}"))
                .await,
            Ok(Some(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_only_list_drops_cache_and_notify_tasks() {
        assert!(!DATA_ONLY_TASK_LIST.contains(&"clear_caches"));
        assert!(!DATA_ONLY_TASK_LIST.contains(&"sync_redis"));
        assert!(!DATA_ONLY_TASK_LIST.contains(&"notify_services"));
        for task in DATA_ONLY_TASK_LIST {
            assert!(FULL_TASK_LIST.contains(task));
        }
    }

    #[test]
    fn full_list_runs_in_dependency_order() {
        let pos = |name: &str| FULL_TASK_LIST.iter().position(|t| *t == name).unwrap();
        // Slot data must exist before baselines are computed from it.
        assert!(pos("load_volume_slots") < pos("calculate_rvol_averages"));
        assert!(pos("load_volume_slots") < pos("calculate_trades_baselines"));
        // Warehouse splits are fixed before the flat files compare
        // against warehouse closes.
        assert!(pos("reconcile_splits") < pos("reconcile_parquet_splits"));
        // The Bus mirror refresh comes after every data rebuild.
        assert!(pos("sync_redis") > pos("enrich_metadata"));
        assert_eq!(pos("notify_services"), FULL_TASK_LIST.len() - 1);
    }

    #[test]
    fn cycle_state_serializes_with_snake_case_statuses() {
        let mut tasks = BTreeMap::new();
        tasks.insert("load_ohlc".to_string(), TaskStatus::Success);
        let state = CycleState {
            date: NaiveDate::from_ymd_opt(2024, 9, 16).unwrap(),
            started_at: "2024-09-16T21:00:00Z".into(),
            completed_at: None,
            duration_seconds: None,
            all_success: None,
            tasks,
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["tasks"]["load_ohlc"], "success");
    }
}
