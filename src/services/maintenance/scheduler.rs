// src/services/maintenance/scheduler.rs

//! Maintenance triggers.
//!
//! * Weekdays 17:00–17:30 ET, one hour after the close: run the full
//!   graph for the day that just ended.
//! * Startup recovery: any of the last 7 trading days without a
//!   `maintenance:executed:{date}` marker is run first, oldest first.
//! * 03:00 ET: clear realtime caches, one hour before pre-market.

use chrono::{Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use chrono_tz::America::New_York;

use crate::services::maintenance::orchestrator::MaintenanceOrchestrator;
use crate::services::maintenance::tasks::clear_caches;
use crate::services::session::detector::is_weekend;

const POLL_SECS: u64 = 60;
const RECOVERY_LOOKBACK_DAYS: i64 = 7;
const TRIGGER_WINDOW_MINUTES: u32 = 30;
const REALTIME_CLEAR_HOUR: u32 = 3;

pub struct MaintenanceScheduler {
    orchestrator: MaintenanceOrchestrator,
    last_realtime_clear: Option<NaiveDate>,
}

impl MaintenanceScheduler {
    pub fn new(orchestrator: MaintenanceOrchestrator) -> Self {
        Self {
            orchestrator,
            last_realtime_clear: None,
        }
    }

    /// Startup recovery pass: unexecuted recent weekdays, oldest first.
    pub async fn recover_missed_days(&self) {
        let today = Utc::now().with_timezone(&New_York).date_naive();
        let candidates = recovery_candidates(today, RECOVERY_LOOKBACK_DAYS);

        for date in candidates {
            if self.orchestrator.was_executed(date).await {
                continue;
            }
            log::warn!("recovering missed maintenance for {date}");
            let skip_clear = self.orchestrator.settings.holiday_mode;
            self.orchestrator.run_full_cycle(date, skip_clear).await;
        }
    }

    pub async fn run(mut self) {
        self.recover_missed_days().await;

        let mut iv = tokio::time::interval(std::time::Duration::from_secs(POLL_SECS));
        loop {
            iv.tick().await;
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        let now_et = Utc::now().with_timezone(&New_York);
        let today = now_et.date_naive();

        // 03:00 realtime clear, once per day.
        if now_et.time().hour() == REALTIME_CLEAR_HOUR
            && self.last_realtime_clear != Some(today)
        {
            match clear_caches::clear_realtime(&self.orchestrator.redis).await {
                Ok(n) => log::info!("03:00 realtime clear: {n} keys deleted"),
                Err(e) => log::error!("03:00 realtime clear failed: {e}"),
            }
            self.last_realtime_clear = Some(today);
        }

        // Nightly window.
        let settings = &self.orchestrator.settings;
        if !in_trigger_window(
            now_et.time().hour(),
            now_et.time().minute(),
            settings.maintenance_hour,
            settings.maintenance_minute,
        ) {
            return;
        }
        if is_weekend(today) {
            return;
        }
        if self.orchestrator.was_executed(today).await {
            return;
        }

        log::info!("maintenance window open, running cycle for {today}");
        self.orchestrator
            .run_full_cycle(today, settings.holiday_mode)
            .await;
    }
}

/// Weekdays within the lookback, excluding today, oldest first.
pub fn recovery_candidates(today: NaiveDate, lookback_days: i64) -> Vec<NaiveDate> {
    (1..=lookback_days)
        .filter_map(|back| {
            let date = today - ChronoDuration::days(back);
            if is_weekend(date) {
                None
            } else {
                Some(date)
            }
        })
        .rev()
        .collect()
}

pub fn in_trigger_window(hour: u32, minute: u32, target_hour: u32, target_minute: u32) -> bool {
    if hour != target_hour {
        return false;
    }
    minute >= target_minute && minute < target_minute + TRIGGER_WINDOW_MINUTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_window_is_half_an_hour() {
        assert!(in_trigger_window(17, 0, 17, 0));
        assert!(in_trigger_window(17, 29, 17, 0));
        assert!(!in_trigger_window(17, 30, 17, 0));
        assert!(!in_trigger_window(16, 59, 17, 0));
        assert!(!in_trigger_window(18, 0, 17, 0));
    }

    #[test]
    fn recovery_skips_weekends_and_orders_oldest_first() {
        // Wednesday 2024-09-18 looking back 7 days: Mon/Tue of this
        // week plus Wed–Fri of the previous week, oldest first.
        let wednesday = NaiveDate::from_ymd_opt(2024, 9, 18).unwrap();
        let days = recovery_candidates(wednesday, 7);
        let expected: Vec<NaiveDate> = [11, 12, 13, 16, 17]
            .iter()
            .map(|d| NaiveDate::from_ymd_opt(2024, 9, *d).unwrap())
            .collect();
        assert_eq!(days, expected);
    }

    #[test]
    fn monday_recovery_reaches_back_past_the_weekend() {
        // Wednesday start with Monday/Tuesday unexecuted is the classic
        // recovery scenario: both must appear, Monday first.
        let wednesday = NaiveDate::from_ymd_opt(2024, 9, 18).unwrap();
        let days = recovery_candidates(wednesday, 2);
        let monday = NaiveDate::from_ymd_opt(2024, 9, 16).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2024, 9, 17).unwrap();
        assert_eq!(days, vec![monday, tuesday]);
    }
}
