// src/services/session/detector.rs

//! Market session detection. The vendor's live market-status endpoint
//! is the source of truth when reachable; otherwise the session is
//! computed from the ET wall clock plus the cached holiday calendar.
//! Emits session-changed and day-changed events; polls every 60 s but
//! treats state as unchanged unless session or date differs.

use chrono::{NaiveDate, NaiveTime, Utc};
use chrono_tz::America::New_York;

use crate::config::settings::Settings;
use crate::db::redis::RedisPool;
use crate::models::polygon::PolygonUpcoming;
use crate::models::session::{MarketHoliday, MarketSession, MarketStatus};
use crate::services::analytics::hub::parse_hhmm;
use crate::services::events::{BusEvent, EventBus};
use crate::services::polygon::client::PolygonClient;

pub const SESSION_KEY: &str = "market:session:current";
pub const STATUS_KEY: &str = "market:session:status";
pub const SESSION_STREAM: &str = "events:session";
const SESSION_TTL_SECS: usize = 300;
const HOLIDAY_TTL_SECS: usize = 86_400 * 30;
const POLL_SECS: u64 = 60;

pub struct SessionDetector {
    redis: RedisPool,
    client: PolygonClient,
    events: EventBus,
    tz: chrono_tz::Tz,
    pre_market_start: NaiveTime,
    market_open: NaiveTime,
    market_close: NaiveTime,
    post_market_end: NaiveTime,
    last_session: Option<MarketSession>,
    last_trading_date: Option<NaiveDate>,
}

impl SessionDetector {
    pub fn new(
        settings: &Settings,
        redis: RedisPool,
        client: PolygonClient,
        events: EventBus,
    ) -> Self {
        let tz = settings.timezone.parse().unwrap_or(New_York);
        Self {
            redis,
            client,
            events,
            tz,
            pre_market_start: parse_hhmm(&settings.pre_market_start),
            market_open: parse_hhmm(&settings.market_open),
            market_close: parse_hhmm(&settings.market_close),
            post_market_end: parse_hhmm(&settings.post_market_end),
            last_session: None,
            last_trading_date: None,
        }
    }

    pub async fn initialize(&mut self) {
        self.load_holidays().await;
        let status = self.detect().await;
        self.last_session = Some(status.current_session);
        self.last_trading_date = Some(status.trading_date);
        self.save_status(&status).await;
        log::info!(
            "session detector initialized: {:?} on {}",
            status.current_session,
            status.trading_date
        );
    }

    /// Holiday calendar from the vendor, cached 30 days per
    /// (date, exchange).
    async fn load_holidays(&self) {
        let upcoming = match self.client.upcoming_holidays().await {
            Ok(h) => h,
            Err(e) => {
                log::error!("holiday load failed: {e}");
                return;
            }
        };
        let mut cached = 0usize;
        for entry in &upcoming {
            if let Some(holiday) = holiday_from_upcoming(entry) {
                let key = format!("market:holiday:{}:{}", holiday.date, holiday.exchange);
                if let Err(e) = self.redis.set_json(&key, &holiday, HOLIDAY_TTL_SECS).await {
                    log::warn!("holiday cache write failed: {e}");
                } else {
                    cached += 1;
                }
            }
        }
        log::info!("cached {cached} holiday entries");
    }

    async fn holiday_for(&self, date: NaiveDate) -> Option<MarketHoliday> {
        for exchange in ["NYSE", "NASDAQ"] {
            let key = format!("market:holiday:{date}:{exchange}");
            if let Ok(Some(holiday)) = self.redis.get_json::<_, MarketHoliday>(&key).await {
                return Some(holiday);
            }
        }
        None
    }

    async fn detect(&self) -> MarketStatus {
        let now_et = Utc::now().with_timezone(&self.tz);
        let current_date = now_et.date_naive();
        let current_time = now_et.time();

        let holiday = self.holiday_for(current_date).await;
        let is_weekend = is_weekend(current_date);
        let is_holiday = holiday.as_ref().map(|h| h.is_closed()).unwrap_or(false);
        let is_trading_day = !is_weekend && !is_holiday;

        let (is_early_close, market_close) = match &holiday {
            Some(h) if h.is_early_close() => {
                let close = h
                    .close
                    .as_deref()
                    .and_then(parse_close_time)
                    .unwrap_or(self.market_close);
                (true, close)
            }
            _ => (false, self.market_close),
        };

        // Vendor first; wall clock as fallback.
        let current_session = match self.client.market_status().await {
            Ok(status) => status.session().unwrap_or_else(|| {
                self.session_from_time(current_time, market_close, is_trading_day)
            }),
            Err(e) => {
                log::debug!("vendor market status unavailable, using clock: {e}");
                self.session_from_time(current_time, market_close, is_trading_day)
            }
        };

        let (next_session, next_time) =
            self.next_session(current_session, current_time, market_close);
        let seconds_until = next_time.map(|t| seconds_until(current_time, t));

        MarketStatus {
            timestamp: Utc::now(),
            current_session,
            trading_date: current_date,
            is_trading_day,
            is_holiday,
            is_early_close,
            market_close,
            next_session,
            seconds_until_next_session: seconds_until,
        }
    }

    fn session_from_time(
        &self,
        t: NaiveTime,
        market_close: NaiveTime,
        is_trading_day: bool,
    ) -> MarketSession {
        if !is_trading_day {
            return MarketSession::Closed;
        }
        session_from_time(
            t,
            self.pre_market_start,
            self.market_open,
            market_close,
            self.post_market_end,
        )
    }

    fn next_session(
        &self,
        current: MarketSession,
        _now: NaiveTime,
        market_close: NaiveTime,
    ) -> (Option<MarketSession>, Option<NaiveTime>) {
        match current {
            MarketSession::Closed => (Some(MarketSession::PreMarket), Some(self.pre_market_start)),
            MarketSession::PreMarket => (Some(MarketSession::MarketOpen), Some(self.market_open)),
            MarketSession::MarketOpen => (Some(MarketSession::PostMarket), Some(market_close)),
            MarketSession::PostMarket => (Some(MarketSession::Closed), Some(self.post_market_end)),
        }
    }

    /// One poll: detect, compare, emit on change.
    pub async fn check_and_update(&mut self) {
        let status = self.detect().await;
        let session_changed = self.last_session != Some(status.current_session);
        let day_changed = self.last_trading_date != Some(status.trading_date);

        if !session_changed && !day_changed {
            return;
        }

        // Sessions only move forward within a trading date; a backward
        // reading is a vendor glitch, not a transition.
        if !day_changed {
            if let Some(last) = self.last_session {
                if status.current_session.ordinal() < last.ordinal() {
                    log::warn!(
                        "ignoring backward session reading {:?} -> {:?}",
                        last,
                        status.current_session
                    );
                    return;
                }
            }
        }

        let from = self.last_session.unwrap_or(status.current_session);
        log::info!(
            "session change: {:?} -> {:?} (new day: {day_changed})",
            from,
            status.current_session
        );

        self.save_status(&status).await;
        self.emit_session_stream(&status, from).await;

        self.events
            .publish(BusEvent::SessionChanged {
                from,
                to: status.current_session,
                trading_date: status.trading_date,
            })
            .await;
        if day_changed {
            if let Some(previous) = self.last_trading_date {
                self.events
                    .publish(BusEvent::DayChanged {
                        new_date: status.trading_date,
                        previous_date: previous,
                    })
                    .await;
            }
        }

        self.last_session = Some(status.current_session);
        self.last_trading_date = Some(status.trading_date);
    }

    async fn save_status(&self, status: &MarketStatus) {
        if let Err(e) = self
            .redis
            .set_string(SESSION_KEY, status.current_session.as_str(), SESSION_TTL_SECS)
            .await
        {
            log::warn!("session key write failed: {e}");
        }
        if let Err(e) = self.redis.set_json(STATUS_KEY, status, SESSION_TTL_SECS).await {
            log::warn!("status key write failed: {e}");
        }
    }

    async fn emit_session_stream(&self, status: &MarketStatus, from: MarketSession) {
        let fields = [
            ("from_session", from.as_str().to_string()),
            ("to_session", status.current_session.as_str().to_string()),
            ("trading_date", status.trading_date.to_string()),
            ("timestamp", status.timestamp.to_rfc3339()),
        ];
        if let Err(e) = self.redis.xadd_maxlen(SESSION_STREAM, 1_000, &fields).await {
            log::warn!("session stream emit failed: {e}");
        }
    }

    pub async fn run(mut self) {
        self.initialize().await;
        let mut iv = tokio::time::interval(std::time::Duration::from_secs(POLL_SECS));
        loop {
            iv.tick().await;
            self.check_and_update().await;
        }
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    use chrono::Datelike;
    date.weekday().num_days_from_monday() >= 5
}

/// Pure boundary logic: [pre, open) pre-market, [open, close) open,
/// [close, post_end) post, else closed.
pub fn session_from_time(
    t: NaiveTime,
    pre_start: NaiveTime,
    open: NaiveTime,
    close: NaiveTime,
    post_end: NaiveTime,
) -> MarketSession {
    if t < pre_start {
        MarketSession::Closed
    } else if t < open {
        MarketSession::PreMarket
    } else if t < close {
        MarketSession::MarketOpen
    } else if t < post_end {
        MarketSession::PostMarket
    } else {
        MarketSession::Closed
    }
}

fn seconds_until(now: NaiveTime, target: NaiveTime) -> i64 {
    use chrono::Timelike;
    let now_s = now.num_seconds_from_midnight() as i64;
    let target_s = target.num_seconds_from_midnight() as i64;
    if target_s > now_s {
        target_s - now_s
    } else {
        86_400 - now_s + target_s
    }
}

fn parse_close_time(raw: &str) -> Option<NaiveTime> {
    // Vendor sends an RFC 3339 timestamp for early closes.
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&New_York).time())
}

fn holiday_from_upcoming(entry: &PolygonUpcoming) -> Option<MarketHoliday> {
    let exchange = entry.exchange.clone()?;
    if exchange != "NYSE" && exchange != "NASDAQ" {
        return None;
    }
    Some(MarketHoliday {
        date: entry.date.clone()?,
        name: entry.name.clone().unwrap_or_default(),
        exchange,
        status: entry.status.clone()?,
        open: entry.open.clone(),
        close: entry.close.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn classify(time: NaiveTime) -> MarketSession {
        session_from_time(time, t(4, 0, 0), t(9, 30, 0), t(16, 0, 0), t(20, 0, 0))
    }

    #[test]
    fn boundary_at_exactly_nine_thirty_advances_session() {
        assert_eq!(classify(t(9, 29, 59)), MarketSession::PreMarket);
        assert_eq!(classify(t(9, 30, 0)), MarketSession::MarketOpen);
    }

    #[test]
    fn full_day_classification() {
        assert_eq!(classify(t(3, 59, 59)), MarketSession::Closed);
        assert_eq!(classify(t(4, 0, 0)), MarketSession::PreMarket);
        assert_eq!(classify(t(12, 0, 0)), MarketSession::MarketOpen);
        assert_eq!(classify(t(16, 0, 0)), MarketSession::PostMarket);
        assert_eq!(classify(t(19, 59, 59)), MarketSession::PostMarket);
        assert_eq!(classify(t(20, 0, 0)), MarketSession::Closed);
    }

    #[test]
    fn early_close_shifts_the_close_boundary() {
        let early = t(13, 0, 0);
        let session = session_from_time(t(13, 30, 0), t(4, 0, 0), t(9, 30, 0), early, t(20, 0, 0));
        assert_eq!(session, MarketSession::PostMarket);
    }

    #[test]
    fn weekends_are_never_trading_days() {
        // 2024-09-14 is a Saturday, 2024-09-16 a Monday.
        assert!(is_weekend(NaiveDate::from_ymd_opt(2024, 9, 14).unwrap()));
        assert!(is_weekend(NaiveDate::from_ymd_opt(2024, 9, 15).unwrap()));
        assert!(!is_weekend(NaiveDate::from_ymd_opt(2024, 9, 16).unwrap()));
    }

    #[test]
    fn seconds_until_wraps_past_midnight() {
        assert_eq!(seconds_until(t(9, 0, 0), t(9, 30, 0)), 1_800);
        assert_eq!(seconds_until(t(23, 0, 0), t(4, 0, 0)), 5 * 3_600);
    }

    #[test]
    fn holiday_filter_keeps_us_exchanges_only() {
        let entry = PolygonUpcoming {
            date: Some("2024-12-25".into()),
            name: Some("Christmas".into()),
            exchange: Some("OTC".into()),
            status: Some("closed".into()),
            open: None,
            close: None,
        };
        assert!(holiday_from_upcoming(&entry).is_none());

        let nyse = PolygonUpcoming {
            exchange: Some("NYSE".into()),
            ..entry
        };
        let holiday = holiday_from_upcoming(&nyse).unwrap();
        assert!(holiday.is_closed());
        assert_eq!(holiday.date, "2024-12-25");
    }
}
