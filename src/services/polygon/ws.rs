// src/services/polygon/ws.rs

//!  Vendor WebSocket ingestor ⇢ typed Bus streams
//!
//!  * Connects & authenticates (auth op, re-auth on every reconnect)
//!  * Demuxes inbound event arrays onto stream:realtime:trades /
//!    stream:realtime:quotes / stream:realtime:aggregates /
//!    stream:market:minutes
//!  * Drains subscribe/unsubscribe commands from polygon_ws:subscriptions
//!
//!  One reader task + one writer task per connection, plus one
//!  command-consumer that lives across reconnects.

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use crate::config::settings::Settings;
use crate::db::redis::{entry_field, RedisPool};
use crate::models::polygon::{PolygonWsEvent, WsAggregate};
use crate::models::session::MarketSession;
use crate::utils::errors::ApiError;

pub const STREAM_TRADES: &str = "stream:realtime:trades";
pub const STREAM_QUOTES: &str = "stream:realtime:quotes";
pub const STREAM_AGGREGATES: &str = "stream:realtime:aggregates";
pub const STREAM_MINUTES: &str = "stream:market:minutes";
pub const COMMAND_STREAM: &str = "polygon_ws:subscriptions";

const MAXLEN_TRADES: usize = 10_000;
const MAXLEN_QUOTES: usize = 10_000;
const MAXLEN_AGGREGATES: usize = 3_000;
const MAXLEN_MINUTES: usize = 20_000;

const COMMAND_GROUP: &str = "polygon_ws_commands";
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_BASE_DELAY_SECS: u64 = 5;

/// Connection lifecycle. DEGRADED means the socket is up but the last
/// subscribe batch failed; CLOSED is terminal (auth rejected or the
/// reconnect budget ran out).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Subscribed,
    Degraded,
    Closed,
}

#[derive(Debug, Clone)]
enum WsCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

pub struct PolygonWsIngestor {
    settings: Settings,
    redis: RedisPool,
    subscribed: Arc<Mutex<HashSet<String>>>,
    healthy: Arc<AtomicBool>,
    state: Arc<Mutex<WsState>>,
}

impl PolygonWsIngestor {
    pub fn new(settings: Settings, redis: RedisPool) -> Self {
        Self {
            settings,
            redis,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            healthy: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(WsState::Disconnected)),
        }
    }

    pub fn health_flag(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }

    pub fn state(&self) -> WsState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: WsState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            log::debug!("polygon ws state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Entry point: spawns the command consumer, then runs the
    /// connect/auth/read loop with bounded reconnects.
    pub async fn run(self) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(64);

        {
            let redis = self.redis.clone();
            tokio::spawn(async move {
                command_consumer(redis, cmd_tx).await;
            });
        }

        let mut attempts: u32 = 0;

        loop {
            match self.run_connection(&mut cmd_rx).await {
                Ok(()) => {
                    // Clean shutdown of the socket; reconnect fresh.
                    attempts = 0;
                }
                Err(ApiError::Other(msg)) if msg.contains("auth") => {
                    log::error!("polygon ws auth rejected, closing ingestor: {msg}");
                    self.healthy.store(false, Ordering::SeqCst);
                    self.set_state(WsState::Closed);
                    return; // fatal
                }
                Err(e) => {
                    log::warn!("polygon ws transport error: {e}");
                    self.set_state(WsState::Degraded);
                }
            }

            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                log::error!(
                    "polygon ws gave up after {} reconnect attempts",
                    MAX_RECONNECT_ATTEMPTS
                );
                self.healthy.store(false, Ordering::SeqCst);
                metrics::gauge!("polygon_ws_healthy", 0.0);
                self.set_state(WsState::Closed);
                return;
            }
            self.set_state(WsState::Disconnected);

            let jitter = rand::thread_rng().gen_range(0..1000);
            let delay =
                Duration::from_secs(RECONNECT_BASE_DELAY_SECS * attempts as u64)
                    + Duration::from_millis(jitter);
            log::info!(
                "polygon ws reconnecting (attempt {attempts}/{MAX_RECONNECT_ATTEMPTS}) in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One full connection: connect, authenticate, resubscribe, then
    /// pump until the socket dies. Returns Ok on orderly close.
    async fn run_connection(
        &self,
        cmd_rx: &mut mpsc::Receiver<WsCommand>,
    ) -> Result<(), ApiError> {
        self.set_state(WsState::Connecting);
        log::info!("polygon ws connecting: {}", self.settings.polygon_ws_url);
        let (mut ws, _) = connect_async(self.settings.polygon_ws_url.as_str()).await?;

        // ── auth ────────────────────────────────────────────────────
        self.set_state(WsState::Authenticating);
        let auth = serde_json::json!({
            "action": "auth",
            "params": self.settings.polygon_api_key,
        })
        .to_string();
        ws.send(Message::Text(auth.into())).await?;

        let authed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = ws.next().await {
                let msg = msg?;
                if let Message::Text(txt) = msg {
                    if txt.contains("auth_success")
                        || txt.contains("\"connected\"")
                        || txt.contains("\"success\"")
                    {
                        return Ok::<bool, ApiError>(true);
                    }
                    if txt.contains("auth_failed") || txt.contains("auth_timeout") {
                        return Ok(false);
                    }
                }
            }
            Ok(false)
        })
        .await
        .map_err(|_| ApiError::Other("handshake timed out".into()))??;

        if !authed {
            return Err(ApiError::Other("auth rejected by vendor".into()));
        }
        log::info!("polygon ws authenticated");
        self.set_state(WsState::Authenticated);
        metrics::gauge!("polygon_ws_healthy", 1.0);

        // ── resubscribe the carried-over set ────────────────────────
        let carried: Vec<String> = {
            let set = self.subscribed.lock().unwrap();
            set.iter().cloned().collect()
        };

        let (mut sink, mut source) = ws.split();

        if !carried.is_empty() {
            let frame = subscription_frame("subscribe", &carried);
            sink.send(Message::Text(frame.into())).await?;
            log::info!("polygon ws resubscribed {} symbols", carried.len());
        }
        self.set_state(WsState::Subscribed);

        // ── writer ──────────────────────────────────────────────────
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        // ── reader + command pump ───────────────────────────────────
        loop {
            tokio::select! {
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Text(txt))) => {
                            self.demux(&txt).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            log::warn!("polygon ws closed by vendor: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            writer.abort();
                            return Err(ApiError::WebSocket(e));
                        }
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Subscribe(symbols)) => {
                            self.apply_subscription(&out_tx, "subscribe", symbols).await;
                        }
                        Some(WsCommand::Unsubscribe(symbols)) => {
                            self.apply_subscription(&out_tx, "unsubscribe", symbols).await;
                        }
                        None => break,
                    }
                }
            }
        }

        writer.abort();
        Ok(())
    }

    async fn apply_subscription(
        &self,
        out_tx: &mpsc::Sender<Message>,
        action: &str,
        symbols: Vec<String>,
    ) {
        if symbols.is_empty() {
            return;
        }
        {
            let mut set = self.subscribed.lock().unwrap();
            for s in &symbols {
                if action == "subscribe" {
                    set.insert(s.clone());
                } else {
                    set.remove(s);
                }
            }
        }
        let frame = subscription_frame(action, &symbols);
        if out_tx.send(Message::Text(frame.into())).await.is_err() {
            log::warn!("polygon ws writer gone, {action} dropped");
        } else {
            log::info!("polygon ws {action}: {} symbols", symbols.len());
        }
    }

    /// Fan an inbound event array onto the typed streams, in vendor
    /// order; never reorders.
    async fn demux(&self, raw: &str) {
        let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                metrics::counter!("polygon_ws_parse_failures", 1);
                return;
            }
        };

        for value in values {
            let event: PolygonWsEvent = match serde_json::from_value(value) {
                Ok(e) => e,
                Err(_) => continue, // unknown tag, skip
            };
            match event {
                PolygonWsEvent::Trade(t) => {
                    let fields = [
                        ("symbol", t.sym.clone()),
                        ("price", t.p.unwrap_or(0.0).to_string()),
                        ("size", t.s.unwrap_or(0.0).to_string()),
                        ("exchange", t.x.unwrap_or(0).to_string()),
                        ("timestamp", t.t.unwrap_or(0).to_string()),
                    ];
                    self.xadd(STREAM_TRADES, MAXLEN_TRADES, &fields).await;
                }
                PolygonWsEvent::Quote(q) => {
                    let fields = [
                        ("symbol", q.sym.clone()),
                        ("bid", q.bp.unwrap_or(0.0).to_string()),
                        ("bid_size", q.bs.unwrap_or(0.0).to_string()),
                        ("ask", q.ap.unwrap_or(0.0).to_string()),
                        ("ask_size", q.ask_size.unwrap_or(0.0).to_string()),
                        ("timestamp", q.t.unwrap_or(0).to_string()),
                    ];
                    self.xadd(STREAM_QUOTES, MAXLEN_QUOTES, &fields).await;
                }
                PolygonWsEvent::Aggregate(a) => {
                    let fields = aggregate_fields(&a);
                    self.xadd(STREAM_AGGREGATES, MAXLEN_AGGREGATES, &fields).await;
                }
                PolygonWsEvent::MinuteAggregate(a) => {
                    let fields = aggregate_fields(&a);
                    self.xadd(STREAM_MINUTES, MAXLEN_MINUTES, &fields).await;
                }
                PolygonWsEvent::Status(s) => {
                    log::debug!(
                        "polygon ws status: {} {}",
                        s.status.as_deref().unwrap_or("-"),
                        s.message.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    async fn xadd(&self, stream: &str, maxlen: usize, fields: &[(&str, String)]) {
        if let Err(e) = self.redis.xadd_maxlen(stream, maxlen, fields).await {
            log::warn!("xadd {stream} failed: {e}");
        }
    }
}

fn aggregate_fields(a: &WsAggregate) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", a.sym.clone()),
        ("open", a.o.unwrap_or(0.0).to_string()),
        ("high", a.h.unwrap_or(0.0).to_string()),
        ("low", a.l.unwrap_or(0.0).to_string()),
        ("close", a.c.unwrap_or(0.0).to_string()),
        ("volume", a.v.unwrap_or(0.0).to_string()),
        ("volume_accumulated", a.av.unwrap_or(0.0).to_string()),
        ("vwap", a.vw.unwrap_or(0.0).to_string()),
        ("trades", a.n.unwrap_or(0).to_string()),
        ("timestamp_start", a.s.unwrap_or(0).to_string()),
        ("timestamp_end", a.e.unwrap_or(0).to_string()),
    ]
}

/// Builds the vendor param string: "T.AAPL,Q.AAPL,A.AAPL,AM.AAPL,…"
fn subscription_frame(action: &str, symbols: &[String]) -> String {
    let mut params = Vec::with_capacity(symbols.len() * 4);
    for sym in symbols {
        for ev in ["T", "Q", "A", "AM"] {
            params.push(format!("{ev}.{sym}"));
        }
    }
    serde_json::json!({
        "action": action,
        "params": params.join(","),
    })
    .to_string()
}

/// Drains `polygon_ws:subscriptions` and forwards batched commands to
/// the connection task. Subscription churn is suppressed while the
/// session is CLOSED; the reconciler re-emits once rankings move again.
async fn command_consumer(redis: RedisPool, tx: mpsc::Sender<WsCommand>) {
    if let Err(e) = redis.ensure_group(COMMAND_STREAM, COMMAND_GROUP).await {
        log::warn!("command group create failed: {e}");
    }

    loop {
        let reply = match redis
            .read_group(COMMAND_STREAM, COMMAND_GROUP, "polygon_ws_1", 500, 2000)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.to_string().contains("NOGROUP") {
                    let _ = redis.ensure_group(COMMAND_STREAM, COMMAND_GROUP).await;
                    continue;
                }
                log::warn!("command read failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let session_closed = matches!(
            redis
                .get_string("market:session:current")
                .await
                .ok()
                .flatten()
                .as_deref()
                .and_then(MarketSession::parse),
            Some(MarketSession::Closed)
        );

        let mut subs = Vec::new();
        let mut unsubs = Vec::new();
        let mut ids = Vec::new();

        for key in reply.keys {
            for entry in key.ids {
                if let (Some(symbol), Some(action)) = (
                    entry_field(&entry, "symbol"),
                    entry_field(&entry, "action"),
                ) {
                    match action.as_str() {
                        "subscribe" => subs.push(symbol),
                        "unsubscribe" => unsubs.push(symbol),
                        other => log::debug!("unknown subscription action {other}"),
                    }
                }
                ids.push(entry.id.clone());
            }
        }

        if let Err(e) = redis.ack(COMMAND_STREAM, COMMAND_GROUP, &ids).await {
            log::warn!("command ack failed: {e}");
        }

        if session_closed {
            if !subs.is_empty() || !unsubs.is_empty() {
                log::debug!(
                    "session closed, suppressing {} sub / {} unsub commands",
                    subs.len(),
                    unsubs.len()
                );
            }
            continue;
        }

        if !subs.is_empty() && tx.send(WsCommand::Subscribe(subs)).await.is_err() {
            return;
        }
        if !unsubs.is_empty() && tx.send(WsCommand::Unsubscribe(unsubs)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_frame_covers_all_event_types() {
        let frame = subscription_frame("subscribe", &["AAPL".into(), "TSLA".into()]);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["action"], "subscribe");
        let params = v["params"].as_str().unwrap();
        assert!(params.contains("T.AAPL"));
        assert!(params.contains("Q.TSLA"));
        assert!(params.contains("A.AAPL"));
        assert!(params.contains("AM.TSLA"));
        assert_eq!(params.split(',').count(), 8);
    }

    #[test]
    fn aggregate_fields_carry_accumulated_volume() {
        let agg = WsAggregate {
            sym: "TSLA".into(),
            o: Some(1.0),
            h: Some(2.0),
            l: Some(0.5),
            c: Some(1.5),
            v: Some(100.0),
            av: Some(12345.0),
            vw: Some(1.2),
            n: Some(42),
            s: Some(1),
            e: Some(2),
        };
        let fields = aggregate_fields(&agg);
        assert!(fields
            .iter()
            .any(|(k, v)| *k == "volume_accumulated" && v == "12345"));
    }
}
