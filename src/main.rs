use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use tickerscan::{
    config::settings::Settings,
    db::redis::RedisPool,
    services::{
        analytics::{self, hub::AnalyticsHub},
        events::{BusEvent, EventBus},
        ingest::snapshot::SnapshotIngestor,
        maintenance::{orchestrator::MaintenanceOrchestrator, scheduler::MaintenanceScheduler},
        polygon::{client::PolygonClient, ws::PolygonWsIngestor},
        scanner::{engine::ScannerEngine, subscriptions::SubscriptionManager},
        session::detector::{SessionDetector, SESSION_KEY},
    },
};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() {
    init_logging();
    println!("Starting tickerscan…");

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings: {e}");
        std::process::exit(1);
    });

    if let Err(e) = PrometheusBuilder::new().install() {
        log::warn!("prometheus exporter not started: {e}");
    }

    let pg_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to postgres: {e}");
            std::process::exit(1);
        });

    let redis_pool = RedisPool::new(&settings.redis_url).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to redis: {e}");
        std::process::exit(1);
    });

    let client = PolygonClient::new(&settings).unwrap_or_else(|e| {
        eprintln!("Failed to build vendor client: {e}");
        std::process::exit(1);
    });

    let events = EventBus::new(redis_pool.clone());
    let hub = AnalyticsHub::new(&settings, redis_pool.clone());

    // --- snapshot ingestor -------------------------------------------------
    {
        let ingestor = SnapshotIngestor::new(client.clone(), redis_pool.clone());
        let cadence = settings.scan_interval_secs;
        tokio::spawn(async move {
            ingestor.run(cadence).await;
        });
    }

    // --- websocket ingestor ------------------------------------------------
    {
        let ws = PolygonWsIngestor::new(settings.clone(), redis_pool.clone());
        tokio::spawn(async move {
            ws.run().await;
        });
    }

    // --- analytics consumers -----------------------------------------------
    {
        let redis = redis_pool.clone();
        let cache = hub.vwap.clone();
        tokio::spawn(async move {
            analytics::vwap::run_consumer(redis, cache).await;
        });
    }
    {
        let redis = redis_pool.clone();
        let tracker = hub.volume_windows.clone();
        let slot_volumes = hub.slot_volumes.clone();
        let slots = hub.rvol.slots().clone();
        tokio::spawn(async move {
            analytics::volume_window::run_consumer(redis, tracker, slot_volumes, slots).await;
        });
    }
    {
        let redis = redis_pool.clone();
        let tracker = hub.price_windows.clone();
        tokio::spawn(async move {
            analytics::price_window::run_consumer(redis, tracker).await;
        });
    }
    {
        let redis = redis_pool.clone();
        let engine = hub.bars.clone();
        tokio::spawn(async move {
            analytics::minute_bars::run_consumer(redis, engine).await;
        });
    }

    // --- day-change fan-out to the in-memory engines -----------------------
    {
        let hub = hub.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::DayChanged { .. }) => hub.clear_in_day_state(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                }
            }
        });
    }

    // --- session detector --------------------------------------------------
    {
        let detector = SessionDetector::new(
            &settings,
            redis_pool.clone(),
            client.clone(),
            events.clone(),
        );
        tokio::spawn(async move {
            detector.run().await;
        });
    }

    // --- scanner -----------------------------------------------------------
    {
        let engine = ScannerEngine::new(
            redis_pool.clone(),
            pg_pool.clone(),
            settings.clone(),
            hub.clone(),
        );
        let rx = events.subscribe();
        tokio::spawn(async move {
            engine.run(rx).await;
        });
    }

    // --- subscription reconciler -------------------------------------------
    {
        let redis = redis_pool.clone();
        let mut manager = SubscriptionManager::new(redis.clone());
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            let mut iv = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = iv.tick() => {
                        let session = redis
                            .get_string(SESSION_KEY)
                            .await
                            .ok()
                            .flatten()
                            .as_deref()
                            .and_then(tickerscan::models::session::MarketSession::parse)
                            .unwrap_or(tickerscan::models::session::MarketSession::Closed);
                        manager.reconcile(session).await;
                    }
                    event = rx.recv() => {
                        if let Ok(BusEvent::DayChanged { .. }) = event {
                            manager.reset();
                        }
                    }
                }
            }
        });
    }

    // --- maintenance scheduler ---------------------------------------------
    {
        let orchestrator = MaintenanceOrchestrator::new(
            redis_pool.clone(),
            pg_pool.clone(),
            client.clone(),
            events.clone(),
            settings.clone(),
        );
        let scheduler = MaintenanceScheduler::new(orchestrator);
        tokio::spawn(Box::pin(async move {
            scheduler.run().await;
        }));
    }

    log::info!("all components started");

    // Block until SIGTERM/SIGINT; consumer blocks are ≤ 2 s so in-flight
    // work drains before the process exits.
    shutdown_signal().await;
    log::info!("shutdown signal received, draining");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    log::info!("bye");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("sigterm handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
