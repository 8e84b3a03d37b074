//! End-to-end exercises of the pure scan pipeline: filter → score →
//! rank → categorise → delta, over synthetic snapshot rows. No Bus or
//! Warehouse behind these: everything here is the in-memory hot path.

use uuid::Uuid;

use tickerscan::models::scanner::{
    FilterConfig, FilterParams, RankingDelta, ScannerCategory, ScannerTicker,
};
use tickerscan::models::session::MarketSession;
use tickerscan::services::scanner::categories::Categorizer;
use tickerscan::services::scanner::deltas::calculate_ranking_deltas;
use tickerscan::services::scanner::engine::score;
use tickerscan::services::scanner::filters::FilterEngine;
use tickerscan::services::scanner::gaps::{apply_gaps, calculate_gaps};

fn premarket_row(symbol: &str, price: f64, prev_close: f64) -> ScannerTicker {
    let mut t = ScannerTicker::new(symbol, price, MarketSession::PreMarket);
    t.prev_close = Some(prev_close);
    t.volume_today = 250_000.0;
    let gaps = calculate_gaps(
        price,
        Some(prev_close),
        None,
        None,
        None,
        None,
        MarketSession::PreMarket,
    );
    apply_gaps(&mut t, &gaps);
    t
}

fn watchlist_filter() -> FilterConfig {
    FilterConfig {
        id: Uuid::new_v4(),
        name: "premarket-watchlist".into(),
        enabled: true,
        priority: 10,
        sessions: vec![MarketSession::PreMarket],
        parameters: FilterParams {
            min_gap: Some(5.0),
            min_price: Some(1.0),
            ..Default::default()
        },
    }
}

/// ABCD gaps up 10% pre-market, passes the watchlist filter, lands in
/// GAPPERS_UP and shows up as an add.
#[test]
fn premarket_gap_up_flows_to_gappers_and_delta_add() {
    // ABCD: price 12.10 over prev close 11.00 → 10% gap.
    let mut abcd = premarket_row("ABCD", 12.10, 11.00);
    assert!((abcd.gap_from_prev_close.unwrap() - 10.0).abs() < 1e-9);
    assert!((abcd.gap_premarket.unwrap() - 10.0).abs() < 1e-9);

    // Filter set admits it.
    let engine = FilterEngine::new(vec![watchlist_filter()], MarketSession::PreMarket);
    let matched = engine.passes_all(&abcd).expect("row should pass");
    assert_eq!(matched, vec!["premarket-watchlist".to_string()]);
    abcd.filters_matched = matched;
    abcd.score = score(&abcd);

    // A 3% gapper is rejected by the same set.
    let small = premarket_row("SMLL", 10.30, 10.00);
    assert!(engine.passes_all(&small).is_none());

    // Categorisation puts ABCD in GAPPERS_UP (no RVOL → no HIGH_VOLUME).
    let categorizer = Categorizer::new(20, 1000);
    let rankings = categorizer.rank_all(std::slice::from_ref(&abcd));
    let gappers = &rankings[&ScannerCategory::GappersUp];
    assert_eq!(gappers.len(), 1);
    assert_eq!(gappers[0].symbol, "ABCD");
    assert_eq!(gappers[0].rank, 1);
    assert!(!rankings.contains_key(&ScannerCategory::HighVolume));

    // First tick against an empty previous ranking emits an add.
    let deltas = calculate_ranking_deltas(&[], gappers);
    assert_eq!(deltas.len(), 1);
    match &deltas[0] {
        RankingDelta::Add { rank, symbol, .. } => {
            assert_eq!(*rank, 1);
            assert_eq!(symbol, "ABCD");
        }
        other => panic!("expected add, got {other:?}"),
    }
}

/// BIVI trades 159 263 times against a 660 ± 156 baseline
/// → z ≈ 1015.78, rank 1 of ANOMALIES.
#[test]
fn trade_anomaly_ranks_first_in_anomalies() {
    use tickerscan::services::analytics::anomaly::z_score;

    let z = z_score(159_263, 660.0, 156.0);
    assert!((z - 1015.7884615384615).abs() < 1e-6);

    let mut bivi = ScannerTicker::new("BIVI", 3.2, MarketSession::MarketOpen);
    bivi.trades_z_score = Some(z);
    bivi.volume_today = 1_000_000.0;

    let mut mild = ScannerTicker::new("MILD", 8.0, MarketSession::MarketOpen);
    mild.trades_z_score = Some(4.5);
    mild.volume_today = 500_000.0;

    let categorizer = Categorizer::new(20, 1000);
    let rankings = categorizer.rank_all(&[mild, bivi]);
    let anomalies = &rankings[&ScannerCategory::Anomalies];
    assert_eq!(anomalies[0].symbol, "BIVI");
    assert_eq!(anomalies[0].rank, 1);
    assert_eq!(anomalies[1].symbol, "MILD");
}

/// A pure position swap yields exactly two reranks and no update when
/// the price move stays under a cent.
#[test]
fn rerank_without_update_on_sub_cent_move() {
    let mut x = ScannerTicker::new("XXXX", 10.000, MarketSession::MarketOpen);
    x.volume_today = 1_000.0;
    let mut y = ScannerTicker::new("YYYY", 5.0, MarketSession::MarketOpen);
    y.volume_today = 2_000.0;

    let old = vec![x.clone(), y.clone()];

    let mut x2 = x.clone();
    x2.price = 10.001; // below the $0.01 threshold
    let new = vec![y, x2];

    let deltas = calculate_ranking_deltas(&old, &new);
    assert_eq!(deltas.len(), 2);
    for delta in &deltas {
        match delta {
            RankingDelta::Rerank {
                symbol,
                old_rank,
                new_rank,
            } => match symbol.as_str() {
                "XXXX" => assert_eq!((*old_rank, *new_rank), (1, 2)),
                "YYYY" => assert_eq!((*old_rank, *new_rank), (2, 1)),
                other => panic!("unexpected symbol {other}"),
            },
            other => panic!("expected only reranks, got {other:?}"),
        }
    }
}

/// The pre-market peak gap and the gap at the open are latched
/// independently; later ticks move only the running maximum.
#[test]
fn session_transition_latches_open_gap() {
    use tickerscan::services::scanner::gaps::GapTracker;

    let tracker = GapTracker::new();
    let now = chrono::Utc::now();

    // 09:29:59: pre-market peak 8%.
    tracker.track("SYMB", MarketSession::PreMarket, 8.0, now);
    // 09:30:01: first open tick at +1% over open ≈ gap 9.08% from
    // prev close; this instant is the open gap.
    tracker.track("SYMB", MarketSession::MarketOpen, 9.08, now);
    // Momentum continues; high gap moves, open gap must not.
    tracker.track("SYMB", MarketSession::MarketOpen, 12.4, now);

    let record = tracker.get("SYMB").unwrap();
    assert_eq!(record.premarket_gap, Some(8.0));
    assert_eq!(record.open_gap, Some(9.08));
    assert_eq!(record.high_gap, Some(12.4));
    assert_eq!(record.current_gap, 12.4);
}

/// Scoring and tie-breaks: rows are ordered by score descending with
/// symbol as the deterministic tie-break, ranks 1-based.
#[test]
fn scoring_orders_filtered_rows() {
    let mut a = ScannerTicker::new("AAA", 10.0, MarketSession::MarketOpen);
    a.rvol = Some(2.0);
    a.volume_today = 1_000_000.0;
    a.avg_volume_30d = Some(1_000_000.0);

    let mut b = ScannerTicker::new("BBB", 10.0, MarketSession::MarketOpen);
    b.rvol = Some(8.0);
    b.volume_today = 4_000_000.0;
    b.avg_volume_30d = Some(1_000_000.0);

    assert!((score(&a) - 25.0).abs() < 1e-9);
    assert!((score(&b) - 100.0).abs() < 1e-9);

    let mut rows = vec![a, b];
    rows.sort_by(|x, y| {
        score(y)
            .partial_cmp(&score(x))
            .unwrap()
            .then_with(|| x.symbol.cmp(&y.symbol))
    });
    assert_eq!(rows[0].symbol, "BBB");
}
