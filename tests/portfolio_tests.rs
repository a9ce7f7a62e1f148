//! Multi-pair orchestration scenarios: coordinated entries under risk
//! limits, signal fan-out, price routing, and emergency liquidation.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use trailstop::engine::{EngineParams, ExecutionEngine};
use trailstop::portfolio::{
    EntryRequest, EntrySignal, MultiPairOrchestrator, PairConfig, PortfolioConfig,
};
use trailstop::store::SqliteStore;
use trailstop::types::ProductId;
use trailstop::venue::InMemoryVenue;

// =============================================================================
// Test Utilities
// =============================================================================

fn pair(product_id: &str, size_pct: Decimal) -> PairConfig {
    PairConfig {
        product_id: product_id.to_string(),
        enabled: true,
        position_size_pct: size_pct,
        trail_pct: dec!(0.02),
        correlation_group: None,
    }
}

async fn three_pair_orchestrator(
    venue: &Arc<InMemoryVenue>,
    store: &SqliteStore,
) -> MultiPairOrchestrator {
    let config = PortfolioConfig {
        total_capital: dec!(100000),
        ..PortfolioConfig::default()
    };
    let mut orchestrator = MultiPairOrchestrator::new(config);

    for (product_id, size_pct) in [("BTC-USD", dec!(5)), ("ETH-USD", dec!(4)), ("SOL-USD", dec!(3))]
    {
        let engine = Arc::new(ExecutionEngine::new(
            ProductId::new(product_id),
            Arc::clone(venue) as Arc<dyn trailstop::venue::VenueAdapter>,
            store.clone(),
            EngineParams {
                min_ratchet: Decimal::ZERO,
                ..EngineParams::default()
            },
        ));
        orchestrator
            .register_pair(pair(product_id, size_pct), engine)
            .await
            .unwrap();
    }
    orchestrator
}

fn three_entries() -> Vec<EntryRequest> {
    vec![
        // 5% / 4% / 3% of 100k capital
        EntryRequest {
            product_id: ProductId::new("BTC-USD"),
            price: dec!(50000),
            qty: dec!(0.1),
        },
        EntryRequest {
            product_id: ProductId::new("ETH-USD"),
            price: dec!(2000),
            qty: dec!(2),
        },
        EntryRequest {
            product_id: ProductId::new("SOL-USD"),
            price: dec!(150),
            qty: dec!(20),
        },
    ]
}

// =============================================================================
// Coordinated entries
// =============================================================================

#[tokio::test]
async fn test_coordinated_entries_respect_capital_and_concentration() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 2)
        .await
        .unwrap();
    assert_eq!(order_ids.len(), 3);

    let status = orchestrator.portfolio_status().await;
    assert_eq!(status.metrics.active_positions, 3);
    assert_eq!(status.metrics.deployed_capital, dec!(12000));
    assert_eq!(status.metrics.concentration_pct, dec!(12));
    assert!(status.risk_violations.is_empty());

    // every entry landed at the venue
    for order_id in order_ids.values() {
        assert_eq!(venue.order(order_id).unwrap().status, "open");
    }
}

#[tokio::test]
async fn test_batch_rejected_when_limits_already_violated() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    // an oversized first position (30% of capital) breaks max_position_size_pct
    let oversized = vec![EntryRequest {
        product_id: ProductId::new("BTC-USD"),
        price: dec!(50000),
        qty: dec!(0.6),
    }];
    orchestrator
        .submit_coordinated_entries(oversized, 1)
        .await
        .unwrap();

    let err = orchestrator
        .submit_coordinated_entries(three_entries(), 2)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("risk limits violated"));

    // the whole batch was rejected atomically: only the first order exists
    let status = orchestrator.portfolio_status().await;
    assert_eq!(status.metrics.active_positions, 1);
}

#[tokio::test]
async fn test_unregistered_pair_is_skipped() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let entries = vec![EntryRequest {
        product_id: ProductId::new("DOGE-USD"),
        price: dec!(0.1),
        qty: dec!(100),
    }];
    let order_ids = orchestrator
        .submit_coordinated_entries(entries, 1)
        .await
        .unwrap();
    assert!(order_ids.is_empty());
}

// =============================================================================
// Signal fan-out
// =============================================================================

#[tokio::test]
async fn test_check_all_entries_treats_errors_as_no_signal() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let signals = orchestrator
        .check_all_entries(|product_id: String| async move {
            match product_id.as_str() {
                "BTC-USD" => Ok(EntrySignal {
                    should_buy: true,
                    price: Some(dec!(50000)),
                    qty: Some(dec!(0.1)),
                }),
                "ETH-USD" => anyhow::bail!("feed offline"),
                _ => Ok(EntrySignal::default()),
            }
        })
        .await;

    assert_eq!(signals.len(), 3);
    assert!(signals["BTC-USD"].should_buy);
    assert!(!signals["ETH-USD"].should_buy);
    assert!(!signals["SOL-USD"].should_buy);
}

// =============================================================================
// Price routing and liquidation
// =============================================================================

#[tokio::test]
async fn test_price_update_routes_to_owning_engine() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 3)
        .await
        .unwrap();
    let btc_engine = orchestrator.engine("BTC-USD").unwrap();
    btc_engine
        .handle_fill(&order_ids["BTC-USD"], dec!(0.1), dec!(50000))
        .await
        .unwrap();

    orchestrator
        .handle_price_update("BTC-USD", dec!(60000))
        .await
        .unwrap();

    // only the BTC engine ratcheted
    let pos = btc_engine.current_position().await.unwrap();
    assert_eq!(pos.current_stop_trigger, Some(dec!(58800)));
    assert!(orchestrator
        .engine("ETH-USD")
        .unwrap()
        .current_position()
        .await
        .is_none());
}

#[tokio::test]
async fn test_loss_floor_marks_position_liquidated() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 3)
        .await
        .unwrap();
    orchestrator
        .engine("BTC-USD")
        .unwrap()
        .handle_fill(&order_ids["BTC-USD"], dec!(0.1), dec!(50000))
        .await
        .unwrap();

    // -12% breaches the default -10% floor
    orchestrator
        .handle_price_update("BTC-USD", dec!(44000))
        .await
        .unwrap();

    let status = orchestrator.portfolio_status().await;
    assert_eq!(status.metrics.active_positions, 3);
    // the mark shows up when the pair is liquidated
    let summary = orchestrator
        .emergency_liquidate_pair("BTC-USD", dec!(44000))
        .await
        .unwrap();
    assert_eq!(summary.closed_count, 1);
    assert_eq!(summary.total_pnl, dec!(-600));
}

#[tokio::test]
async fn test_emergency_liquidate_pair_cancels_stop() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 3)
        .await
        .unwrap();
    let btc_engine = orchestrator.engine("BTC-USD").unwrap();
    btc_engine
        .handle_fill(&order_ids["BTC-USD"], dec!(0.1), dec!(50000))
        .await
        .unwrap();
    let stop_id = btc_engine
        .current_position()
        .await
        .unwrap()
        .stop_order_id
        .unwrap();

    let summary = orchestrator
        .emergency_liquidate_pair("BTC-USD", dec!(49000))
        .await
        .unwrap();

    assert_eq!(summary.closed_count, 1);
    assert_eq!(venue.order(&stop_id).unwrap().status, "cancelled");
    assert!(btc_engine.current_position().await.is_none());
    let persisted = store.load_position("BTC-USD").unwrap().unwrap();
    assert_eq!(persisted.qty_filled, Decimal::ZERO);
}

#[tokio::test]
async fn test_emergency_liquidate_portfolio_tolerates_missing_prices() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = Arc::new(three_pair_orchestrator(&venue, &store).await);

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 3)
        .await
        .unwrap();
    for (product_id, price, qty) in [
        ("BTC-USD", dec!(50000), dec!(0.1)),
        ("ETH-USD", dec!(2000), dec!(2)),
    ] {
        orchestrator
            .engine(product_id)
            .unwrap()
            .handle_fill(&order_ids[product_id], qty, price)
            .await
            .unwrap();
    }

    // SOL price unknown: that pair is skipped, the others close
    let mut prices = HashMap::new();
    prices.insert("BTC-USD".to_string(), dec!(55000));
    prices.insert("ETH-USD".to_string(), dec!(1900));

    let summary = orchestrator.emergency_liquidate_portfolio(prices).await;
    assert_eq!(summary.closed_count, 2);
    // +500 on BTC, -200 on ETH
    assert_eq!(summary.total_pnl, dec!(300));

    let status = orchestrator.portfolio_status().await;
    assert_eq!(status.metrics.active_positions, 1);
    assert_eq!(status.metrics.realized_pnl, dec!(300));
}

#[tokio::test]
async fn test_liquidated_positions_marked_in_history() {
    let venue = Arc::new(InMemoryVenue::new());
    let store = SqliteStore::open_in_memory().unwrap();
    let orchestrator = three_pair_orchestrator(&venue, &store).await;

    let order_ids = orchestrator
        .submit_coordinated_entries(three_entries(), 3)
        .await
        .unwrap();
    orchestrator
        .engine("BTC-USD")
        .unwrap()
        .handle_fill(&order_ids["BTC-USD"], dec!(0.1), dec!(50000))
        .await
        .unwrap();

    orchestrator
        .emergency_liquidate_pair("BTC-USD", dec!(45000))
        .await
        .unwrap();

    let status = orchestrator.portfolio_status().await;
    assert_eq!(status.metrics.closed_positions, 1);
    // losses realized through forced exit count against the win rate
    assert_eq!(status.metrics.win_rate_pct, Decimal::ZERO);
}
