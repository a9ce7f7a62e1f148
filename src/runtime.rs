//! Runtime loop: periodic reconciliation, trade-price ingestion, and the
//! stop-timeout watchdog
//!
//! Three concurrent tasks run for the life of the process and exit
//! cooperatively when the shutdown signal flips: each loop drains its current
//! item, then returns. The caller closes the persistent store after the
//! loops have joined.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::portfolio::MultiPairOrchestrator;

/// One market trade observation from the external price source
#[derive(Debug, Clone)]
pub struct TradeTick {
    pub product_id: String,
    pub price: Decimal,
}

/// Cadence of the background loops
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often each engine re-reconciles against the venue
    pub reconcile_interval: Duration,
    /// How often stop ages are checked against the timeout
    pub timeout_check_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(5),
        }
    }
}

/// Create the shutdown signal pair. The sender side is flipped exactly once.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Drive the three runtime loops until shutdown.
///
/// Reconciliation runs once up front so no events are served against stale
/// state, then all loops run concurrently.
pub async fn run_loops(
    orchestrator: Arc<MultiPairOrchestrator>,
    trade_rx: mpsc::Receiver<TradeTick>,
    shutdown: watch::Receiver<bool>,
    config: RuntimeConfig,
) -> Result<()> {
    orchestrator.reconcile_all().await;
    info!(
        "Runtime started | pairs={} reconcile_interval={:?}",
        orchestrator.product_ids().len(),
        config.reconcile_interval
    );

    let reconcile = tokio::spawn(reconcile_loop(
        Arc::clone(&orchestrator),
        shutdown.clone(),
        config.reconcile_interval,
    ));
    let trades = tokio::spawn(trade_loop(
        Arc::clone(&orchestrator),
        trade_rx,
        shutdown.clone(),
    ));
    let watchdog = tokio::spawn(watchdog_loop(
        Arc::clone(&orchestrator),
        shutdown,
        config.timeout_check_interval,
    ));

    let (r1, r2, r3) = tokio::join!(reconcile, trades, watchdog);
    for result in [r1, r2, r3] {
        if let Err(e) = result {
            warn!("Runtime task panicked: {e}");
        }
    }

    info!("Runtime stopped");
    Ok(())
}

async fn reconcile_loop(
    orchestrator: Arc<MultiPairOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the caller already reconciled once at startup
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Periodic reconcile");
                orchestrator.reconcile_all().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn trade_loop(
    orchestrator: Arc<MultiPairOrchestrator>,
    mut trade_rx: mpsc::Receiver<TradeTick>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            tick = trade_rx.recv() => {
                match tick {
                    Some(tick) => {
                        if let Err(e) = orchestrator
                            .handle_price_update(&tick.product_id, tick.price)
                            .await
                        {
                            warn!("Trade handling failed for {}: {e:#}", tick.product_id);
                        }
                    }
                    None => {
                        info!("Trade source closed");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn watchdog_loop(
    orchestrator: Arc<MultiPairOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                orchestrator.check_stop_timeouts().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}
