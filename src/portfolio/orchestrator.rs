//! Multi-pair orchestration
//!
//! Composes one [`ExecutionEngine`] per registered pair behind a single
//! [`PortfolioManager`]. Coordinated entries go through a risk check and a
//! bounded-concurrency semaphore so a burst of signals cannot starve the
//! rate-limit governor; emergency liquidation fans out per pair and tolerates
//! individual failures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::manager::{
    PairConfig, PortfolioConfig, PortfolioManager, PortfolioMetrics, PositionStatus,
    RebalanceAction, RiskViolation,
};
use crate::engine::ExecutionEngine;
use crate::position::PositionState;
use crate::types::ProductId;

/// An entry signal for one pair
#[derive(Debug, Clone, Default)]
pub struct EntrySignal {
    pub should_buy: bool,
    pub price: Option<Decimal>,
    pub qty: Option<Decimal>,
}

/// One pair's entry parameters for a coordinated batch
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub product_id: ProductId,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Summary returned by portfolio-wide liquidation
#[derive(Debug, Clone, Default)]
pub struct LiquidationSummary {
    pub total_pnl: Decimal,
    pub closed_count: usize,
}

/// Current portfolio view for operators and the runtime loop
#[derive(Debug, Clone)]
pub struct PortfolioStatus {
    pub metrics: PortfolioMetrics,
    pub risk_violations: Vec<RiskViolation>,
    pub rebalance_actions: Vec<RebalanceAction>,
    pub pairs_registered: usize,
}

/// Replicates the per-pair engine across products under one capital pool.
pub struct MultiPairOrchestrator {
    manager: Arc<Mutex<PortfolioManager>>,
    engines: HashMap<String, Arc<ExecutionEngine>>,
    entry_counter: Mutex<u64>,
}

impl MultiPairOrchestrator {
    pub fn new(portfolio_config: PortfolioConfig) -> Self {
        Self {
            manager: Arc::new(Mutex::new(PortfolioManager::new(portfolio_config))),
            engines: HashMap::new(),
            entry_counter: Mutex::new(0),
        }
    }

    /// Register a pair and the engine that trades it.
    pub async fn register_pair(
        &mut self,
        pair: PairConfig,
        engine: Arc<ExecutionEngine>,
    ) -> Result<()> {
        let product_id = pair.product_id.clone();
        self.manager.lock().await.register_pair(pair)?;
        self.engines.insert(product_id, engine);
        Ok(())
    }

    pub fn engine(&self, product_id: &str) -> Option<&Arc<ExecutionEngine>> {
        self.engines.get(product_id)
    }

    pub fn product_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `startup_reconcile` on every engine. Per-pair failures are logged
    /// and do not stop the sweep.
    pub async fn reconcile_all(&self) {
        for (product_id, engine) in &self.engines {
            if let Err(e) = engine.startup_reconcile().await {
                warn!("Reconcile failed for {product_id}: {e:#}");
            }
        }
    }

    /// Run the stop-timeout watchdog check on every engine.
    pub async fn check_stop_timeouts(&self) {
        for (product_id, engine) in &self.engines {
            if let Err(e) = engine.check_stop_timeout().await {
                warn!("Stop-timeout check failed for {product_id}: {e:#}");
            }
        }
    }

    /// Fan an entry-signal probe out across all pairs concurrently.
    ///
    /// A pair whose probe errors counts as "no signal"; the batch never
    /// fails as a whole.
    pub async fn check_all_entries<F, Fut>(&self, signal_fn: F) -> HashMap<String, EntrySignal>
    where
        F: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<EntrySignal>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for product_id in self.engines.keys().cloned() {
            let probe = signal_fn.clone();
            tasks.spawn(async move {
                let result = probe(product_id.clone()).await;
                (product_id, result)
            });
        }

        let mut signals = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((product_id, Ok(signal))) => {
                    signals.insert(product_id, signal);
                }
                Ok((product_id, Err(e))) => {
                    warn!("Signal probe failed for {product_id}, treating as no-signal: {e:#}");
                    signals.insert(product_id, EntrySignal::default());
                }
                Err(e) => warn!("Signal probe task panicked: {e}"),
            }
        }
        signals
    }

    /// Submit a batch of entries with bounded concurrency.
    ///
    /// The whole batch is rejected atomically when any portfolio risk limit
    /// is currently violated. Individual placement failures are logged and
    /// skipped; successes are tracked in the portfolio and returned as a
    /// `product_id -> order_id` map.
    pub async fn submit_coordinated_entries(
        &self,
        entries: Vec<EntryRequest>,
        max_concurrent: usize,
    ) -> Result<HashMap<String, String>> {
        {
            let manager = self.manager.lock().await;
            let violations = manager.check_risk_limits();
            if !violations.is_empty() {
                let detail: Vec<String> =
                    violations.iter().map(|v| v.detail.clone()).collect();
                bail!("Portfolio risk limits violated: {}", detail.join("; "));
            }
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for entry in entries {
            let engine = match self.engines.get(entry.product_id.as_str()) {
                Some(engine) => Arc::clone(engine),
                None => {
                    warn!("No engine registered for {}, skipping entry", entry.product_id);
                    continue;
                }
            };
            let position_id = self.next_position_id(entry.product_id.as_str()).await;
            let manager = Arc::clone(&self.manager);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");

                let order_id = engine
                    .submit_entry(&position_id, entry.price, entry.qty)
                    .await?;

                // provisional tracking at the submitted price; fills refine it
                let state = PositionState::new(entry.price, entry.qty);
                manager
                    .lock()
                    .await
                    .add_position(&position_id, &entry.product_id, state)?;

                Ok::<(String, String), anyhow::Error>((
                    entry.product_id.as_str().to_string(),
                    order_id,
                ))
            });
        }

        let mut order_ids = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((product_id, order_id))) => {
                    order_ids.insert(product_id, order_id);
                }
                Ok(Err(e)) => warn!("Coordinated entry failed: {e:#}"),
                Err(e) => warn!("Coordinated entry task panicked: {e}"),
            }
        }

        info!(
            "Coordinated entries submitted | placed={} ",
            order_ids.len()
        );
        Ok(order_ids)
    }

    /// Route a trade price to the owning engine and refresh portfolio P&L.
    pub async fn handle_price_update(&self, product_id: &str, last_price: Decimal) -> Result<()> {
        let Some(engine) = self.engines.get(product_id) else {
            return Ok(());
        };

        {
            let mut manager = self.manager.lock().await;
            let tracked = manager.positions_for_product(product_id);
            for pos in tracked {
                if pos.status == PositionStatus::Active {
                    let state = engine
                        .current_position()
                        .await
                        .unwrap_or_else(|| pos.state.clone());
                    manager.update_position(&pos.position_id, state, Some(last_price))?;
                }
            }
        }

        engine.on_trade(last_price).await
    }

    /// Cancel a pair's open orders and close its active positions at `price`.
    pub async fn emergency_liquidate_pair(
        &self,
        product_id: &str,
        price: Decimal,
    ) -> Result<LiquidationSummary> {
        let engine = self
            .engines
            .get(product_id)
            .with_context(|| format!("No engine registered for {product_id}"))?;
        Self::liquidate_pair(
            Arc::clone(engine),
            Arc::clone(&self.manager),
            product_id.to_string(),
            price,
        )
        .await
    }

    /// Liquidate every pair with a known price, concurrently. Failures in
    /// one pair do not halt the others.
    pub async fn emergency_liquidate_portfolio(
        &self,
        prices: HashMap<String, Decimal>,
    ) -> LiquidationSummary {
        let mut tasks = JoinSet::new();
        for (product_id, price) in prices {
            let Some(engine) = self.engines.get(&product_id) else {
                continue;
            };
            tasks.spawn(Self::liquidate_pair(
                Arc::clone(engine),
                Arc::clone(&self.manager),
                product_id,
                price,
            ));
        }

        let mut total = LiquidationSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(summary)) => {
                    total.total_pnl += summary.total_pnl;
                    total.closed_count += summary.closed_count;
                }
                Ok(Err(e)) => warn!("Pair liquidation failed: {e:#}"),
                Err(e) => warn!("Pair liquidation task panicked: {e}"),
            }
        }
        total
    }

    async fn liquidate_pair(
        engine: Arc<ExecutionEngine>,
        manager: Arc<Mutex<PortfolioManager>>,
        product_id: String,
        price: Decimal,
    ) -> Result<LiquidationSummary> {
        let to_close: Vec<String> = {
            let manager = manager.lock().await;
            manager
                .positions_for_product(&product_id)
                .into_iter()
                .map(|p| p.position_id)
                .collect()
        };

        engine.emergency_exit(price).await?;

        let mut summary = LiquidationSummary::default();
        let mut manager = manager.lock().await;
        for position_id in to_close {
            match manager.liquidate_position(&position_id, price) {
                Ok(realized) => {
                    summary.total_pnl += realized;
                    summary.closed_count += 1;
                    info!(
                        "Position liquidated | position_id={} exit_price={} realized_pnl={}",
                        position_id, price, realized
                    );
                }
                Err(e) => warn!("Failed to close {position_id} in portfolio: {e:#}"),
            }
        }
        Ok(summary)
    }

    /// Metrics, current risk violations and pending rebalance actions.
    pub async fn portfolio_status(&self) -> PortfolioStatus {
        let manager = self.manager.lock().await;
        PortfolioStatus {
            metrics: manager.metrics(),
            risk_violations: manager.check_risk_limits(),
            rebalance_actions: manager.rebalance_actions(),
            pairs_registered: self.engines.len(),
        }
    }

    async fn next_position_id(&self, product_id: &str) -> String {
        let mut counter = self.entry_counter.lock().await;
        let id = format!("{product_id}-{}", *counter);
        *counter += 1;
        id
    }
}
