//! Per-pair execution engine
//!
//! Sequences venue calls against the persistent store for one trading pair:
//! entry submission, fill handling, stop ratcheting, stop-timeout
//! replacement, and startup reconciliation. A per-position async lock
//! serialises fills, trade events and timeout checks, so a fill is fully
//! processed and persisted before the next trade event observes the position.
//!
//! Durability rule: any state the engine will later rely on to *not* place a
//! stop is persisted before that decision can be acted on. A failed store
//! write abandons the in-memory transition where no venue call happened yet;
//! after a successful venue call, memory stays aligned with the venue and the
//! write error is surfaced for the caller to retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::order_state::{OrderState, OrderStateMachine};
use crate::position::PositionState;
use crate::store::{OrderKind, OrderRecord, SqliteStore};
use crate::types::{ProductId, Side};
use crate::venue::VenueAdapter;

/// Stop management parameters for one pair
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Fractional distance between the high-water mark and the stop trigger
    pub trail_pct: Decimal,
    /// Fractional distance between trigger and limit
    pub stop_limit_buffer_pct: Decimal,
    /// Minimum fractional trigger improvement worth a cancel/replace round-trip
    pub min_ratchet: Decimal,
    /// How long a stop may rest unfilled before aggressive replacement
    pub stop_timeout: Duration,
    /// Tighter trailing fraction used for timed-out stops
    pub aggressive_delta_pct: Decimal,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            trail_pct: dec!(0.02),
            stop_limit_buffer_pct: dec!(0.005),
            min_ratchet: dec!(0.001),
            stop_timeout: Duration::from_secs(300),
            aggressive_delta_pct: dec!(0.005),
        }
    }
}

struct EngineState {
    osm: OrderStateMachine,
    /// When the live stop order was placed, for the timeout watchdog
    stop_placed_at: Option<Instant>,
}

/// Orchestrates one pair's order lifecycle against the venue and the store.
pub struct ExecutionEngine {
    product_id: ProductId,
    position_id: String,
    adapter: Arc<dyn VenueAdapter>,
    store: SqliteStore,
    params: EngineParams,
    state: Mutex<EngineState>,
}

impl ExecutionEngine {
    pub fn new(
        product_id: ProductId,
        adapter: Arc<dyn VenueAdapter>,
        store: SqliteStore,
        params: EngineParams,
    ) -> Self {
        let position_id = product_id.as_str().to_string();
        Self {
            product_id,
            position_id,
            adapter,
            store,
            params,
            state: Mutex::new(EngineState {
                osm: OrderStateMachine::new(),
                stop_placed_at: None,
            }),
        }
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn position_id(&self) -> &str {
        &self.position_id
    }

    /// Snapshot of the current position, if any.
    pub async fn current_position(&self) -> Option<PositionState> {
        self.state.lock().await.osm.position.clone()
    }

    /// Re-align persisted state with the venue's view of the stop order.
    ///
    /// Runs once before serving events and again on every periodic reconcile
    /// cycle. Never aborts: venue failures are logged and retried on the next
    /// cycle.
    pub async fn startup_reconcile(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let loaded = self.load_position_blocking().await?;
        let Some(pos) = loaded else {
            return Ok(());
        };
        if !pos.is_open() {
            // position already closed; nothing to serve
            state.osm.position = None;
            return Ok(());
        }
        state.osm.position = Some(pos);

        let stop_id = state
            .osm
            .position
            .as_ref()
            .and_then(|p| p.stop_order_id.clone());

        if let Some(stop_id) = stop_id {
            match self.adapter.get_order_status(&stop_id).await {
                Ok(Some(status)) if status.is_live() => {
                    if state.stop_placed_at.is_none() {
                        state.stop_placed_at = Some(Instant::now());
                    }
                    debug!("Reconcile: stop {} still live at venue", stop_id);
                }
                Ok(Some(status)) if status.is_triggered() => {
                    info!(
                        "Reconcile: stop {} fired while offline, closing position {}",
                        stop_id, self.position_id
                    );
                    let pos = state.osm.position.as_mut().expect("set above");
                    let exit_price = pos.current_stop_limit.unwrap_or(pos.entry_price);
                    let qty = pos.qty_filled;
                    pos.qty_filled = Decimal::ZERO;
                    pos.stop_order_id = None;
                    let closed = pos.clone();

                    if let Err(e) = self.persist_position(&closed).await {
                        warn!("Reconcile: failed to persist closed position: {e:#}");
                        return Ok(());
                    }
                    self.save_order_best_effort(OrderRecord::new(
                        &stop_id,
                        &self.position_id,
                        OrderKind::Stop,
                        Side::Sell,
                        exit_price,
                        qty,
                        OrderState::Triggered,
                    ))
                    .await;
                    state.osm.position = None;
                    state.stop_placed_at = None;
                    return Ok(());
                }
                Ok(_) => {
                    // unknown, cancelled or done: the recorded stop no longer protects us
                    info!(
                        "Reconcile: stop {} no longer live, clearing and replacing",
                        stop_id
                    );
                    let pos = state.osm.position.as_mut().expect("set above");
                    pos.stop_order_id = None;
                    state.stop_placed_at = None;
                    let snapshot = state.osm.position.as_ref().expect("set above").clone();
                    if let Err(e) = self.persist_position(&snapshot).await {
                        warn!("Reconcile: failed to persist cleared stop id: {e:#}");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!("Reconcile: venue status check failed, retrying next cycle: {e}");
                    return Ok(());
                }
            }
        }

        // place a replacement stop if levels exist but no live order does
        let needs_stop = state.osm.position.as_ref().is_some_and(|p| {
            p.stop_order_id.is_none()
                && p.current_stop_trigger.is_some()
                && p.current_stop_limit.is_some()
                && p.is_open()
        });
        if needs_stop {
            let pos = state.osm.position.as_ref().expect("checked").clone();
            let trigger = pos.current_stop_trigger.expect("checked");
            let limit = pos.current_stop_limit.expect("checked");
            match self
                .adapter
                .place_stop_limit(
                    self.product_id.as_str(),
                    "reconcile",
                    trigger,
                    limit,
                    pos.qty_filled,
                )
                .await
            {
                Ok(new_oid) => {
                    info!(
                        "Reconcile: replacement stop placed | stop_order_id={} trigger={} limit={}",
                        new_oid, trigger, limit
                    );
                    let pos_mut = state.osm.position.as_mut().expect("checked");
                    pos_mut.stop_order_id = Some(new_oid.clone());
                    let updated = pos_mut.clone();
                    state.stop_placed_at = Some(Instant::now());
                    if let Err(e) = self.persist_position(&updated).await {
                        warn!("Reconcile: failed to persist replacement stop id: {e:#}");
                    }
                    self.save_order_best_effort(OrderRecord::new(
                        &new_oid,
                        &self.position_id,
                        OrderKind::Stop,
                        Side::Sell,
                        limit,
                        updated.qty_filled,
                        OrderState::Open,
                    ))
                    .await;
                }
                Err(e) => {
                    warn!("Reconcile: failed to place replacement stop, retrying next cycle: {e}");
                }
            }
        }

        Ok(())
    }

    /// Place a limit buy entry and record it.
    ///
    /// The caller supplies a deterministic `client_id` per signal so a retry
    /// of the same signal cannot double-submit.
    pub async fn submit_entry(
        &self,
        client_id: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String> {
        let mut state = self.state.lock().await;

        let order_id = self
            .adapter
            .place_limit_buy(self.product_id.as_str(), client_id, price, qty)
            .await
            .context("Entry placement failed")?;

        state.osm.place_entry(&order_id, price, qty);
        info!(
            "Entry order placed | product={} order_id={} price={} qty={}",
            self.product_id, order_id, price, qty
        );

        self.persist_order(OrderRecord::new(
            &order_id,
            &self.position_id,
            OrderKind::Entry,
            Side::Buy,
            price,
            qty,
            OrderState::Open,
        ))
        .await?;

        Ok(order_id)
    }

    /// Apply an entry fill: update the order, create or grow the position,
    /// set the initial stop, persist.
    pub async fn handle_fill(
        &self,
        order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let snapshot_pos = state.osm.position.clone();
        let snapshot_entry = state.osm.entry_order.clone();

        state.osm.on_fill(order_id, filled_qty, fill_price)?;
        info!(
            "Order filled | order_id={} filled_qty={} fill_price={}",
            order_id, filled_qty, fill_price
        );

        // initial stop levels come from the first observed price
        let pos_after_fill = {
            let pos = state.osm.position.as_mut().expect("fill creates position");
            pos.ratchet_stop(
                fill_price,
                self.params.trail_pct,
                self.params.stop_limit_buffer_pct,
                self.params.min_ratchet,
            );
            pos.clone()
        };

        // commit the fill before acting on it
        if let Err(e) = self.persist_position(&pos_after_fill).await {
            state.osm.position = snapshot_pos;
            state.osm.entry_order = snapshot_entry;
            return Err(e.context("Fill not persisted; transition abandoned"));
        }

        if let Some(entry) = state.osm.entry_order.clone() {
            self.save_order_best_effort(OrderRecord::new(
                &entry.order_id,
                &self.position_id,
                OrderKind::Entry,
                Side::Buy,
                entry.price,
                entry.qty,
                entry.state,
            ))
            .await;
        }

        // place the initial stop if none is live yet
        let needs_stop =
            pos_after_fill.current_stop_trigger.is_some() && pos_after_fill.stop_order_id.is_none();
        if needs_stop {
            let trigger = pos_after_fill.current_stop_trigger.expect("checked");
            let limit = pos_after_fill.current_stop_limit.expect("checked");
            match self
                .adapter
                .place_stop_limit(
                    self.product_id.as_str(),
                    order_id,
                    trigger,
                    limit,
                    pos_after_fill.qty_filled,
                )
                .await
            {
                Ok(stop_oid) => {
                    info!(
                        "Stop order placed | stop_order_id={} trigger={} limit={}",
                        stop_oid, trigger, limit
                    );
                    let pos = state.osm.position.as_mut().expect("checked");
                    pos.stop_order_id = Some(stop_oid.clone());
                    let updated = pos.clone();
                    state.stop_placed_at = Some(Instant::now());
                    if let Err(e) = self.persist_position(&updated).await {
                        warn!("Failed to persist stop id; reconcile will re-align: {e:#}");
                    }
                    self.save_order_best_effort(OrderRecord::new(
                        &stop_oid,
                        &self.position_id,
                        OrderKind::Stop,
                        Side::Sell,
                        limit,
                        updated.qty_filled,
                        OrderState::Open,
                    ))
                    .await;
                }
                Err(e) => {
                    // position is persisted with levels and no stop id, so the
                    // next reconcile cycle places it
                    warn!("Initial stop placement failed, reconcile will retry: {e}");
                }
            }
        }

        Ok(())
    }

    /// React to a market trade: ratchet the stop and replace it at the venue
    /// when the trigger improves.
    pub async fn on_trade(&self, last_trade_price: Decimal) -> Result<()> {
        let mut state = self.state.lock().await;

        let snapshot = state.osm.position.clone();
        let (changed, stop) = state.osm.on_trade(
            last_trade_price,
            self.params.trail_pct,
            self.params.stop_limit_buffer_pct,
            self.params.min_ratchet,
        );
        if !changed {
            return Ok(());
        }
        let (trigger, limit) = stop.expect("set when changed");
        info!(
            "Stop ratcheted | product={} last_trade={} new_trigger={} new_limit={}",
            self.product_id, last_trade_price, trigger, limit
        );

        let old_oid = state
            .osm
            .position
            .as_ref()
            .and_then(|p| p.stop_order_id.clone());

        match self.replace_stop(&mut state, old_oid, trigger, limit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // a failed replacement leaves the ratcheted levels persisted so
                // reconcile can finish the job; a failed persist rolls back
                if let Err(persist_err) = self
                    .persist_after_failed_place(&mut state, snapshot)
                    .await
                {
                    return Err(persist_err);
                }
                warn!("Stop replacement failed, will retry: {e:#}");
                Ok(())
            }
        }
    }

    /// Replace the live stop with a tighter one after it sat unfilled past
    /// the timeout (thin liquidity).
    pub async fn handle_stop_timeout(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.replace_timed_out_stop(&mut state).await
    }

    /// Watchdog hook: replace the stop only if it has been live longer than
    /// the configured timeout.
    pub async fn check_stop_timeout(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let expired = state
            .stop_placed_at
            .is_some_and(|placed| placed.elapsed() > self.params.stop_timeout)
            && state
                .osm
                .position
                .as_ref()
                .is_some_and(|p| p.stop_order_id.is_some() && p.is_open());
        if !expired {
            return Ok(());
        }
        self.replace_timed_out_stop(&mut state).await
    }

    /// Cancel open orders and close the position at `price` without waiting
    /// for the stop to fire. Used by emergency liquidation.
    pub async fn emergency_exit(&self, price: Decimal) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.osm.entry_order.clone() {
            if matches!(entry.state, OrderState::Open | OrderState::PartiallyFilled) {
                match self.adapter.cancel_order(&entry.order_id).await {
                    Ok(_) => {
                        if let Some(o) = state.osm.entry_order.as_mut() {
                            o.state = OrderState::Cancelled;
                        }
                        self.save_order_best_effort(OrderRecord::new(
                            &entry.order_id,
                            &self.position_id,
                            OrderKind::Entry,
                            Side::Buy,
                            entry.price,
                            entry.qty,
                            OrderState::Cancelled,
                        ))
                        .await;
                    }
                    Err(e) => warn!("Failed to cancel entry {}: {e}", entry.order_id),
                }
            }
        }

        let Some(pos) = state.osm.position.clone() else {
            return Ok(());
        };
        if !pos.is_open() {
            return Ok(());
        }

        if let Some(stop_id) = &pos.stop_order_id {
            match self.adapter.cancel_order(stop_id).await {
                Ok(_) => {
                    self.save_order_best_effort(OrderRecord::new(
                        stop_id,
                        &self.position_id,
                        OrderKind::Stop,
                        Side::Sell,
                        pos.current_stop_limit.unwrap_or(price),
                        pos.qty_filled,
                        OrderState::Cancelled,
                    ))
                    .await;
                }
                Err(e) => warn!("Failed to cancel stop {}: {e}", stop_id),
            }
        }

        let qty = pos.qty_filled;
        let pos_mut = state.osm.position.as_mut().expect("checked");
        pos_mut.qty_filled = Decimal::ZERO;
        pos_mut.stop_order_id = None;
        let closed = pos_mut.clone();
        self.persist_position(&closed).await?;

        let exit_id = format!(
            "force-exit-{}-{}",
            self.position_id,
            chrono::Utc::now().timestamp_millis()
        );
        self.save_order_best_effort(OrderRecord::new(
            &exit_id,
            &self.position_id,
            OrderKind::ForceExit,
            Side::Sell,
            price,
            qty,
            OrderState::Filled,
        ))
        .await;

        state.osm.position = None;
        state.stop_placed_at = None;
        info!(
            "Position force-closed | product={} qty={} price={}",
            self.product_id, qty, price
        );
        Ok(())
    }

    async fn replace_timed_out_stop(
        &self,
        state: &mut tokio::sync::MutexGuard<'_, EngineState>,
    ) -> Result<()> {
        let old_trigger = state
            .osm
            .position
            .as_ref()
            .and_then(|p| p.current_stop_trigger);
        let (trigger, limit) = state.osm.stop_timeout_replacement(
            self.params.aggressive_delta_pct,
            self.params.stop_limit_buffer_pct,
        )?;
        warn!(
            "Stop timeout | product={} old_trigger={:?} new_trigger={}",
            self.product_id, old_trigger, trigger
        );

        let old_oid = state
            .osm
            .position
            .as_ref()
            .and_then(|p| p.stop_order_id.clone());
        self.replace_stop(state, old_oid, trigger, limit).await
    }

    /// Cancel-then-place. Cancellation is best effort: a failure is logged
    /// and the new stop goes in regardless; both may briefly coexist until
    /// reconciliation cleans up.
    async fn replace_stop(
        &self,
        state: &mut tokio::sync::MutexGuard<'_, EngineState>,
        old_oid: Option<String>,
        trigger: Decimal,
        limit: Decimal,
    ) -> Result<()> {
        if let Some(old) = &old_oid {
            match self.adapter.cancel_order(old).await {
                Ok(true) => {
                    debug!("Old stop cancelled | stop_order_id={}", old);
                    if let Some(pos) = state.osm.position.as_ref() {
                        self.save_order_best_effort(OrderRecord::new(
                            old,
                            &self.position_id,
                            OrderKind::Stop,
                            Side::Sell,
                            pos.current_stop_limit.unwrap_or(limit),
                            pos.qty_filled,
                            OrderState::Cancelled,
                        ))
                        .await;
                    }
                }
                Ok(false) => {
                    warn!("Venue rejected cancel of stop {}, continuing with replacement", old)
                }
                Err(e) => warn!("Cancel of stop {} failed, continuing with replacement: {e}", old),
            }
        }

        let qty = state
            .osm
            .position
            .as_ref()
            .map(|p| p.qty_filled)
            .unwrap_or(Decimal::ZERO);
        let client_id = old_oid.as_deref().unwrap_or("stop");

        let new_oid = self
            .adapter
            .place_stop_limit(self.product_id.as_str(), client_id, trigger, limit, qty)
            .await
            .context("Stop placement failed")?;

        let pos = state
            .osm
            .position
            .as_mut()
            .context("Position vanished during stop replacement")?;
        pos.stop_order_id = Some(new_oid.clone());
        state.stop_placed_at = Some(Instant::now());
        let updated = state.osm.position.as_ref().expect("just set").clone();

        self.persist_position(&updated).await?;
        info!(
            "Stop replaced | stop_order_id={} trigger={} limit={}",
            new_oid, trigger, limit
        );
        self.save_order_best_effort(OrderRecord::new(
            &new_oid,
            &self.position_id,
            OrderKind::Stop,
            Side::Sell,
            limit,
            qty,
            OrderState::Open,
        ))
        .await;
        Ok(())
    }

    /// After a failed placement the ratcheted levels stay in memory with no
    /// stop id, and that state is persisted so reconciliation can finish the
    /// replacement. A failed persist rolls memory back to the snapshot.
    async fn persist_after_failed_place(
        &self,
        state: &mut tokio::sync::MutexGuard<'_, EngineState>,
        snapshot: Option<PositionState>,
    ) -> Result<()> {
        if let Some(pos) = state.osm.position.as_mut() {
            pos.stop_order_id = None;
        }
        state.stop_placed_at = None;
        let current = state.osm.position.clone();
        if let Some(pos) = current {
            if let Err(e) = self.persist_position(&pos).await {
                state.osm.position = snapshot;
                return Err(e.context("Ratchet not persisted; transition abandoned"));
            }
        }
        Ok(())
    }

    async fn load_position_blocking(&self) -> Result<Option<PositionState>> {
        let store = self.store.clone();
        let position_id = self.position_id.clone();
        tokio::task::spawn_blocking(move || store.load_position(&position_id))
            .await
            .context("Store worker panicked")?
    }

    async fn persist_position(&self, pos: &PositionState) -> Result<()> {
        let store = self.store.clone();
        let position_id = self.position_id.clone();
        let pos = pos.clone();
        tokio::task::spawn_blocking(move || store.save_position(&position_id, &pos))
            .await
            .context("Store worker panicked")?
    }

    async fn persist_order(&self, record: OrderRecord) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_order(&record))
            .await
            .context("Store worker panicked")?
    }

    async fn save_order_best_effort(&self, record: OrderRecord) {
        let order_id = record.order_id.clone();
        if let Err(e) = self.persist_order(record).await {
            warn!("Failed to persist order record {}: {e:#}", order_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::InMemoryVenue;

    fn engine_with(venue: Arc<InMemoryVenue>, params: EngineParams) -> ExecutionEngine {
        let store = SqliteStore::open_in_memory().unwrap();
        ExecutionEngine::new(ProductId::new("BTC-USD"), venue, store, params)
    }

    #[tokio::test]
    async fn test_submit_entry_records_order() {
        let venue = Arc::new(InMemoryVenue::new());
        let engine = engine_with(venue.clone(), EngineParams::default());

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        assert!(venue.order(&oid).is_some());
        assert!(engine.current_position().await.is_none());
    }

    #[tokio::test]
    async fn test_fill_places_initial_stop() {
        let venue = Arc::new(InMemoryVenue::new());
        let params = EngineParams {
            min_ratchet: Decimal::ZERO,
            ..EngineParams::default()
        };
        let engine = engine_with(venue.clone(), params);

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        engine.handle_fill(&oid, dec!(1), dec!(100)).await.unwrap();

        let pos = engine.current_position().await.unwrap();
        assert_eq!(pos.current_stop_trigger, Some(dec!(98)));
        assert_eq!(pos.current_stop_limit, Some(dec!(97.51)));
        let stop = venue.order(pos.stop_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(stop.kind, "stop_limit");
        assert_eq!(stop.stop_trigger, Some(dec!(98)));
    }

    #[tokio::test]
    async fn test_fill_unknown_order_is_rejected() {
        let venue = Arc::new(InMemoryVenue::new());
        let engine = engine_with(venue, EngineParams::default());
        assert!(engine.handle_fill("bogus", dec!(1), dec!(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_trade_ratchets_and_replaces() {
        let venue = Arc::new(InMemoryVenue::new());
        let params = EngineParams {
            min_ratchet: Decimal::ZERO,
            ..EngineParams::default()
        };
        let engine = engine_with(venue.clone(), params);

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        engine.handle_fill(&oid, dec!(1), dec!(100)).await.unwrap();
        let first_stop = engine
            .current_position()
            .await
            .unwrap()
            .stop_order_id
            .unwrap();

        engine.on_trade(dec!(120)).await.unwrap();

        let pos = engine.current_position().await.unwrap();
        assert_eq!(pos.current_stop_trigger, Some(dec!(117.6)));
        assert_eq!(pos.current_stop_limit, Some(dec!(117.012)));
        assert_ne!(pos.stop_order_id.as_ref().unwrap(), &first_stop);
        assert_eq!(venue.cancel_calls(), vec![first_stop]);
    }

    #[tokio::test]
    async fn test_downward_trade_is_a_no_op() {
        let venue = Arc::new(InMemoryVenue::new());
        let params = EngineParams {
            min_ratchet: Decimal::ZERO,
            ..EngineParams::default()
        };
        let engine = engine_with(venue.clone(), params);

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        engine.handle_fill(&oid, dec!(1), dec!(100)).await.unwrap();
        engine.on_trade(dec!(120)).await.unwrap();
        let stop_before = engine.current_position().await.unwrap().stop_order_id;

        engine.on_trade(dec!(115)).await.unwrap();

        let pos = engine.current_position().await.unwrap();
        assert_eq!(pos.current_stop_trigger, Some(dec!(117.6)));
        assert_eq!(pos.stop_order_id, stop_before);
    }

    #[tokio::test]
    async fn test_timeout_replacement_tightens() {
        let venue = Arc::new(InMemoryVenue::new());
        let params = EngineParams {
            min_ratchet: Decimal::ZERO,
            aggressive_delta_pct: dec!(0.005),
            ..EngineParams::default()
        };
        let engine = engine_with(venue.clone(), params);

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        engine.handle_fill(&oid, dec!(1), dec!(100)).await.unwrap();

        engine.handle_stop_timeout().await.unwrap();

        let pos = engine.current_position().await.unwrap();
        assert_eq!(pos.current_stop_trigger, Some(dec!(99.5)));
        // configured buffer applies to the replacement limit
        assert_eq!(pos.current_stop_limit, Some(dec!(99.0025)));
    }

    #[tokio::test]
    async fn test_emergency_exit_cancels_and_closes() {
        let venue = Arc::new(InMemoryVenue::new());
        let params = EngineParams {
            min_ratchet: Decimal::ZERO,
            ..EngineParams::default()
        };
        let engine = engine_with(venue.clone(), params);

        let oid = engine
            .submit_entry("sig-1", dec!(100), dec!(1))
            .await
            .unwrap();
        engine.handle_fill(&oid, dec!(1), dec!(100)).await.unwrap();
        let stop_id = engine
            .current_position()
            .await
            .unwrap()
            .stop_order_id
            .unwrap();

        engine.emergency_exit(dec!(95)).await.unwrap();

        assert!(engine.current_position().await.is_none());
        assert_eq!(venue.order(&stop_id).unwrap().status, "cancelled");
    }
}
