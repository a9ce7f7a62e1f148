//! Order state machine for the entry and stop lifecycle
//!
//! Tracks the entry limit order through its fills and owns the resulting
//! [`PositionState`]. The execution engine drives this state machine and is
//! responsible for persistence and venue calls; nothing in here does I/O.
//!
//! Entry order: `New -> Open -> PartiallyFilled -> Filled` (or `Cancelled`).
//! Stop order: `Open -> Triggered` (or `Cancelled`). Terminal states are sinks.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::PositionState;
use crate::types::Side;

/// Order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Created locally, not yet acknowledged
    New,
    /// Acknowledged by the venue and working
    Open,
    /// Some fills received
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled by the engine or the venue
    Cancelled,
    /// Stop order fired
    Triggered,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::New => "new",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Triggered => "triggered",
        }
    }
}

/// A single venue order tracked by the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    /// Cumulative fill quantity (may be less than qty)
    pub filled: Decimal,
    pub state: OrderState,
}

#[derive(Debug, Error)]
pub enum OrderStateError {
    /// A fill arrived for an order the machine does not know about.
    /// This indicates a bug upstream; the operation is aborted.
    #[error("unknown order id: {0}")]
    UnknownOrder(String),

    #[error("no active position")]
    NoPosition,
}

/// Couples the entry order lifecycle to the position's trailing stop.
///
/// Responsibilities:
/// - track the entry limit order through fills,
/// - create and update the [`PositionState`] as fills arrive,
/// - surface stop replacement intents via [`Self::on_trade`],
/// - compute aggressive replacements for timed-out stops.
#[derive(Debug, Default)]
pub struct OrderStateMachine {
    pub entry_order: Option<Order>,
    pub position: Option<PositionState>,
}

impl OrderStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a limit buy entry order in `Open`.
    pub fn place_entry(&mut self, order_id: &str, price: Decimal, qty: Decimal) -> &Order {
        self.entry_order = Some(Order {
            order_id: order_id.to_string(),
            side: Side::Buy,
            price,
            qty,
            filled: Decimal::ZERO,
            state: OrderState::Open,
        });
        self.entry_order.as_ref().expect("just set")
    }

    /// Apply a fill to the entry order.
    ///
    /// On the first fill a [`PositionState`] is created with the fill price as
    /// both entry and high-water mark. Subsequent fills increase `qty_filled`
    /// and move `entry_price` to the quantity-weighted average (fees are not
    /// modelled here).
    pub fn on_fill(
        &mut self,
        order_id: &str,
        filled_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<(), OrderStateError> {
        let entry = match self.entry_order.as_mut() {
            Some(o) if o.order_id == order_id => o,
            _ => return Err(OrderStateError::UnknownOrder(order_id.to_string())),
        };

        entry.filled += filled_qty;
        entry.state = if entry.filled < entry.qty {
            OrderState::PartiallyFilled
        } else {
            OrderState::Filled
        };

        match self.position.as_mut() {
            None => {
                self.position = Some(PositionState::new(fill_price, filled_qty));
            }
            Some(pos) => {
                let prev_qty = pos.qty_filled;
                let total_qty = prev_qty + filled_qty;
                pos.entry_price =
                    (pos.entry_price * prev_qty + fill_price * filled_qty) / total_qty;
                pos.qty_filled = total_qty;
            }
        }

        Ok(())
    }

    /// Handle a market trade; returns `(true, Some((trigger, limit)))` when
    /// the stop needs to be placed or replaced.
    pub fn on_trade(
        &mut self,
        last_trade_price: Decimal,
        trail_pct: Decimal,
        stop_limit_buffer_pct: Decimal,
        min_ratchet: Decimal,
    ) -> (bool, Option<(Decimal, Decimal)>) {
        let pos = match self.position.as_mut() {
            Some(p) => p,
            None => return (false, None),
        };

        let changed =
            pos.ratchet_stop(last_trade_price, trail_pct, stop_limit_buffer_pct, min_ratchet);
        if changed {
            let trigger = pos.current_stop_trigger.expect("set by ratchet");
            let limit = pos.current_stop_limit.expect("set by ratchet");
            (true, Some((trigger, limit)))
        } else {
            (false, None)
        }
    }

    /// Compute a tighter replacement stop for a timed-out order.
    ///
    /// Moves the trigger closer to the market, `aggressive_delta_pct` below the
    /// high-water mark, but never below the existing trigger. The limit sits
    /// `stop_limit_buffer_pct` below the chosen trigger.
    pub fn stop_timeout_replacement(
        &mut self,
        aggressive_delta_pct: Decimal,
        stop_limit_buffer_pct: Decimal,
    ) -> Result<(Decimal, Decimal), OrderStateError> {
        let pos = self.position.as_mut().ok_or(OrderStateError::NoPosition)?;

        let highest = pos.highest_price_since_entry;
        let mut new_trigger = highest * (Decimal::ONE - aggressive_delta_pct);
        if let Some(current) = pos.current_stop_trigger {
            if new_trigger <= current {
                new_trigger = current;
            }
        }

        let new_limit = new_trigger * (Decimal::ONE - stop_limit_buffer_pct);
        if new_trigger > pos.current_stop_trigger.unwrap_or(Decimal::ZERO) {
            pos.current_stop_trigger = Some(new_trigger);
            pos.current_stop_limit = Some(new_limit);
        }

        Ok((new_trigger, new_limit))
    }
}
