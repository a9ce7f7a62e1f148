//! Position state tracking and trailing ratchet logic
//!
//! [`PositionState`] maintains the entry price, filled quantity, the running
//! high-water mark since entry, and the current stop trigger/limit pair. The
//! key invariant lives in [`PositionState::ratchet_stop`]: the stop trigger
//! only ever moves upward for the lifetime of a position, so risk shrinks
//! monotonically as price rises.
//!
//! All arithmetic uses `rust_decimal::Decimal`; serialization round-trips
//! decimals as strings so persisted state is exact.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tracks an active position with trailing stop levels.
///
/// Invariants:
/// - `highest_price_since_entry >= entry_price`
/// - `current_stop_trigger` is non-decreasing (ratchet-only)
/// - `current_stop_limit <= current_stop_trigger` whenever both are set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionState {
    /// Weighted average fill price for this position
    pub entry_price: Decimal,

    /// Cumulative filled quantity; zero means the position is closed
    pub qty_filled: Decimal,

    /// Highest trade price observed since entry
    pub highest_price_since_entry: Decimal,

    /// Current stop-loss trigger price (None until the first ratchet)
    pub current_stop_trigger: Option<Decimal>,

    /// Current stop-loss limit price (None until the first ratchet)
    pub current_stop_limit: Option<Decimal>,

    /// Venue order ID of the live stop order, if the engine believes one exists
    pub stop_order_id: Option<String>,
}

impl PositionState {
    /// Create a fresh position from the first fill.
    pub fn new(entry_price: Decimal, qty_filled: Decimal) -> Self {
        Self {
            entry_price,
            qty_filled,
            highest_price_since_entry: entry_price,
            current_stop_trigger: None,
            current_stop_limit: None,
            stop_order_id: None,
        }
    }

    /// Whether any quantity remains open.
    pub fn is_open(&self) -> bool {
        self.qty_filled > Decimal::ZERO
    }

    /// Compute the stop trigger and limit implied by the current high-water mark.
    ///
    /// The trigger trails the high by `trail_pct`; the limit sits
    /// `stop_limit_buffer_pct` below the trigger so the stop-limit stays
    /// marketable when it fires.
    ///
    /// Returns `(trigger, limit)`.
    pub fn compute_new_stop(
        &self,
        trail_pct: Decimal,
        stop_limit_buffer_pct: Decimal,
    ) -> (Decimal, Decimal) {
        let trigger = self.highest_price_since_entry * (Decimal::ONE - trail_pct);
        let limit = trigger * (Decimal::ONE - stop_limit_buffer_pct);
        (trigger, limit)
    }

    /// Ratchet the stop in response to a new trade price.
    ///
    /// Updates the high-water mark, then decides whether the stop must be
    /// replaced at the venue:
    /// - no stop yet: set trigger/limit and return `true` (caller places),
    /// - new trigger at or below the current one: return `false` (never lower),
    /// - improvement within the `min_ratchet` dead-band: return `false`
    ///   (not worth the cancel/replace round-trip),
    /// - otherwise: update trigger/limit and return `true` (caller replaces).
    ///
    /// Mutates internal state; persist after calling.
    pub fn ratchet_stop(
        &mut self,
        last_trade_price: Decimal,
        trail_pct: Decimal,
        stop_limit_buffer_pct: Decimal,
        min_ratchet: Decimal,
    ) -> bool {
        if last_trade_price > self.highest_price_since_entry {
            self.highest_price_since_entry = last_trade_price;
        }

        let (new_trigger, new_limit) = self.compute_new_stop(trail_pct, stop_limit_buffer_pct);

        let current = match self.current_stop_trigger {
            Some(t) => t,
            None => {
                self.current_stop_trigger = Some(new_trigger);
                self.current_stop_limit = Some(new_limit);
                return true;
            }
        };

        // Never move the stop down.
        if new_trigger <= current {
            return false;
        }

        // Only ratchet when the improvement clears the dead-band.
        let threshold = current * (Decimal::ONE + min_ratchet);
        if new_trigger > threshold {
            self.current_stop_trigger = Some(new_trigger);
            self.current_stop_limit = Some(new_limit);
            return true;
        }

        false
    }
}
