//! Trade P&L analysis
//!
//! Pure helpers for realized/unrealized P&L on a single trade and for
//! aggregating across many. Exact decimal throughout.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Summary of one trade, open or closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAnalysis {
    pub entry_price: Decimal,
    pub entry_qty: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_qty: Option<Decimal>,
    /// Realized P&L on the exited quantity
    pub realized_pnl: Decimal,
    /// Mark-to-market P&L on the remaining quantity, if a price is known
    pub unrealized_pnl: Option<Decimal>,
    /// Total P&L as a percentage of entry notional
    pub pnl_percent: Decimal,
}

impl TradeAnalysis {
    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl.unwrap_or(Decimal::ZERO)
    }
}

/// Calculate P&L for a trade.
///
/// `exit_price`/`exit_qty` describe the sold portion (if any);
/// `current_price` marks the remaining quantity to market.
pub fn calculate_pnl(
    entry_price: Decimal,
    entry_qty: Decimal,
    exit_price: Option<Decimal>,
    exit_qty: Option<Decimal>,
    current_price: Option<Decimal>,
) -> TradeAnalysis {
    let entry_notional = entry_price * entry_qty;

    let exit_qty_val = exit_qty.unwrap_or(Decimal::ZERO);
    let realized_pnl = match exit_price {
        Some(exit) if exit_qty_val > Decimal::ZERO => (exit - entry_price) * exit_qty_val,
        _ => Decimal::ZERO,
    };

    let remaining_qty = entry_qty - exit_qty_val;
    let unrealized_pnl = match current_price {
        Some(price) if remaining_qty > Decimal::ZERO => Some((price - entry_price) * remaining_qty),
        _ => None,
    };

    let total = realized_pnl + unrealized_pnl.unwrap_or(Decimal::ZERO);
    let pnl_percent = if entry_notional > Decimal::ZERO {
        total / entry_notional * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };

    TradeAnalysis {
        entry_price,
        entry_qty,
        exit_price,
        exit_qty,
        realized_pnl,
        unrealized_pnl,
        pnl_percent,
    }
}

/// Aggregated statistics across trades
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnlSummary {
    pub total_trades: usize,
    pub total_realized_pnl: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub win_count: usize,
    pub loss_count: usize,
    pub win_rate_percent: Decimal,
    pub avg_pnl_percent: Decimal,
}

/// Aggregate P&L across completed and open trades.
pub fn aggregate_pnl(analyses: &[TradeAnalysis]) -> PnlSummary {
    if analyses.is_empty() {
        return PnlSummary::default();
    }

    let total_realized: Decimal = analyses.iter().map(|a| a.realized_pnl).sum();
    let total_unrealized: Decimal = analyses
        .iter()
        .map(|a| a.unrealized_pnl.unwrap_or(Decimal::ZERO))
        .sum();

    let wins = analyses
        .iter()
        .filter(|a| a.realized_pnl > Decimal::ZERO)
        .count();
    let losses = analyses
        .iter()
        .filter(|a| a.realized_pnl < Decimal::ZERO)
        .count();

    let count = Decimal::from(analyses.len() as u64);
    let avg_pnl = analyses.iter().map(|a| a.pnl_percent).sum::<Decimal>() / count;
    let win_rate = Decimal::from(wins as u64) / count * Decimal::ONE_HUNDRED;

    PnlSummary {
        total_trades: analyses.len(),
        total_realized_pnl: total_realized,
        total_unrealized_pnl: total_unrealized,
        total_pnl: total_realized + total_unrealized,
        win_count: wins,
        loss_count: losses,
        win_rate_percent: win_rate,
        avg_pnl_percent: avg_pnl,
    }
}
