//! Portfolio accounting and risk limits
//!
//! Pure bookkeeping over one capital pool: pair registration with admission
//! control, position tracking with P&L, concentration and size limits,
//! rebalance drift detection, and the automatic liquidation mark when a
//! position breaches the loss floor. No I/O; the orchestrator owns
//! concurrency and venue calls.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::position::PositionState;
use crate::types::ProductId;

/// Process-wide capital pool and limits.
///
/// Percentage fields are in percent units (e.g. `5` means 5% of capital).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub total_capital: Decimal,
    /// Largest single position as % of capital
    pub max_position_size_pct: Decimal,
    /// Concurrent position cap
    pub max_positions: usize,
    /// Top-3 concentration cap as % of capital
    pub max_correlated_exposure_pct: Decimal,
    /// Drift beyond which a position is surfaced for rebalancing
    pub rebalance_threshold_pct: Decimal,
    /// Loss floor (negative %) that flags a position for liquidation
    pub emergency_liquidation_loss_pct: Decimal,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            total_capital: dec!(100000),
            max_position_size_pct: dec!(5),
            max_positions: 10,
            max_correlated_exposure_pct: dec!(20),
            rebalance_threshold_pct: dec!(10),
            emergency_liquidation_loss_pct: dec!(-10),
        }
    }
}

/// Per-pair configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub product_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capital allocation as % of the pool
    pub position_size_pct: Decimal,
    /// Trailing stop fraction for this pair
    pub trail_pct: Decimal,
    #[serde(default)]
    pub correlation_group: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Position lifecycle at the portfolio level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closed,
    Liquidated,
}

/// A [`PositionState`] wrapped with portfolio-level tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub position_id: String,
    pub product_id: String,
    pub state: PositionState,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    pub target_size_pct: Decimal,
    pub current_pnl: Decimal,
    pub current_pnl_pct: Decimal,
    pub status: PositionStatus,
}

/// Point-in-time portfolio metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub deployed_capital: Decimal,
    pub active_positions: usize,
    pub closed_positions: usize,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub total_return_pct: Decimal,
    pub largest_position_pct: Decimal,
    /// Top-3 positions as % of capital
    pub concentration_pct: Decimal,
    pub win_rate_pct: Decimal,
}

/// A breached risk limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskViolation {
    pub limit: String,
    pub detail: String,
}

/// Direction of a rebalance adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceDirection {
    Increase,
    Decrease,
}

/// A position whose actual weight drifted past the threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceAction {
    pub position_id: String,
    pub product_id: String,
    pub current_pct: Decimal,
    pub target_pct: Decimal,
    pub drift_pct: Decimal,
    pub direction: RebalanceDirection,
}

/// Tracks positions across pairs against one capital pool.
pub struct PortfolioManager {
    config: PortfolioConfig,
    pair_configs: HashMap<String, PairConfig>,
    positions: HashMap<String, PortfolioPosition>,
    closed_positions: Vec<PortfolioPosition>,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            pair_configs: HashMap::new(),
            positions: HashMap::new(),
            closed_positions: Vec::new(),
        }
    }

    pub fn config(&self) -> &PortfolioConfig {
        &self.config
    }

    pub fn pair_config(&self, product_id: &str) -> Option<&PairConfig> {
        self.pair_configs.get(product_id)
    }

    /// Register a pair; rejects registrations beyond `max_positions`.
    /// Disabled pairs are silently skipped.
    pub fn register_pair(&mut self, pair: PairConfig) -> Result<()> {
        if !pair.enabled {
            return Ok(());
        }
        if self.pair_configs.len() >= self.config.max_positions {
            bail!(
                "Max positions ({}) reached, cannot register {}",
                self.config.max_positions,
                pair.product_id
            );
        }
        self.pair_configs.insert(pair.product_id.clone(), pair);
        Ok(())
    }

    /// Capital allocated to a pair, in quote currency.
    pub fn position_size_quote(&self, product_id: &str) -> Decimal {
        match self.pair_configs.get(product_id) {
            Some(pair) => self.config.total_capital * pair.position_size_pct / Decimal::ONE_HUNDRED,
            None => Decimal::ZERO,
        }
    }

    pub fn add_position(
        &mut self,
        position_id: &str,
        product_id: &ProductId,
        state: PositionState,
    ) -> Result<()> {
        let pair = self
            .pair_configs
            .get(product_id.as_str())
            .with_context(|| format!("Pair {product_id} not registered"))?;
        if self.positions.len() >= self.config.max_positions {
            bail!("Max positions ({}) reached", self.config.max_positions);
        }

        let position = PortfolioPosition {
            position_id: position_id.to_string(),
            product_id: product_id.as_str().to_string(),
            state,
            opened_at: chrono::Utc::now(),
            target_size_pct: pair.position_size_pct,
            current_pnl: Decimal::ZERO,
            current_pnl_pct: Decimal::ZERO,
            status: PositionStatus::Active,
        };
        self.positions.insert(position_id.to_string(), position);
        Ok(())
    }

    /// Refresh a position's state and P&L from the latest price.
    ///
    /// When the loss breaches `emergency_liquidation_loss_pct` the position
    /// is marked [`PositionStatus::Liquidated`]; the orchestrator acts on the
    /// mark.
    pub fn update_position(
        &mut self,
        position_id: &str,
        state: PositionState,
        current_price: Option<Decimal>,
    ) -> Result<()> {
        let pos = self
            .positions
            .get_mut(position_id)
            .with_context(|| format!("Position {position_id} not found"))?;
        pos.state = state;

        if let Some(price) = current_price {
            if pos.state.qty_filled > Decimal::ZERO {
                pos.current_pnl = (price - pos.state.entry_price) * pos.state.qty_filled;
                pos.current_pnl_pct = if pos.state.entry_price > Decimal::ZERO {
                    (price - pos.state.entry_price) / pos.state.entry_price * Decimal::ONE_HUNDRED
                } else {
                    Decimal::ZERO
                };

                if pos.current_pnl_pct <= self.config.emergency_liquidation_loss_pct {
                    pos.status = PositionStatus::Liquidated;
                }
            }
        }
        Ok(())
    }

    /// Positions currently marked active (or flagged for liquidation) for a
    /// product.
    pub fn positions_for_product(&self, product_id: &str) -> Vec<PortfolioPosition> {
        self.positions
            .values()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn position(&self, position_id: &str) -> Option<&PortfolioPosition> {
        self.positions.get(position_id)
    }

    pub fn active_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Close a position at `exit_price`; returns the realized P&L.
    pub fn close_position(&mut self, position_id: &str, exit_price: Decimal) -> Result<Decimal> {
        self.finish_position(position_id, exit_price, PositionStatus::Closed)
    }

    /// Close a position as part of an emergency liquidation.
    pub fn liquidate_position(
        &mut self,
        position_id: &str,
        exit_price: Decimal,
    ) -> Result<Decimal> {
        self.finish_position(position_id, exit_price, PositionStatus::Liquidated)
    }

    fn finish_position(
        &mut self,
        position_id: &str,
        exit_price: Decimal,
        status: PositionStatus,
    ) -> Result<Decimal> {
        let mut pos = self
            .positions
            .remove(position_id)
            .with_context(|| format!("Position {position_id} not found"))?;
        let realized = (exit_price - pos.state.entry_price) * pos.state.qty_filled;
        pos.state.qty_filled = Decimal::ZERO;
        pos.status = status;
        pos.current_pnl = realized;
        self.closed_positions.push(pos);
        Ok(realized)
    }

    /// Portfolio-level metrics over active and closed positions.
    pub fn metrics(&self) -> PortfolioMetrics {
        let deployed: Decimal = self
            .positions
            .values()
            .filter(|p| p.state.qty_filled > Decimal::ZERO)
            .map(|p| p.state.entry_price * p.state.qty_filled)
            .sum();

        let unrealized: Decimal = self.positions.values().map(|p| p.current_pnl).sum();
        let realized: Decimal = self.closed_positions.iter().map(|p| p.current_pnl).sum();
        let total_pnl = realized + unrealized;

        let capital = self.config.total_capital;
        let total_return_pct = if capital > Decimal::ZERO {
            total_pnl / capital * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let mut sizes: Vec<Decimal> = self
            .positions
            .values()
            .map(|p| p.state.entry_price * p.state.qty_filled)
            .collect();
        sizes.sort_by(|a, b| b.cmp(a));
        let top3: Decimal = sizes.iter().take(3).copied().sum();

        let pct_of_capital = |v: Decimal| {
            if capital > Decimal::ZERO {
                v / capital * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            }
        };

        let wins = self
            .closed_positions
            .iter()
            .filter(|p| p.current_pnl > Decimal::ZERO)
            .count();
        let win_rate_pct = if self.closed_positions.is_empty() {
            Decimal::ZERO
        } else {
            Decimal::from(wins as u64) / Decimal::from(self.closed_positions.len() as u64)
                * Decimal::ONE_HUNDRED
        };

        PortfolioMetrics {
            total_capital: capital,
            available_capital: capital - deployed,
            deployed_capital: deployed,
            active_positions: self.positions.len(),
            closed_positions: self.closed_positions.len(),
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            total_pnl,
            total_return_pct,
            largest_position_pct: pct_of_capital(sizes.first().copied().unwrap_or(Decimal::ZERO)),
            concentration_pct: pct_of_capital(top3),
            win_rate_pct,
        }
    }

    /// Every limit the portfolio currently violates; empty means admissible.
    pub fn check_risk_limits(&self) -> Vec<RiskViolation> {
        let mut violations = Vec::new();
        let metrics = self.metrics();

        if metrics.active_positions > self.config.max_positions {
            violations.push(RiskViolation {
                limit: "max_positions".to_string(),
                detail: format!(
                    "Active positions ({}) > limit ({})",
                    metrics.active_positions, self.config.max_positions
                ),
            });
        }

        if metrics.largest_position_pct > self.config.max_position_size_pct {
            violations.push(RiskViolation {
                limit: "max_position_size_pct".to_string(),
                detail: format!(
                    "Largest position ({}%) > limit ({}%)",
                    metrics.largest_position_pct, self.config.max_position_size_pct
                ),
            });
        }

        if metrics.concentration_pct > self.config.max_correlated_exposure_pct {
            violations.push(RiskViolation {
                limit: "max_correlated_exposure_pct".to_string(),
                detail: format!(
                    "Top-3 concentration ({}%) > limit ({}%)",
                    metrics.concentration_pct, self.config.max_correlated_exposure_pct
                ),
            });
        }

        violations
    }

    /// Positions whose actual weight drifted past the rebalance threshold.
    pub fn rebalance_actions(&self) -> Vec<RebalanceAction> {
        let capital = self.config.total_capital;
        if capital <= Decimal::ZERO {
            return Vec::new();
        }

        let mut actions = Vec::new();
        for pos in self.positions.values() {
            let current_pct =
                pos.state.entry_price * pos.state.qty_filled / capital * Decimal::ONE_HUNDRED;
            let drift = (current_pct - pos.target_size_pct).abs();
            if drift > self.config.rebalance_threshold_pct {
                actions.push(RebalanceAction {
                    position_id: pos.position_id.clone(),
                    product_id: pos.product_id.clone(),
                    current_pct,
                    target_pct: pos.target_size_pct,
                    drift_pct: drift,
                    direction: if current_pct < pos.target_size_pct {
                        RebalanceDirection::Increase
                    } else {
                        RebalanceDirection::Decrease
                    },
                });
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(product_id: &str, size_pct: Decimal) -> PairConfig {
        PairConfig {
            product_id: product_id.to_string(),
            enabled: true,
            position_size_pct: size_pct,
            trail_pct: dec!(0.02),
            correlation_group: None,
        }
    }

    fn filled_state(entry: Decimal, qty: Decimal) -> PositionState {
        PositionState::new(entry, qty)
    }

    fn manager_with_pairs() -> PortfolioManager {
        let mut manager = PortfolioManager::new(PortfolioConfig::default());
        manager.register_pair(pair("BTC-USD", dec!(5))).unwrap();
        manager.register_pair(pair("ETH-USD", dec!(4))).unwrap();
        manager.register_pair(pair("SOL-USD", dec!(3))).unwrap();
        manager
    }

    #[test]
    fn test_register_rejects_beyond_max() {
        let config = PortfolioConfig {
            max_positions: 1,
            ..PortfolioConfig::default()
        };
        let mut manager = PortfolioManager::new(config);
        manager.register_pair(pair("BTC-USD", dec!(5))).unwrap();
        assert!(manager.register_pair(pair("ETH-USD", dec!(5))).is_err());
    }

    #[test]
    fn test_disabled_pair_is_skipped() {
        let mut manager = PortfolioManager::new(PortfolioConfig::default());
        let mut p = pair("BTC-USD", dec!(5));
        p.enabled = false;
        manager.register_pair(p).unwrap();
        assert!(manager.pair_config("BTC-USD").is_none());
    }

    #[test]
    fn test_position_size_quote() {
        let manager = manager_with_pairs();
        assert_eq!(manager.position_size_quote("BTC-USD"), dec!(5000));
        assert_eq!(manager.position_size_quote("UNKNOWN"), Decimal::ZERO);
    }

    #[test]
    fn test_add_position_requires_registration() {
        let mut manager = manager_with_pairs();
        let err = manager.add_position(
            "DOGE-USD-0",
            &ProductId::new("DOGE-USD"),
            filled_state(dec!(1), dec!(1)),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_deployed_capital_and_concentration() {
        let mut manager = manager_with_pairs();
        manager
            .add_position("BTC-USD-0", &ProductId::new("BTC-USD"), filled_state(dec!(50000), dec!(0.1)))
            .unwrap();
        manager
            .add_position("ETH-USD-0", &ProductId::new("ETH-USD"), filled_state(dec!(2000), dec!(2)))
            .unwrap();
        manager
            .add_position("SOL-USD-0", &ProductId::new("SOL-USD"), filled_state(dec!(150), dec!(20)))
            .unwrap();

        let metrics = manager.metrics();
        // 5000 + 4000 + 3000 deployed into 100k
        assert_eq!(metrics.deployed_capital, dec!(12000));
        assert_eq!(metrics.available_capital, dec!(88000));
        assert_eq!(metrics.concentration_pct, dec!(12));
        assert_eq!(metrics.largest_position_pct, dec!(5));
        assert!(manager.check_risk_limits().is_empty());
    }

    #[test]
    fn test_oversized_position_violates() {
        let mut manager = manager_with_pairs();
        manager
            .add_position("BTC-USD-0", &ProductId::new("BTC-USD"), filled_state(dec!(50000), dec!(0.2)))
            .unwrap();

        let violations = manager.check_risk_limits();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].limit, "max_position_size_pct");
    }

    #[test]
    fn test_pnl_update_and_liquidation_mark() {
        let mut manager = manager_with_pairs();
        let state = filled_state(dec!(100), dec!(10));
        manager
            .add_position("BTC-USD-0", &ProductId::new("BTC-USD"), state.clone())
            .unwrap();

        manager
            .update_position("BTC-USD-0", state.clone(), Some(dec!(95)))
            .unwrap();
        let pos = manager.position("BTC-USD-0").unwrap();
        assert_eq!(pos.current_pnl, dec!(-50));
        assert_eq!(pos.current_pnl_pct, dec!(-5));
        assert_eq!(pos.status, PositionStatus::Active);

        // -12% breaches the -10% floor
        manager
            .update_position("BTC-USD-0", state, Some(dec!(88)))
            .unwrap();
        let pos = manager.position("BTC-USD-0").unwrap();
        assert_eq!(pos.status, PositionStatus::Liquidated);
    }

    #[test]
    fn test_close_position_realizes_pnl() {
        let mut manager = manager_with_pairs();
        manager
            .add_position("BTC-USD-0", &ProductId::new("BTC-USD"), filled_state(dec!(100), dec!(10)))
            .unwrap();

        let realized = manager.close_position("BTC-USD-0", dec!(110)).unwrap();
        assert_eq!(realized, dec!(100));
        assert_eq!(manager.active_position_count(), 0);

        let metrics = manager.metrics();
        assert_eq!(metrics.realized_pnl, dec!(100));
        assert_eq!(metrics.total_pnl, metrics.realized_pnl + metrics.unrealized_pnl);
        assert_eq!(metrics.win_rate_pct, dec!(100));
    }

    #[test]
    fn test_rebalance_directions() {
        let config = PortfolioConfig {
            rebalance_threshold_pct: dec!(2),
            max_position_size_pct: dec!(50),
            ..PortfolioConfig::default()
        };
        let mut manager = PortfolioManager::new(config);
        manager.register_pair(pair("BTC-USD", dec!(10))).unwrap();
        manager.register_pair(pair("ETH-USD", dec!(10))).unwrap();

        // 20% actual vs 10% target -> decrease
        manager
            .add_position("BTC-USD-0", &ProductId::new("BTC-USD"), filled_state(dec!(100), dec!(200)))
            .unwrap();
        // 5% actual vs 10% target -> increase
        manager
            .add_position("ETH-USD-0", &ProductId::new("ETH-USD"), filled_state(dec!(100), dec!(50)))
            .unwrap();

        let mut actions = manager.rebalance_actions();
        actions.sort_by(|a, b| a.position_id.cmp(&b.position_id));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].direction, RebalanceDirection::Decrease);
        assert_eq!(actions[1].direction, RebalanceDirection::Increase);
    }
}
