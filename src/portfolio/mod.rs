//! Multi-pair portfolio layer: capital accounting, risk limits, and the
//! orchestrator that replicates the per-pair engine across products

pub mod manager;
pub mod orchestrator;

pub use manager::{
    PairConfig, PortfolioConfig, PortfolioManager, PortfolioMetrics, PortfolioPosition,
    PositionStatus, RebalanceAction, RebalanceDirection, RiskViolation,
};
pub use orchestrator::{
    EntryRequest, EntrySignal, LiquidationSummary, MultiPairOrchestrator, PortfolioStatus,
};
