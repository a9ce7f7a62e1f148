//! trailstop
//!
//! A single-venue spot trading engine that enters positions with limit buys
//! and exits through a synthetic dynamic trailing stop: as the market
//! advances, a venue-native stop-limit order is cancelled and replaced below
//! the running high-water mark, and the trigger only ever moves up. Durable
//! SQLite state survives crashes; startup reconciliation re-aligns local
//! state with the venue before any event is served.

pub mod config;
pub mod engine;
pub mod order_state;
pub mod pnl;
pub mod portfolio;
pub mod position;
pub mod rate_limit;
pub mod runtime;
pub mod store;
pub mod types;
pub mod venue;

pub use config::Config;
pub use engine::{EngineParams, ExecutionEngine};
pub use order_state::{Order, OrderState, OrderStateMachine};
pub use portfolio::{MultiPairOrchestrator, PortfolioConfig, PortfolioManager};
pub use position::PositionState;
pub use rate_limit::RateLimitGovernor;
pub use store::SqliteStore;
pub use types::{ProductId, Side};
pub use venue::{CoinbaseClient, Credentials, InMemoryVenue, VenueAdapter, VenueError};
