//! Configuration management
//!
//! Loads a JSON configuration file with `${VAR}` environment interpolation.
//! Every section has defaults, so a minimal file only overrides what it
//! needs. Decimal-valued options are written as JSON strings (`"0.02"`) for
//! exact round-trips.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::engine::EngineParams;
use crate::portfolio::{PairConfig, PortfolioConfig};
use crate::venue::client::{ClientConfig, DEFAULT_BASE_URL};

/// Complete trading system configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    pub rate_limit: RateLimitSettings,
    pub persistence: PersistenceConfig,
    /// Multi-pair trading; absent means a single pair from `exchange.product_id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<PortfolioSection>,
}

/// Venue connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub product_id: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub max_backoff_seconds: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            product_id: "BTC-USD".to_string(),
            timeout_seconds: 10,
            max_retries: 5,
            max_backoff_seconds: 60,
        }
    }
}

impl ExchangeConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.base_url.clone())
            .with_timeout(Duration::from_secs(self.timeout_seconds))
            .with_max_retries(self.max_retries)
            .with_max_backoff(Duration::from_secs(self.max_backoff_seconds))
    }
}

/// Trailing-stop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub trail_pct: Decimal,
    pub stop_limit_buffer_pct: Decimal,
    pub min_ratchet: Decimal,
    pub stop_timeout_seconds: u64,
    pub aggressive_delta_pct: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            trail_pct: dec!(0.02),
            stop_limit_buffer_pct: dec!(0.005),
            min_ratchet: dec!(0.001),
            stop_timeout_seconds: 300,
            aggressive_delta_pct: dec!(0.005),
        }
    }
}

impl StrategyConfig {
    /// Engine parameters for a pair, honouring a per-pair trail override.
    pub fn engine_params(&self, trail_override: Option<Decimal>) -> EngineParams {
        EngineParams {
            trail_pct: trail_override.unwrap_or(self.trail_pct),
            stop_limit_buffer_pct: self.stop_limit_buffer_pct,
            min_ratchet: self.min_ratchet,
            stop_timeout: Duration::from_secs(self.stop_timeout_seconds),
            aggressive_delta_pct: self.aggressive_delta_pct,
        }
    }
}

/// Governor quotas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub orders_per_second: usize,
    pub default_per_second: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            orders_per_second: 15,
            default_per_second: 10,
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub db_path: String,
    /// At-rest encryption is an operational concern; accepted here so
    /// deployments linked against an encrypting SQLite can use it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_password: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: "state.db".to_string(),
            encryption_password: None,
        }
    }
}

/// Portfolio-level limits plus the pairs to trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSection {
    #[serde(flatten)]
    pub limits: PortfolioConfig,
    pub pairs: Vec<PairConfig>,
}

impl Config {
    /// Load configuration from a JSON file with `${VAR}` interpolation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file {}", path.as_ref().display())
        })?;
        let interpolated = interpolate_env(&raw);
        serde_json::from_str(&interpolated).context("Failed to parse config JSON")
    }
}

/// Replace `${VAR}` tokens with values from the process environment.
/// Unknown tokens are left as-is.
fn interpolate_env(raw: &str) -> String {
    let mut out = raw.to_string();
    for (key, value) in std::env::vars() {
        let token = format!("${{{key}}}");
        if out.contains(&token) {
            out = out.replace(&token, &value);
        }
    }
    out
}
