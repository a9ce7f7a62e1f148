//! Venue integration: request signing, the async backend contract, and the
//! Coinbase Exchange REST client
//!
//! - [`auth`]: credentials loading and HMAC-SHA-256 request signing
//! - [`adapter`]: the [`VenueAdapter`] trait plus an in-memory test backend
//! - [`types`]: wire-level order bodies and responses
//! - [`client`]: the production [`CoinbaseClient`]

pub mod adapter;
pub mod auth;
pub mod client;
pub mod types;

pub use adapter::{InMemoryVenue, VenueAdapter};
pub use auth::Credentials;
pub use client::{ClientConfig, CoinbaseClient};
pub use types::VenueOrderStatus;

use thiserror::Error;

/// Failures surfaced by a venue backend.
///
/// Placement and cancel calls are never retried after a definitive venue
/// response; only 429s are retried inside the client.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Network failure or timeout; the call may not have reached the venue.
    #[error("transport error: {0}")]
    Transport(String),

    /// 429 responses persisted past the backoff budget.
    #[error("rate limited and backoff budget exhausted")]
    RateLimitExhausted,

    /// Definitive non-2xx response from the venue.
    #[error("venue error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Misconfigured signing secret. Fatal at startup.
    #[error("signing error: {0}")]
    Signing(String),
}
