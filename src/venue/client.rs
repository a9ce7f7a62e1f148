//! Coinbase Exchange REST client
//!
//! A production venue backend with:
//! - HMAC-SHA-256 request signing (CB-ACCESS-* headers)
//! - Engine-side rate-limit governing before every call
//! - 429 handling that honours `CB-RateLimit-Reset`, falling back to
//!   jittered exponential backoff with a bounded attempt budget
//! - Typed failures (`transport`, `rate-limit-exhausted`, `venue-error`)
//!
//! Placement and cancel calls are issued at most once per definitive venue
//! response; only 429s are retried.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use tokio::time::sleep;

use super::auth::{sign_request, Credentials};
use super::types::{OrderBody, PlacedOrder, VenueOrderStatus};
use super::{VenueAdapter, VenueError};
use crate::rate_limit::RateLimitGovernor;

/// Default REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.exchange.coinbase.com";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the venue REST API
    pub base_url: String,
    /// Overall per-request timeout
    pub timeout: Duration,
    /// Attempt budget for 429 retries
    pub max_retries: u32,
    /// Upper bound for one backoff delay
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
}

/// Signed async client for the venue REST API.
///
/// Owns the pooled HTTP session for its whole lifetime and shares the
/// rate-limit governor with every other client in the process.
#[derive(Clone)]
pub struct CoinbaseClient {
    credentials: Credentials,
    secret_key: Vec<u8>,
    http: Client,
    governor: RateLimitGovernor,
    config: ClientConfig,
}

impl CoinbaseClient {
    /// Build a client, validating the signing secret up front.
    ///
    /// A secret that does not base64-decode is fatal: every signed request
    /// would be rejected, so the process refuses to start.
    pub fn new(
        credentials: Credentials,
        config: ClientConfig,
        governor: RateLimitGovernor,
    ) -> Result<Self, VenueError> {
        let secret_key = credentials.decoded_secret()?;
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        Ok(Self {
            credentials,
            secret_key,
            http,
            governor,
            config,
        })
    }

    fn endpoint_key(path: &str) -> &'static str {
        if path == "/orders" {
            RateLimitGovernor::ORDERS_ENDPOINT
        } else if path.starts_with("/orders/") {
            RateLimitGovernor::ORDER_BY_ID_ENDPOINT
        } else {
            RateLimitGovernor::DEFAULT_ENDPOINT
        }
    }

    /// Delay until the venue's advertised rate-limit reset, if present.
    fn rate_limit_reset_delay(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        let reset: f64 = headers.get("CB-RateLimit-Reset")?.to_str().ok()?.parse().ok()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_secs_f64();
        Some(Duration::from_secs_f64((reset - now).max(0.0)))
    }

    /// Exponential backoff with ±25% jitter, capped at `max_backoff`.
    fn jittered_backoff(attempt: u32, base: Duration, max_backoff: Duration) -> Duration {
        let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(max_backoff.as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(-0.25..=0.25);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }

    /// Execute a signed request, suspending on 429s until the budget runs out.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&OrderBody>,
    ) -> Result<String, VenueError> {
        let endpoint = Self::endpoint_key(path);
        if !self
            .governor
            .wait_if_needed(endpoint, self.config.timeout)
            .await
        {
            return Err(VenueError::RateLimitExhausted);
        }

        let body_str = match body {
            Some(b) => serde_json::to_string(b)
                .map_err(|e| VenueError::Transport(format!("failed to encode body: {e}")))?,
            None => String::new(),
        };
        let url = format!("{}{}", self.config.base_url, path);

        let mut attempt: u32 = 0;
        loop {
            // re-sign every attempt so the timestamp stays fresh
            let timestamp = Utc::now().timestamp().to_string();
            let signature = sign_request(
                &self.secret_key,
                &timestamp,
                method.as_str(),
                path,
                &body_str,
            )?;

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("CB-ACCESS-KEY", &self.credentials.api_key)
                .header("CB-ACCESS-SIGN", signature)
                .header("CB-ACCESS-TIMESTAMP", timestamp)
                .header("CB-ACCESS-PASSPHRASE", &self.credentials.passphrase)
                .header(CONTENT_TYPE, "application/json");
            if !body_str.is_empty() {
                req = req.body(body_str.clone());
            }

            let resp = req
                .send()
                .await
                .map_err(|e| VenueError::Transport(e.to_string()))?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                attempt += 1;
                if attempt > self.config.max_retries {
                    return Err(VenueError::RateLimitExhausted);
                }
                let delay = match Self::rate_limit_reset_delay(resp.headers()) {
                    Some(reset_delay) => reset_delay,
                    None => Self::jittered_backoff(
                        attempt - 1,
                        Duration::from_secs(1),
                        self.config.max_backoff,
                    ),
                };
                tracing::warn!(
                    "Rate limited on {} (attempt {}/{}), suspending {}ms",
                    path,
                    attempt,
                    self.config.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
                continue;
            }

            let text = resp
                .text()
                .await
                .map_err(|e| VenueError::Transport(e.to_string()))?;

            if !status.is_success() {
                return Err(VenueError::Api {
                    status: status.as_u16(),
                    body: text,
                });
            }

            return Ok(text);
        }
    }
}

#[async_trait]
impl VenueAdapter for CoinbaseClient {
    async fn place_limit_buy(
        &self,
        product_id: &str,
        client_id: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        let body = OrderBody::limit_buy(product_id, client_id, price, qty);
        let text = self.request(Method::POST, "/orders", Some(&body)).await?;
        let placed: PlacedOrder = serde_json::from_str(&text)
            .map_err(|e| VenueError::Transport(format!("failed to parse order response: {e}")))?;
        Ok(placed.id)
    }

    async fn place_stop_limit(
        &self,
        product_id: &str,
        client_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        let body = OrderBody::stop_limit_sell(product_id, client_id, trigger, limit, qty);
        let text = self.request(Method::POST, "/orders", Some(&body)).await?;
        let placed: PlacedOrder = serde_json::from_str(&text)
            .map_err(|e| VenueError::Transport(format!("failed to parse order response: {e}")))?;
        Ok(placed.id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, VenueError> {
        let path = format!("/orders/{order_id}");
        match self.request(Method::DELETE, &path, None).await {
            Ok(_) => Ok(true),
            // a definitive venue rejection is reported, not retried
            Err(VenueError::Api { status, body }) => {
                tracing::warn!("Cancel of {} rejected ({}): {}", order_id, status, body);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(
        &self,
        order_id: &str,
    ) -> Result<Option<VenueOrderStatus>, VenueError> {
        let path = format!("/orders/{order_id}");
        match self.request(Method::GET, &path, None).await {
            Ok(text) => {
                let status: VenueOrderStatus = serde_json::from_str(&text).map_err(|e| {
                    VenueError::Transport(format!("failed to parse order status: {e}"))
                })?;
                Ok(Some(status))
            }
            Err(VenueError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
