//! Per-endpoint rate-limit governor using sliding windows
//!
//! The governor is the engine-side pre-check against venue quotas: each
//! endpoint key keeps the timestamps of its recent requests and a new request
//! is admitted only while the count inside the window stays under quota. The
//! venue client still handles surprise 429 responses as a safety net.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Quota for a single endpoint
#[derive(Debug, Clone, Copy)]
pub struct RateLimitQuota {
    /// Maximum requests allowed inside one window
    pub requests_per_window: usize,
    /// Window length
    pub window: Duration,
}

impl RateLimitQuota {
    pub fn per_second(requests: usize) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct EndpointState {
    quota: RateLimitQuota,
    request_times: VecDeque<Instant>,
}

impl EndpointState {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.request_times.front() {
            if now.duration_since(*front) >= self.quota.window {
                self.request_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_allowed(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.request_times.len() < self.quota.requests_per_window
    }

    fn time_until_allowed(&mut self, now: Instant) -> Duration {
        if self.is_allowed(now) {
            return Duration::ZERO;
        }
        // Oldest request leaves the window first.
        let oldest = *self.request_times.front().expect("window is full");
        self.quota.window.saturating_sub(now.duration_since(oldest))
    }
}

/// Sliding-window request governor shared across trading pairs.
///
/// Cloning is cheap and clones share state. Known endpoint keys are
/// `/orders`, `/orders/{id}`, and `default`.
///
/// # Example
///
/// ```no_run
/// use trailstop::rate_limit::RateLimitGovernor;
///
/// #[tokio::main]
/// async fn main() {
///     let governor = RateLimitGovernor::with_defaults();
///     if governor.wait_if_needed("/orders", std::time::Duration::from_secs(5)).await {
///         // make the request
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitGovernor {
    quotas: Arc<HashMap<String, RateLimitQuota>>,
    states: Arc<Mutex<HashMap<String, EndpointState>>>,
}

impl RateLimitGovernor {
    pub const ORDERS_ENDPOINT: &'static str = "/orders";
    pub const ORDER_BY_ID_ENDPOINT: &'static str = "/orders/{id}";
    pub const DEFAULT_ENDPOINT: &'static str = "default";

    pub fn new(quotas: HashMap<String, RateLimitQuota>) -> Self {
        Self {
            quotas: Arc::new(quotas),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Default quotas: 15/s for order placement and lookup, 10/s otherwise.
    pub fn with_defaults() -> Self {
        Self::with_rates(15, 10)
    }

    /// Build quotas from per-second rates for the order endpoints and the rest.
    pub fn with_rates(orders_per_second: usize, default_per_second: usize) -> Self {
        let mut quotas = HashMap::new();
        quotas.insert(
            Self::ORDERS_ENDPOINT.to_string(),
            RateLimitQuota::per_second(orders_per_second),
        );
        quotas.insert(
            Self::ORDER_BY_ID_ENDPOINT.to_string(),
            RateLimitQuota::per_second(orders_per_second),
        );
        quotas.insert(
            Self::DEFAULT_ENDPOINT.to_string(),
            RateLimitQuota::per_second(default_per_second),
        );
        Self::new(quotas)
    }

    fn quota_for(&self, endpoint: &str) -> RateLimitQuota {
        self.quotas
            .get(endpoint)
            .or_else(|| self.quotas.get(Self::DEFAULT_ENDPOINT))
            .copied()
            .unwrap_or(RateLimitQuota::per_second(10))
    }

    /// Check whether a request to `endpoint` is currently admissible.
    pub async fn is_allowed(&self, endpoint: &str) -> bool {
        let quota = self.quota_for(endpoint);
        let mut states = self.states.lock().await;
        let state = states.entry(endpoint.to_string()).or_insert(EndpointState {
            quota,
            request_times: VecDeque::new(),
        });
        state.is_allowed(Instant::now())
    }

    /// Record a request against `endpoint`'s window.
    pub async fn record_request(&self, endpoint: &str) {
        let quota = self.quota_for(endpoint);
        let mut states = self.states.lock().await;
        let state = states.entry(endpoint.to_string()).or_insert(EndpointState {
            quota,
            request_times: VecDeque::new(),
        });
        state.request_times.push_back(Instant::now());
    }

    /// Time until the next request would be admitted; zero if allowed now.
    pub async fn time_until_allowed(&self, endpoint: &str) -> Duration {
        let quota = self.quota_for(endpoint);
        let mut states = self.states.lock().await;
        let state = states.entry(endpoint.to_string()).or_insert(EndpointState {
            quota,
            request_times: VecDeque::new(),
        });
        state.time_until_allowed(Instant::now())
    }

    /// Suspend until a request to `endpoint` is admitted, then record it.
    ///
    /// Returns `false` if capacity did not free up within `max_wait`.
    pub async fn wait_if_needed(&self, endpoint: &str, max_wait: Duration) -> bool {
        let start = Instant::now();
        loop {
            {
                let quota = self.quota_for(endpoint);
                let mut states = self.states.lock().await;
                let state = states.entry(endpoint.to_string()).or_insert(EndpointState {
                    quota,
                    request_times: VecDeque::new(),
                });
                let now = Instant::now();
                if state.is_allowed(now) {
                    state.request_times.push_back(now);
                    return true;
                }
                let wait = state.time_until_allowed(now);
                let elapsed = start.elapsed();
                if elapsed + wait > max_wait {
                    return false;
                }
                drop(states);
                sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_quota() {
        let governor = RateLimitGovernor::with_rates(3, 3);
        for _ in 0..3 {
            assert!(governor.is_allowed("/orders").await);
            governor.record_request("/orders").await;
        }
        assert!(!governor.is_allowed("/orders").await);
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let governor = RateLimitGovernor::with_rates(1, 5);
        governor.record_request("/orders").await;
        assert!(!governor.is_allowed("/orders").await);
        assert!(governor.is_allowed("/accounts").await);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_uses_default_quota() {
        let governor = RateLimitGovernor::with_rates(15, 2);
        governor.record_request("/accounts").await;
        governor.record_request("/accounts").await;
        assert!(!governor.is_allowed("/accounts").await);
    }

    #[tokio::test]
    async fn test_time_until_allowed_zero_when_open() {
        let governor = RateLimitGovernor::with_defaults();
        assert_eq!(
            governor.time_until_allowed("/orders").await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_window_frees_capacity() {
        let mut quotas = HashMap::new();
        quotas.insert(
            "default".to_string(),
            RateLimitQuota {
                requests_per_window: 1,
                window: Duration::from_millis(50),
            },
        );
        let governor = RateLimitGovernor::new(quotas);

        governor.record_request("x").await;
        assert!(!governor.is_allowed("x").await);
        sleep(Duration::from_millis(60)).await;
        assert!(governor.is_allowed("x").await);
    }

    #[tokio::test]
    async fn test_wait_if_needed_succeeds_within_budget() {
        let mut quotas = HashMap::new();
        quotas.insert(
            "default".to_string(),
            RateLimitQuota {
                requests_per_window: 1,
                window: Duration::from_millis(50),
            },
        );
        let governor = RateLimitGovernor::new(quotas);

        governor.record_request("x").await;
        let allowed = governor.wait_if_needed("x", Duration::from_secs(1)).await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_wait_if_needed_times_out() {
        let mut quotas = HashMap::new();
        quotas.insert(
            "default".to_string(),
            RateLimitQuota {
                requests_per_window: 1,
                window: Duration::from_secs(60),
            },
        );
        let governor = RateLimitGovernor::new(quotas);

        governor.record_request("x").await;
        let allowed = governor
            .wait_if_needed("x", Duration::from_millis(20))
            .await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let governor = RateLimitGovernor::with_rates(1, 1);
        let clone = governor.clone();
        governor.record_request("/orders").await;
        assert!(!clone.is_allowed("/orders").await);
    }
}
