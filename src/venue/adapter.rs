//! Async venue backend contract
//!
//! The execution engine talks to the venue exclusively through
//! [`VenueAdapter`], so the production REST client and the in-memory test
//! backend are interchangeable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::VenueOrderStatus;
use super::VenueError;

/// Operations the engine needs from a venue.
///
/// Implementations must be safe to share across tasks; all methods take
/// `&self`.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Place a GTC limit buy. Returns the venue order ID.
    async fn place_limit_buy(
        &self,
        product_id: &str,
        client_id: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError>;

    /// Place a GTC stop-limit sell. Returns the venue order ID.
    async fn place_stop_limit(
        &self,
        product_id: &str,
        client_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError>;

    /// Cancel an order. `Ok(false)` means the venue reported a failure;
    /// from the engine's point of view the call is idempotent.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, VenueError>;

    /// Fetch current order status; `Ok(None)` if the venue does not know the ID.
    async fn get_order_status(&self, order_id: &str)
        -> Result<Option<VenueOrderStatus>, VenueError>;
}

/// A recorded order inside the in-memory backend.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub product_id: String,
    pub client_id: String,
    pub kind: &'static str,
    pub price: Decimal,
    pub stop_trigger: Option<Decimal>,
    pub qty: Decimal,
    pub status: String,
}

/// In-memory venue for tests: records every call and lets the test drive
/// order statuses.
#[derive(Debug, Default)]
pub struct InMemoryVenue {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    orders: HashMap<String, RecordedOrder>,
    next_id: u64,
    cancel_calls: Vec<String>,
}

impl InMemoryVenue {
    pub fn new() -> Self {
        Self::default()
    }

    fn gen_id(state: &mut InMemoryState) -> String {
        state.next_id += 1;
        format!("m{}", state.next_id)
    }

    /// Snapshot of a recorded order.
    pub fn order(&self, order_id: &str) -> Option<RecordedOrder> {
        self.inner.lock().unwrap().orders.get(order_id).cloned()
    }

    /// All order IDs with the given status, in insertion-id order.
    pub fn orders_with_status(&self, status: &str) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        let mut ids: Vec<String> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Order IDs passed to `cancel_order`, in call order.
    pub fn cancel_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancel_calls.clone()
    }

    /// Force an order into a status, e.g. "triggered" before a reconcile.
    pub fn set_status(&self, order_id: &str, status: &str) {
        let mut state = self.inner.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = status.to_string();
        }
    }

    /// Drop an order entirely, as if the venue never heard of it.
    pub fn forget(&self, order_id: &str) {
        self.inner.lock().unwrap().orders.remove(order_id);
    }
}

#[async_trait]
impl VenueAdapter for InMemoryVenue {
    async fn place_limit_buy(
        &self,
        product_id: &str,
        client_id: &str,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        let mut state = self.inner.lock().unwrap();
        let id = Self::gen_id(&mut state);
        state.orders.insert(
            id.clone(),
            RecordedOrder {
                product_id: product_id.to_string(),
                client_id: client_id.to_string(),
                kind: "limit_buy",
                price,
                stop_trigger: None,
                qty,
                status: "open".to_string(),
            },
        );
        Ok(id)
    }

    async fn place_stop_limit(
        &self,
        product_id: &str,
        client_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        let mut state = self.inner.lock().unwrap();
        let id = Self::gen_id(&mut state);
        state.orders.insert(
            id.clone(),
            RecordedOrder {
                product_id: product_id.to_string(),
                client_id: client_id.to_string(),
                kind: "stop_limit",
                price: limit,
                stop_trigger: Some(trigger),
                qty,
                status: "open".to_string(),
            },
        );
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, VenueError> {
        let mut state = self.inner.lock().unwrap();
        state.cancel_calls.push(order_id.to_string());
        match state.orders.get_mut(order_id) {
            Some(order) => {
                order.status = "cancelled".to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_order_status(
        &self,
        order_id: &str,
    ) -> Result<Option<VenueOrderStatus>, VenueError> {
        let state = self.inner.lock().unwrap();
        Ok(state.orders.get(order_id).map(|o| VenueOrderStatus {
            id: order_id.to_string(),
            status: o.status.clone(),
            filled_size: None,
        }))
    }
}
