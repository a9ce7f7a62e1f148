//! Wire-level request and response types for the venue REST API

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Body for `POST /orders`.
///
/// Limit buys and stop-limit sells share the `limit` order type; a stop-limit
/// additionally carries `stop: "loss"` and a `stop_price`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub product_id: String,
    /// Limit price, decimal-as-string
    pub price: String,
    /// Order quantity, decimal-as-string
    pub size: String,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_oid: Option<String>,
}

impl OrderBody {
    /// GTC limit buy
    pub fn limit_buy(product_id: &str, client_id: &str, price: Decimal, qty: Decimal) -> Self {
        Self {
            order_type: "limit".to_string(),
            side: "buy".to_string(),
            product_id: product_id.to_string(),
            price: price.to_string(),
            size: qty.to_string(),
            time_in_force: "GTC".to_string(),
            stop: None,
            stop_price: None,
            client_oid: Some(client_id.to_string()),
        }
    }

    /// GTC stop-limit sell: triggers at `trigger`, rests at `limit`
    pub fn stop_limit_sell(
        product_id: &str,
        client_id: &str,
        trigger: Decimal,
        limit: Decimal,
        qty: Decimal,
    ) -> Self {
        Self {
            order_type: "limit".to_string(),
            side: "sell".to_string(),
            product_id: product_id.to_string(),
            price: limit.to_string(),
            size: qty.to_string(),
            time_in_force: "GTC".to_string(),
            stop: Some("loss".to_string()),
            stop_price: Some(trigger.to_string()),
            client_oid: Some(client_id.to_string()),
        }
    }
}

/// Response from `POST /orders`
#[derive(Debug, Clone, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
}

/// Response from `GET /orders/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct VenueOrderStatus {
    pub id: String,
    /// Venue-reported state, e.g. "open", "pending", "done", "triggered"
    pub status: String,
    #[serde(default)]
    pub filled_size: Option<String>,
}

impl VenueOrderStatus {
    /// A stop that is still working at the venue.
    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "open" | "pending")
    }

    /// A stop that has fired.
    pub fn is_triggered(&self) -> bool {
        self.status == "triggered"
    }
}
