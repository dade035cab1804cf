//! Payment provider event payloads.

use serde::Deserialize;
use std::collections::HashMap;

/// Only event type that moves money into the ledger.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Event envelope. `data.object` is kept raw until the type is known.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn is_checkout_completed(&self) -> bool {
        self.kind == CHECKOUT_COMPLETED
    }
}

/// Fields of a completed checkout session the ledger cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    /// Total charged, in the smallest currency unit.
    #[serde(default)]
    pub amount_total: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

impl CheckoutSession {
    pub fn from_object(object: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(object)
    }

    /// Purchaser email: `customer_email`, else `customer_details.email`.
    pub fn email(&self) -> Option<&str> {
        self.customer_email
            .as_deref()
            .or_else(|| {
                self.customer_details
                    .as_ref()
                    .and_then(|d| d.email.as_deref())
            })
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    pub fn package_id(&self) -> Option<&str> {
        self.metadata.get("package_id").map(String::as_str)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.metadata.get("price_id").map(String::as_str)
    }
}
