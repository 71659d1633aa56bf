//! Payment gateway capability
//!
//! The ledger only needs two calls from a gateway: open an order and ask
//! for its state. Anything a gateway says about amounts is ignored; the
//! stored `Order` is authoritative.

pub mod sandbox;
pub mod zapupi;

pub use sandbox::SandboxGateway;
pub use zapupi::{ZapupiConfig, ZapupiGateway};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::LedgerError;
use crate::money::Amount;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    #[error("gateway returned malformed data: {0}")]
    Malformed(String),
}

impl From<GatewayError> for LedgerError {
    fn from(e: GatewayError) -> Self {
        LedgerError::Gateway(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub order_id: String,
    pub amount: Amount,
    pub customer_mobile: Option<String>,
    pub remark: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Success,
    Failed,
}

impl RemoteState {
    /// Lenient mapping of the status words gateways use.
    pub fn from_word(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "successful" | "completed" | "paid" | "captured" => RemoteState::Success,
            "failed" | "failure" | "expired" | "cancelled" | "canceled" | "declined"
            | "rejected" => RemoteState::Failed,
            _ => RemoteState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: RemoteState,
    pub txn_id: Option<String>,
    pub utr: Option<String>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self {
            state: RemoteState::Pending,
            txn_id: None,
            utr: None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the redirect/QR payload to hand to the client.
    async fn create_order(&self, order: &CreateOrder) -> Result<Value, GatewayError>;

    async fn order_status(&self, order_id: &str) -> Result<StatusReport, GatewayError>;
}
