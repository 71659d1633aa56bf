//! In-process gateway for development and tests. Orders stay pending until
//! settled by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{CreateOrder, GatewayError, PaymentGateway, RemoteState, StatusReport};
use crate::money::Amount;

#[derive(Debug, Clone)]
struct SandboxOrder {
    amount: Amount,
    report: StatusReport,
}

#[derive(Default)]
pub struct SandboxGateway {
    orders: Mutex<HashMap<String, SandboxOrder>>,
    unreachable: AtomicBool,
    reject_creates: AtomicBool,
    status_calls: AtomicUsize,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an order paid (or failed) on the gateway side.
    pub fn settle(&self, order_id: &str, state: RemoteState) {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.get_mut(order_id) {
            order.report = StatusReport {
                state,
                txn_id: Some(format!("SBX_{order_id}")),
                utr: (state == RemoteState::Success).then(|| format!("UTR{}", order.amount.minor())),
            };
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::SeqCst);
    }

    pub fn knows(&self, order_id: &str) -> bool {
        self.orders.lock().contains_key(order_id)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create_order(&self, order: &CreateOrder) -> Result<Value, GatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("sandbox offline".to_string()));
        }
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected("sandbox rejects orders".to_string()));
        }
        self.orders.lock().insert(
            order.order_id.clone(),
            SandboxOrder {
                amount: order.amount,
                report: StatusReport::pending(),
            },
        );
        Ok(json!({
            "status": "success",
            "order_id": order.order_id,
            "payment_url": format!("upi://pay?tr={}&am={}", order.order_id, order.amount),
        }))
    }

    async fn order_status(&self, order_id: &str) -> Result<StatusReport, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("sandbox offline".to_string()));
        }
        self.orders
            .lock()
            .get(order_id)
            .map(|o| o.report.clone())
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order {order_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: &str) -> CreateOrder {
        CreateOrder {
            order_id: id.to_string(),
            amount: Amount::from_major(100),
            customer_mobile: None,
            remark: "Wallet Deposit".into(),
        }
    }

    #[tokio::test]
    async fn test_orders_stay_pending_until_settled() {
        let gw = SandboxGateway::new();
        gw.create_order(&order("ORD_1")).await.unwrap();
        assert_eq!(
            gw.order_status("ORD_1").await.unwrap().state,
            RemoteState::Pending
        );

        gw.settle("ORD_1", RemoteState::Success);
        let report = gw.order_status("ORD_1").await.unwrap();
        assert_eq!(report.state, RemoteState::Success);
        assert_eq!(report.utr.as_deref(), Some("UTR10000"));
        assert_eq!(gw.status_calls(), 2);
    }

    #[tokio::test]
    async fn test_offline_sandbox_reports_transport_errors() {
        let gw = SandboxGateway::new();
        gw.set_unreachable(true);
        assert!(matches!(
            gw.create_order(&order("ORD_2")).await,
            Err(GatewayError::Transport(_))
        ));
        assert!(!gw.knows("ORD_2"));
    }
}
