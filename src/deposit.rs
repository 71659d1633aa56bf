//! Deposit reconciliation
//!
//! An order is persisted `pending` before the gateway hears about it. Two
//! independent triggers then race to confirm it: the payer polling
//! [`DepositService::verify`] and the gateway calling
//! [`DepositService::handle_webhook`]. Both end in [`DepositService::confirm`],
//! which credits through the guard keyed by the order id, so at most one of
//! them moves money. Amounts always come from the stored order.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::gateway::{CreateOrder, GatewayError, PaymentGateway, RemoteState, StatusReport};
use crate::guard::{mirror_transaction, Intent, MoneyGuard, Movement};
use crate::models::{now_ms, Order, Transaction, TxKind, TxRefs, TxStatus};
use crate::money::{Amount, WalletDelta};
use crate::store::{self, paths, LedgerStore};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Clone)]
pub struct DepositSettings {
    pub min_amount: Amount,
    pub gateway_timeout: Duration,
    pub webhook_recheck: bool,
}

impl Default for DepositSettings {
    fn default() -> Self {
        Self {
            min_amount: Amount::from_major(1),
            gateway_timeout: Duration::from_secs(10),
            webhook_recheck: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDeposit {
    pub order_id: String,
    pub amount: Amount,
    pub payment: Value,
}

/// Poll answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyStatus {
    NotFound,
    Pending,
    Success,
    Failed,
}

impl VerifyStatus {
    fn of(status: TxStatus) -> Self {
        match status {
            TxStatus::Success => VerifyStatus::Success,
            TxStatus::Failed | TxStatus::Rejected => VerifyStatus::Failed,
            TxStatus::Pending | TxStatus::Processing => VerifyStatus::Pending,
        }
    }
}

/// Gateway callback body. Field names vary between gateway versions.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "orderId")]
    pub order_id: String,
    #[serde(default)]
    pub status: String,
    /// Advisory only.
    #[serde(default)]
    pub amount: Option<Value>,
    #[serde(default, alias = "txnId", alias = "transaction_id")]
    pub txn_id: Option<String>,
    #[serde(default, alias = "UTR")]
    pub utr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAck {
    Credited,
    AlreadyProcessed,
    Failed,
    Pending,
    Ignored,
}

/// Constant-time check of a hex HMAC-SHA256 over the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

pub fn new_order_id(user_id: &str, now: i64) -> String {
    let prefix: String = user_id.chars().take(6).collect();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("ORD_{}_{}_{}", now, prefix, &nonce[..4])
}

fn deposit_tx(order: &Order, refs: TxRefs) -> Transaction {
    let mut tx = Transaction::new(
        order.order_id.clone(),
        order.user_id.clone(),
        TxKind::Deposit,
        order.amount.minor(),
    )
    .with_refs(TxRefs {
        order_id: Some(order.order_id.clone()),
        ..refs
    })
    .with_note("Wallet Deposit");
    tx.created_at = order.created_at;
    tx
}

#[derive(Clone)]
pub struct DepositService {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
    gateway: Arc<dyn PaymentGateway>,
    settings: DepositSettings,
}

impl DepositService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        settings: DepositSettings,
    ) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &DepositSettings {
        &self.settings
    }

    pub async fn create_deposit(
        &self,
        user_id: &str,
        amount: Amount,
        customer_mobile: Option<String>,
    ) -> Result<CreatedDeposit> {
        paths::wallet(user_id)?;
        if amount < self.settings.min_amount {
            return Err(LedgerError::validation(format!(
                "minimum deposit is {}",
                self.settings.min_amount
            )));
        }

        let now = now_ms();
        let order = Order {
            order_id: new_order_id(user_id, now),
            user_id: user_id.to_string(),
            amount,
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
            gateway_txn_id: None,
            utr: None,
            payment: None,
            lease: None,
        };
        let order_path = paths::order(&order.order_id)?;
        let tx = deposit_tx(&order, TxRefs::default());

        store::write_as(self.store.as_ref(), &order_path, &order).await?;
        store::write_as(
            self.store.as_ref(),
            &paths::transaction(user_id, &tx.id)?,
            &tx,
        )
        .await?;
        info!(order_id = %order.order_id, user = user_id, %amount, "💳 Deposit order created");

        let request = CreateOrder {
            order_id: order.order_id.clone(),
            amount,
            customer_mobile,
            remark: "Wallet Deposit".to_string(),
        };
        let created = match tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.create_order(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transport("create-order timed out".to_string())),
        };

        let payment = match created {
            Ok(payment) => payment,
            Err(GatewayError::Transport(reason)) => {
                warn!(order_id = %order.order_id, "⚠️ Gateway outcome unknown, order left pending: {}", reason);
                return Err(GatewayError::Transport(reason).into());
            }
            Err(e) => {
                warn!(order_id = %order.order_id, "❌ Gateway refused order: {}", e);
                self.fail(&order, TxRefs::default()).await?;
                return Err(e.into());
            }
        };

        let stamped = payment.clone();
        store::mutate_as::<Order, _>(self.store.as_ref(), &order_path, |current| {
            match current {
                Some(mut o) if o.payment.is_none() => {
                    o.payment = Some(stamped.clone());
                    store::Decision::Set(o)
                }
                _ => store::Decision::Abort,
            }
        })
        .await?;

        Ok(CreatedDeposit {
            order_id: order.order_id,
            amount,
            payment,
        })
    }

    pub async fn load_order(&self, order_id: &str) -> Result<Option<Order>> {
        let path = paths::order(order_id)?;
        Ok(store::read_as::<Order>(self.store.as_ref(), &path).await?)
    }

    /// Poll path.
    pub async fn verify(&self, user_id: &str, order_id: &str) -> Result<VerifyStatus> {
        let order = match self.load_order(order_id).await? {
            Some(o) if o.user_id == user_id => o,
            _ => return Ok(VerifyStatus::NotFound),
        };
        if order.status.is_terminal() {
            self.mirror(&order).await?;
            return Ok(VerifyStatus::of(order.status));
        }
        if order.is_locked() {
            return Ok(VerifyStatus::Pending);
        }

        let Some(report) = self.remote_status(order_id).await else {
            return Ok(VerifyStatus::Pending);
        };
        Ok(self.apply_report(&order, report).await?.0)
    }

    /// Callback path.
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> Result<WebhookAck> {
        if paths::validate_segment(&payload.order_id).is_err() {
            warn!(order_id = %payload.order_id, "Webhook for malformed order id ignored");
            return Ok(WebhookAck::Ignored);
        }
        let Some(order) = self.load_order(&payload.order_id).await? else {
            warn!(order_id = %payload.order_id, "Webhook for unknown order ignored");
            return Ok(WebhookAck::Ignored);
        };

        if let Some(claimed) = payload.amount.as_ref().and_then(|v| Amount::from_json(v).ok()) {
            if claimed != order.amount {
                warn!(
                    order_id = %order.order_id,
                    claimed = %claimed,
                    stored = %order.amount,
                    "Webhook amount differs from stored order; using stored amount"
                );
            }
        }

        if order.status.is_terminal() {
            self.mirror(&order).await?;
            return Ok(WebhookAck::AlreadyProcessed);
        }

        let claimed = StatusReport {
            state: RemoteState::from_word(&payload.status),
            txn_id: payload.txn_id.clone(),
            utr: payload.utr.clone(),
        };
        if claimed.state == RemoteState::Pending {
            return Ok(WebhookAck::Pending);
        }

        let report = if self.settings.webhook_recheck {
            match self.remote_status(&order.order_id).await {
                Some(remote) => StatusReport {
                    state: remote.state,
                    txn_id: remote.txn_id.or(claimed.txn_id),
                    utr: remote.utr.or(claimed.utr),
                },
                None => return Ok(WebhookAck::Pending),
            }
        } else {
            claimed
        };

        Ok(match self.apply_report(&order, report).await? {
            (VerifyStatus::Success, true) => WebhookAck::Credited,
            (VerifyStatus::Success, false) => WebhookAck::AlreadyProcessed,
            (VerifyStatus::Failed, _) => WebhookAck::Failed,
            (VerifyStatus::Pending, _) => WebhookAck::Pending,
            (VerifyStatus::NotFound, _) => WebhookAck::Ignored,
        })
    }

    async fn remote_status(&self, order_id: &str) -> Option<StatusReport> {
        match tokio::time::timeout(
            self.settings.gateway_timeout,
            self.gateway.order_status(order_id),
        )
        .await
        {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(order_id, gateway = self.gateway.name(), "Order status unavailable: {}", e);
                None
            }
            Err(_) => {
                warn!(order_id, gateway = self.gateway.name(), "Order status timed out");
                None
            }
        }
    }

    /// Returns the resulting status and whether this call moved money.
    async fn apply_report(
        &self,
        order: &Order,
        report: StatusReport,
    ) -> Result<(VerifyStatus, bool)> {
        let refs = TxRefs {
            gateway_txn_id: report.txn_id.clone(),
            utr: report.utr.clone(),
            ..TxRefs::default()
        };
        match report.state {
            RemoteState::Pending => Ok((VerifyStatus::Pending, false)),
            RemoteState::Failed => Ok((self.fail(order, refs).await?, false)),
            RemoteState::Success => self.confirm(order, refs).await,
        }
    }

    /// Guarded credit of the stored order amount.
    pub async fn confirm(&self, order: &Order, refs: TxRefs) -> Result<(VerifyStatus, bool)> {
        let path = paths::order(&order.order_id)?;
        let intent = Intent::new(
            order.user_id.clone(),
            order.order_id.clone(),
            WalletDelta::credit_deposited(order.amount),
        );
        let txn_id = refs.gateway_txn_id.clone();
        let utr = refs.utr.clone();
        let patch = move |o: &mut Order| {
            o.gateway_txn_id = o.gateway_txn_id.take().or_else(|| txn_id.clone());
            o.utr = o.utr.take().or_else(|| utr.clone());
        };

        let movement = self
            .guard
            .run::<Order>(&path, TxStatus::Pending, &intent, &patch)
            .await?;
        match &movement {
            Movement::Completed(o) => {
                info!(
                    order_id = %o.order_id,
                    user = %o.user_id,
                    amount = %o.amount,
                    "✅ Deposit credited"
                );
            }
            Movement::AlreadySettled(o) => {
                debug!(order_id = %o.order_id, "Deposit already settled");
            }
            _ => {}
        }

        let credited = matches!(movement, Movement::Completed(_));
        let status = match movement.record() {
            Some(o) if o.status.is_terminal() => {
                self.mirror(o).await?;
                VerifyStatus::of(o.status)
            }
            Some(_) => VerifyStatus::Pending,
            None if matches!(movement, Movement::Missing) => VerifyStatus::NotFound,
            None => VerifyStatus::Pending,
        };
        Ok((status, credited))
    }

    async fn fail(&self, order: &Order, refs: TxRefs) -> Result<VerifyStatus> {
        let path = paths::order(&order.order_id)?;
        let txn_id = refs.gateway_txn_id.clone();
        let utr = refs.utr.clone();
        let patch = move |o: &mut Order| {
            o.gateway_txn_id = o.gateway_txn_id.take().or_else(|| txn_id.clone());
            o.utr = o.utr.take().or_else(|| utr.clone());
        };
        let outcome = self
            .guard
            .transition::<Order>(&path, TxStatus::Pending, TxStatus::Failed, &patch)
            .await?;
        let current = match outcome {
            store::Outcome::Committed { after, .. } => {
                info!(order_id = %order.order_id, "🚫 Deposit failed at gateway");
                after
            }
            store::Outcome::Aborted(current) => current,
        };
        Ok(match current {
            Some(o) if o.status.is_terminal() => {
                self.mirror(&o).await?;
                VerifyStatus::of(o.status)
            }
            Some(_) => VerifyStatus::Pending,
            None => VerifyStatus::NotFound,
        })
    }

    /// Bring the user's transaction in line with a terminal order.
    pub async fn mirror(&self, order: &Order) -> Result<bool> {
        let refs = TxRefs {
            gateway_txn_id: order.gateway_txn_id.clone(),
            utr: order.utr.clone(),
            ..TxRefs::default()
        };
        mirror_transaction(self.store.as_ref(), &deposit_tx(order, refs), order.status).await
    }
}
