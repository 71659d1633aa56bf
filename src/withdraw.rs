//! Withdrawals
//!
//! A request debits winnings immediately and parks the record `pending` for
//! manual settlement. Unlike transactions, a withdrawal moves
//! `processing → pending` once the debit lands: `pending` here means
//! "debited, awaiting an admin". Approval only flips the status; rejection
//! is a second guarded movement that credits the winnings back.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::guard::{mirror_transaction, untouched, Intent, MoneyGuard, Movement};
use crate::models::{now_ms, Transaction, TxKind, TxRefs, TxStatus, Withdrawal};
use crate::money::{Amount, WalletDelta};
use crate::store::{self, paths, LedgerStore, Outcome};

const MAX_UPI_LEN: usize = 64;

pub fn new_withdrawal_id(user_id: &str, now: i64) -> String {
    let short: String = user_id.chars().take(6).collect();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("WD_{now}_{short}_{}", &nonce[..4])
}

pub fn refund_entry(withdrawal_id: &str) -> String {
    format!("{withdrawal_id}_REFUND")
}

/// Admin-facing labels for a settled withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decided {
    Approved,
    Rejected,
}

fn validate_upi(upi_id: &str) -> Result<()> {
    let upi_id = upi_id.trim();
    let valid = upi_id.len() <= MAX_UPI_LEN
        && upi_id
            .split_once('@')
            .map(|(name, handle)| !name.is_empty() && !handle.is_empty() && !handle.contains('@'))
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(LedgerError::validation("invalid UPI id"))
    }
}

fn mirror_template(w: &Withdrawal) -> Transaction {
    let mut tx = Transaction::new(w.id.clone(), &w.user_id, TxKind::Withdrawal, -w.amount.minor())
        .with_refs(TxRefs {
            withdrawal_id: Some(w.id.clone()),
            settlement_ref: w.settlement_ref.clone(),
            ..TxRefs::default()
        })
        .with_note(format!("Withdrawal to {}", w.upi_id));
    tx.created_at = w.created_at;
    tx
}

#[derive(Clone)]
pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
}

impl WithdrawalService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
        }
    }

    pub async fn load(&self, withdrawal_id: &str) -> Result<Withdrawal> {
        let path = paths::withdrawal(withdrawal_id)?;
        store::read_as::<Withdrawal>(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {withdrawal_id}")))
    }

    pub async fn request(&self, user_id: &str, amount: Amount, upi_id: &str) -> Result<Withdrawal> {
        paths::wallet(user_id)?;
        if amount.is_zero() {
            return Err(LedgerError::validation("amount must be positive"));
        }
        validate_upi(upi_id)?;

        let now = now_ms();
        let template = Withdrawal {
            id: new_withdrawal_id(user_id, now),
            user_id: user_id.to_string(),
            amount,
            upi_id: upi_id.trim().to_string(),
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
            settlement_ref: None,
            reason: None,
            lease: None,
        };
        let path = paths::withdrawal(&template.id)?;
        let intent = Intent::new(user_id, template.id.clone(), WalletDelta::debit_winnings(amount))
            .settle_as(TxStatus::Pending, TxStatus::Failed);

        let withdrawal = match self
            .guard
            .run_new::<Withdrawal>(&path, &template, &intent, &untouched)
            .await?
        {
            Movement::Completed(w) => w,
            other => {
                warn!(id = %template.id, ?other, "Withdrawal request did not settle");
                return Err(LedgerError::Busy(template.id));
            }
        };
        self.mirror(&withdrawal).await?;

        if withdrawal.status == TxStatus::Failed {
            let wallet = self.guard.wallets().balance(user_id).await?;
            info!(user = user_id, %amount, "Withdrawal declined: insufficient winnings");
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: wallet.winnings,
            });
        }
        info!(id = %withdrawal.id, user = user_id, %amount, upi = %withdrawal.upi_id, "🏧 Withdrawal requested");
        Ok(withdrawal)
    }

    pub async fn approve(&self, withdrawal_id: &str, settlement_ref: Option<String>) -> Result<Withdrawal> {
        let path = paths::withdrawal(withdrawal_id)?;
        let stamp = settlement_ref.clone();
        let outcome = self
            .guard
            .transition::<Withdrawal>(&path, TxStatus::Pending, TxStatus::Success, &move |w| {
                w.settlement_ref = stamp.clone();
            })
            .await?;

        let withdrawal = match outcome {
            Outcome::Committed { after: Some(w), .. } => w,
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                return Err(LedgerError::NotFound(format!("withdrawal {withdrawal_id}")))
            }
            Outcome::Aborted(Some(w)) => return Err(conflict(&w)),
        };
        self.mirror(&withdrawal).await?;
        info!(id = withdrawal_id, settlement = ?settlement_ref, "✅ Withdrawal approved");
        Ok(withdrawal)
    }

    /// Credit the winnings back and close the request as `rejected`.
    pub async fn reject(&self, withdrawal_id: &str, reason: Option<String>) -> Result<Withdrawal> {
        let path = paths::withdrawal(withdrawal_id)?;
        let current = self.load(withdrawal_id).await?;
        let intent = Intent::new(
            current.user_id.clone(),
            refund_entry(withdrawal_id),
            WalletDelta::credit_winnings(current.amount),
        )
        .settle_as(TxStatus::Rejected, TxStatus::Rejected);

        let note = reason.clone();
        let withdrawal = match self
            .guard
            .run::<Withdrawal>(&path, TxStatus::Pending, &intent, &move |w| {
                w.reason = note.clone();
            })
            .await?
        {
            Movement::Completed(w) => w,
            Movement::Missing => return Err(LedgerError::NotFound(format!("withdrawal {withdrawal_id}"))),
            Movement::InFlight(_) | Movement::Superseded => {
                return Err(LedgerError::Busy(withdrawal_id.to_string()))
            }
            Movement::AlreadySettled(w) | Movement::Unexpected(w) => return Err(conflict(&w)),
        };
        self.mirror(&withdrawal).await?;
        info!(id = withdrawal_id, reason = ?reason, amount = %withdrawal.amount, "↩️ Withdrawal rejected, winnings restored");
        Ok(withdrawal)
    }

    /// Copy the withdrawal's status onto the user's transaction list.
    pub async fn mirror(&self, withdrawal: &Withdrawal) -> Result<bool> {
        if withdrawal.status == TxStatus::Processing {
            return Ok(false);
        }
        mirror_transaction(self.store.as_ref(), &mirror_template(withdrawal), withdrawal.status).await
    }
}

fn conflict(w: &Withdrawal) -> LedgerError {
    if w.status == TxStatus::Processing {
        LedgerError::Busy(w.id.clone())
    } else {
        LedgerError::InvalidTransition(format!("withdrawal {} is {}", w.id, w.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn service_with_winnings(uid: &str, major: i64) -> (Arc<dyn LedgerStore>, WithdrawalService) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let svc = WithdrawalService::new(store.clone());
        svc.guard
            .wallets()
            .apply(uid, "seed", WalletDelta::credit_winnings(Amount::from_major(major)))
            .await
            .unwrap();
        (store, svc)
    }

    async fn winnings(svc: &WithdrawalService, uid: &str) -> Amount {
        svc.guard.wallets().balance(uid).await.unwrap().winnings
    }

    #[tokio::test]
    async fn test_request_debits_immediately_and_reject_restores() {
        let (store, svc) = service_with_winnings("u1", 100).await;

        let w = svc.request("u1", Amount::from_major(60), "player@okaxis").await.unwrap();
        assert_eq!(w.status, TxStatus::Pending);
        assert!(w.id.starts_with("WD_"));
        assert_eq!(winnings(&svc, "u1").await, Amount::from_major(40));

        let tx: Transaction = store::read_as(store.as_ref(), &paths::transaction("u1", &w.id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.amount, -6_000);
        assert_eq!(tx.status, TxStatus::Pending);

        let rejected = svc.reject(&w.id, Some("name mismatch".into())).await.unwrap();
        assert_eq!(rejected.status, TxStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("name mismatch"));
        assert_eq!(winnings(&svc, "u1").await, Amount::from_major(100));

        // Second decision conflicts and moves nothing.
        assert!(matches!(
            svc.reject(&w.id, None).await,
            Err(LedgerError::InvalidTransition(_))
        ));
        assert!(matches!(
            svc.approve(&w.id, Some("UTR1".into())).await,
            Err(LedgerError::InvalidTransition(_))
        ));
        assert_eq!(winnings(&svc, "u1").await, Amount::from_major(100));

        let tx: Transaction = store::read_as(store.as_ref(), &paths::transaction("u1", &w.id).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TxStatus::Rejected);
    }

    #[tokio::test]
    async fn test_approve_leaves_winnings_untouched() {
        let (_, svc) = service_with_winnings("u2", 50).await;
        let w = svc.request("u2", Amount::from_major(50), "p@ybl").await.unwrap();
        assert_eq!(winnings(&svc, "u2").await, Amount::ZERO);

        let approved = svc.approve(&w.id, Some("UTR778".into())).await.unwrap();
        assert_eq!(approved.status, TxStatus::Success);
        assert_eq!(approved.settlement_ref.as_deref(), Some("UTR778"));
        assert_eq!(winnings(&svc, "u2").await, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_insufficient_winnings_fails_the_request() {
        let (_, svc) = service_with_winnings("u3", 10).await;
        // Deposited funds cannot be withdrawn.
        svc.guard
            .wallets()
            .apply("u3", "dep", WalletDelta::credit_deposited(Amount::from_major(500)))
            .await
            .unwrap();

        let err = svc.request("u3", Amount::from_major(20), "p@ybl").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { available, .. } if available == Amount::from_major(10)
        ));
        assert_eq!(winnings(&svc, "u3").await, Amount::from_major(10));
    }

    #[tokio::test]
    async fn test_rejects_bad_input_before_touching_the_store() {
        let (_, svc) = service_with_winnings("u4", 10).await;
        assert!(matches!(
            svc.request("u4", Amount::ZERO, "p@ybl").await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            svc.request("u4", Amount::from_major(1), "not-a-upi").await,
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            svc.approve("WD_missing", None).await,
            Err(LedgerError::NotFound(_))
        ));
    }
}
