//! Idempotency guard
//!
//! Every money movement tied to a record id goes through the same three
//! compare-and-swaps:
//!
//! 1. **claim**: record `expected → processing`, stamping a [`Lease`] that
//!    describes the wallet step (user, journal key, delta, target statuses).
//! 2. **apply**: the journaled wallet delta ([`WalletLedger::apply`]); a
//!    replay for the same key is a no-op.
//! 3. **settle**: `processing → on_success | on_insufficient`, only while the
//!    lease token still matches.
//!
//! Losing callers observe the claimed or terminal status and return the
//! existing result. A crash anywhere leaves a lease that
//! [`MoneyGuard::reclaim_stale`] can finish later.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::models::{now_ms, Lease, Order, Transaction, TxStatus, Withdrawal};
use crate::money::WalletDelta;
use crate::store::{self, paths, Decision, LedgerStore, Outcome, StorePath};
use crate::wallet::{Applied, VoidOutcome, WalletLedger};

/// A record whose status gates a money movement.
pub trait Guarded: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn status(&self) -> TxStatus;
    fn set_status(&mut self, status: TxStatus, now: i64);
    fn lease(&self) -> Option<&Lease>;
    fn set_lease(&mut self, lease: Option<Lease>);
}

macro_rules! impl_guarded {
    ($($ty:ty),*) => {$(
        impl Guarded for $ty {
            fn status(&self) -> TxStatus {
                self.status
            }
            fn set_status(&mut self, status: TxStatus, now: i64) {
                self.status = status;
                self.updated_at = now;
            }
            fn lease(&self) -> Option<&Lease> {
                self.lease.as_ref()
            }
            fn set_lease(&mut self, lease: Option<Lease>) {
                self.lease = lease;
            }
        }
    )*};
}

impl_guarded!(Order, Transaction, Withdrawal);

/// The wallet step a claim commits to.
#[derive(Debug, Clone)]
pub struct Intent {
    pub user_id: String,
    pub entry: String,
    pub delta: WalletDelta,
    pub on_success: TxStatus,
    pub on_insufficient: TxStatus,
}

impl Intent {
    pub fn new(user_id: impl Into<String>, entry: impl Into<String>, delta: WalletDelta) -> Self {
        Self {
            user_id: user_id.into(),
            entry: entry.into(),
            delta,
            on_success: TxStatus::Success,
            on_insufficient: TxStatus::Failed,
        }
    }

    pub fn settle_as(mut self, on_success: TxStatus, on_insufficient: TxStatus) -> Self {
        self.on_success = on_success;
        self.on_insufficient = on_insufficient;
        self
    }

    fn lease(&self, now: i64) -> Lease {
        Lease {
            token: Uuid::new_v4().simple().to_string(),
            at: now,
            user_id: self.user_id.clone(),
            entry: self.entry.clone(),
            delta: self.delta,
            on_success: self.on_success,
            on_insufficient: self.on_insufficient,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Claim<T> {
    Acquired(T),
    /// Terminal already; success-equivalent for the caller.
    Settled(T),
    /// Another worker holds a live lease.
    InFlight(T),
    Missing,
    Unexpected(T),
}

fn classify<T: Guarded>(record: T) -> Claim<T> {
    match record.status() {
        s if s.is_terminal() => Claim::Settled(record),
        TxStatus::Processing => Claim::InFlight(record),
        _ => Claim::Unexpected(record),
    }
}

#[derive(Debug, Clone)]
pub enum Movement<T> {
    /// This call drove the record to a terminal status.
    Completed(T),
    /// Some earlier call already did.
    AlreadySettled(T),
    InFlight(T),
    Missing,
    Unexpected(T),
    /// The lease was reclaimed before we could settle.
    Superseded,
}

impl<T> Movement<T> {
    pub fn record(&self) -> Option<&T> {
        match self {
            Movement::Completed(r)
            | Movement::AlreadySettled(r)
            | Movement::InFlight(r)
            | Movement::Unexpected(r) => Some(r),
            Movement::Missing | Movement::Superseded => None,
        }
    }
}

impl<T> From<Claim<T>> for Movement<T> {
    fn from(claim: Claim<T>) -> Self {
        match claim {
            Claim::Acquired(r) | Claim::InFlight(r) => Movement::InFlight(r),
            Claim::Settled(r) => Movement::AlreadySettled(r),
            Claim::Missing => Movement::Missing,
            Claim::Unexpected(r) => Movement::Unexpected(r),
        }
    }
}

pub type Patch<'a, T> = &'a (dyn Fn(&mut T) + Send + Sync);

/// Patch that leaves the record as is.
pub fn untouched<T>(_: &mut T) {}

#[derive(Clone)]
pub struct MoneyGuard {
    store: Arc<dyn LedgerStore>,
    wallets: WalletLedger,
}

impl MoneyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        let wallets = WalletLedger::new(store.clone());
        Self { store, wallets }
    }

    pub fn wallets(&self) -> &WalletLedger {
        &self.wallets
    }

    /// `expected → processing` on an existing record.
    pub async fn claim<T: Guarded>(
        &self,
        path: &StorePath,
        expected: TxStatus,
        intent: &Intent,
    ) -> Result<Claim<T>> {
        let lease = intent.lease(now_ms());
        let outcome = store::mutate_as::<T, _>(self.store.as_ref(), path, |current| {
            match current {
                Some(mut record) if record.status() == expected && record.lease().is_none() => {
                    record.set_status(TxStatus::Processing, lease.at);
                    record.set_lease(Some(lease.clone()));
                    Decision::Set(record)
                }
                _ => Decision::Abort,
            }
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { after: Some(r), .. } => Claim::Acquired(r),
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => Claim::Missing,
            Outcome::Aborted(Some(r)) => classify(r),
        })
    }

    /// Insert `template` already in `processing`, or claim it if it sits
    /// `pending`.
    pub async fn claim_or_insert<T: Guarded>(
        &self,
        path: &StorePath,
        template: &T,
        intent: &Intent,
    ) -> Result<Claim<T>> {
        let lease = intent.lease(now_ms());
        let outcome = store::mutate_as::<T, _>(self.store.as_ref(), path, |current| {
            let mut record = match current {
                None => template.clone(),
                Some(r) if r.status() == TxStatus::Pending && r.lease().is_none() => r,
                Some(_) => return Decision::Abort,
            };
            record.set_status(TxStatus::Processing, lease.at);
            record.set_lease(Some(lease.clone()));
            Decision::Set(record)
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { after: Some(r), .. } => Claim::Acquired(r),
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => Claim::Missing,
            Outcome::Aborted(Some(r)) => classify(r),
        })
    }

    /// Take over an in-flight record whose lease is at least `stale_after_ms`
    /// old. The wallet step is replayed from the lease it carries.
    pub async fn reclaim_stale<T: Guarded>(
        &self,
        path: &StorePath,
        now: i64,
        stale_after_ms: i64,
    ) -> Result<Claim<T>> {
        let token = Uuid::new_v4().simple().to_string();
        let outcome = store::mutate_as::<T, _>(self.store.as_ref(), path, |current| {
            let Some(mut record) = current else {
                return Decision::Abort;
            };
            if record.status() != TxStatus::Processing {
                return Decision::Abort;
            }
            let Some(mut lease) = record.lease().cloned() else {
                return Decision::Abort;
            };
            if now.saturating_sub(lease.at) < stale_after_ms {
                return Decision::Abort;
            }
            lease.token = token.clone();
            lease.at = now;
            record.set_lease(Some(lease));
            Decision::Set(record)
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { after: Some(r), .. } => Claim::Acquired(r),
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => Claim::Missing,
            Outcome::Aborted(Some(r)) => classify(r),
        })
    }

    /// Apply the claimed lease's wallet step and settle the record.
    pub async fn drive<T: Guarded>(
        &self,
        path: &StorePath,
        claimed: T,
        patch: Patch<'_, T>,
    ) -> Result<Movement<T>> {
        let Some(lease) = claimed.lease().cloned() else {
            return Ok(Movement::Unexpected(claimed));
        };

        // A reclaimed or settled lease must not touch the wallet again.
        match store::read_as::<T>(self.store.as_ref(), path).await? {
            None => return Ok(Movement::Missing),
            Some(current) => {
                let held = current.status() == TxStatus::Processing
                    && current.lease().map(|l| l.token.as_str()) == Some(lease.token.as_str());
                if !held {
                    return Ok(match classify(current) {
                        Claim::InFlight(_) => Movement::Superseded,
                        other => other.into(),
                    });
                }
            }
        }

        let landed = match self
            .wallets
            .apply(&lease.user_id, &lease.entry, lease.delta)
            .await?
        {
            Applied::Applied { .. } => true,
            Applied::Duplicate { void, .. } => !void,
            Applied::Insufficient { .. } => {
                match self.wallets.void(&lease.user_id, &lease.entry).await? {
                    VoidOutcome::Voided => false,
                    VoidOutcome::AlreadyApplied(_) => true,
                }
            }
        };
        let next = if landed {
            lease.on_success
        } else {
            lease.on_insufficient
        };

        let settled = self.settle(path, &lease.token, next, patch).await?;
        match settled {
            Outcome::Committed { after: Some(r), .. } => {
                debug!(
                    path = %path,
                    entry = %lease.entry,
                    status = next.as_str(),
                    "guarded movement settled"
                );
                Ok(Movement::Completed(r))
            }
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                Ok(Movement::Missing)
            }
            Outcome::Aborted(Some(r)) if r.status().is_terminal() => {
                Ok(Movement::AlreadySettled(r))
            }
            Outcome::Aborted(Some(_)) => {
                warn!(path = %path, "lease reclaimed before settle");
                Ok(Movement::Superseded)
            }
        }
    }

    async fn settle<T: Guarded>(
        &self,
        path: &StorePath,
        token: &str,
        next: TxStatus,
        patch: Patch<'_, T>,
    ) -> Result<Outcome<T>> {
        let now = now_ms();
        Ok(store::mutate_as::<T, _>(self.store.as_ref(), path, |current| {
            let Some(mut record) = current else {
                return Decision::Abort;
            };
            let held = record.status() == TxStatus::Processing
                && record.lease().map(|l| l.token.as_str()) == Some(token);
            if !held {
                return Decision::Abort;
            }
            patch(&mut record);
            record.set_status(next, now);
            record.set_lease(None);
            Decision::Set(record)
        })
        .await?)
    }

    /// `claim` followed by `drive`.
    pub async fn run<T: Guarded>(
        &self,
        path: &StorePath,
        expected: TxStatus,
        intent: &Intent,
        patch: Patch<'_, T>,
    ) -> Result<Movement<T>> {
        match self.claim::<T>(path, expected, intent).await? {
            Claim::Acquired(r) => self.drive(path, r, patch).await,
            other => Ok(other.into()),
        }
    }

    /// `claim_or_insert` followed by `drive`.
    pub async fn run_new<T: Guarded>(
        &self,
        path: &StorePath,
        template: &T,
        intent: &Intent,
        patch: Patch<'_, T>,
    ) -> Result<Movement<T>> {
        match self.claim_or_insert(path, template, intent).await? {
            Claim::Acquired(r) => self.drive(path, r, patch).await,
            other => Ok(other.into()),
        }
    }

    /// Status change that moves no money (e.g. `pending → failed`).
    pub async fn transition<T: Guarded>(
        &self,
        path: &StorePath,
        from: TxStatus,
        to: TxStatus,
        patch: Patch<'_, T>,
    ) -> Result<Outcome<T>> {
        if !from.can_advance_to(to) {
            return Err(LedgerError::InvalidTransition(format!(
                "{} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let now = now_ms();
        Ok(store::mutate_as::<T, _>(self.store.as_ref(), path, |current| {
            match current {
                Some(mut record) if record.status() == from && record.lease().is_none() => {
                    patch(&mut record);
                    record.set_status(to, now);
                    Decision::Set(record)
                }
                _ => Decision::Abort,
            }
        })
        .await?)
    }
}

/// Copy a status onto a user's mirrored transaction, respecting monotonicity.
/// A missing mirror is recreated from `template`.
pub async fn mirror_transaction(
    store: &dyn LedgerStore,
    template: &Transaction,
    status: TxStatus,
) -> Result<bool> {
    let path = paths::transaction(&template.user_id, &template.id)?;
    let now = now_ms();
    let outcome = store::mutate_as::<Transaction, _>(store, &path, |current| {
        let mut tx = match current {
            None => template.clone(),
            Some(tx) if tx.status == status => return Decision::Abort,
            Some(tx) if !tx.status.can_advance_to(status) => return Decision::Abort,
            Some(tx) => tx,
        };
        tx.status = status;
        tx.updated_at = now;
        tx.refs.gateway_txn_id = tx
            .refs
            .gateway_txn_id
            .clone()
            .or_else(|| template.refs.gateway_txn_id.clone());
        tx.refs.utr = tx.refs.utr.clone().or_else(|| template.refs.utr.clone());
        tx.refs.settlement_ref = tx
            .refs
            .settlement_ref
            .clone()
            .or_else(|| template.refs.settlement_ref.clone());
        Decision::Set(tx)
    })
    .await?;

    let changed = outcome.is_committed();
    if changed {
        info!(
            user = %template.user_id,
            tx = %template.id,
            status = status.as_str(),
            "🧾 transaction mirror updated"
        );
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TxKind;
    use crate::money::Amount;
    use crate::store::MemoryStore;

    fn guard() -> (Arc<dyn LedgerStore>, MoneyGuard) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        (store.clone(), MoneyGuard::new(store))
    }

    async fn seed_pending(store: &dyn LedgerStore, id: &str) -> StorePath {
        let path = paths::transaction("u1", id).unwrap();
        let tx = Transaction::new(id, "u1", TxKind::Deposit, 10_000);
        store::write_as(store, &path, &tx).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_credits_once() {
        let (store, guard) = guard();
        let path = seed_pending(store.as_ref(), "ORD_1").await;
        let intent = Intent::new("u1", "ORD_1", WalletDelta::credit_deposited(Amount::from_major(100)));

        let first = guard
            .run::<Transaction>(&path, TxStatus::Pending, &intent, &untouched)
            .await
            .unwrap();
        assert!(matches!(first, Movement::Completed(ref t) if t.status == TxStatus::Success));

        let second = guard
            .run::<Transaction>(&path, TxStatus::Pending, &intent, &untouched)
            .await
            .unwrap();
        assert!(matches!(second, Movement::AlreadySettled(_)));

        let wallet = guard.wallets().balance("u1").await.unwrap();
        assert_eq!(wallet.deposited, Amount::from_major(100));
        assert!(wallet.journal.contains_key("ORD_1"));
    }

    #[tokio::test]
    async fn test_insufficient_settles_with_fallback_status() {
        let (store, guard) = guard();
        let path = paths::withdrawal("WD_1").unwrap();
        let template = Withdrawal {
            id: "WD_1".into(),
            user_id: "u1".into(),
            amount: Amount::from_major(10),
            upi_id: "x@upi".into(),
            status: TxStatus::Pending,
            created_at: 0,
            updated_at: 0,
            settlement_ref: None,
            reason: None,
            lease: None,
        };
        let intent = Intent::new("u1", "WD_1", WalletDelta::debit_winnings(Amount::from_major(10)))
            .settle_as(TxStatus::Pending, TxStatus::Failed);

        let result = guard
            .run_new(&path, &template, &intent, &untouched)
            .await
            .unwrap();
        let Movement::Completed(w) = result else {
            panic!("expected completion, got {result:?}");
        };
        assert_eq!(w.status, TxStatus::Failed);
        assert!(w.lease.is_none());
        let stored: Withdrawal = store::read_as(store.as_ref(), &path).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_lease_is_finished_exactly_once() {
        let (store, guard) = guard();
        let path = seed_pending(store.as_ref(), "ORD_2").await;
        let intent = Intent::new("u1", "ORD_2", WalletDelta::credit_deposited(Amount::from_major(50)));

        // Crash after claim and wallet apply, before settle.
        let Claim::Acquired(claimed) = guard
            .claim::<Transaction>(&path, TxStatus::Pending, &intent)
            .await
            .unwrap()
        else {
            panic!("claim failed");
        };
        guard
            .wallets()
            .apply("u1", "ORD_2", intent.delta)
            .await
            .unwrap();

        // A fresh lease is not reclaimable.
        let fresh = guard
            .reclaim_stale::<Transaction>(&path, now_ms(), 60_000)
            .await
            .unwrap();
        assert!(matches!(fresh, Claim::InFlight(_)));

        let later = now_ms() + 120_000;
        let Claim::Acquired(reclaimed) = guard
            .reclaim_stale::<Transaction>(&path, later, 60_000)
            .await
            .unwrap()
        else {
            panic!("reclaim failed");
        };
        let done = guard.drive(&path, reclaimed, &untouched).await.unwrap();
        assert!(matches!(done, Movement::Completed(_)));

        // The original worker wakes up: its token no longer matches.
        let zombie = guard.drive(&path, claimed, &untouched).await.unwrap();
        assert!(matches!(zombie, Movement::AlreadySettled(_)));

        let wallet = guard.wallets().balance("u1").await.unwrap();
        assert_eq!(wallet.deposited, Amount::from_major(50));
    }

    #[tokio::test]
    async fn test_transition_refuses_terminal_rewrite() {
        let (store, guard) = guard();
        let path = seed_pending(store.as_ref(), "ORD_3").await;

        let failed = guard
            .transition::<Transaction>(&path, TxStatus::Pending, TxStatus::Failed, &untouched)
            .await
            .unwrap();
        assert!(failed.is_committed());

        let again = guard
            .transition::<Transaction>(&path, TxStatus::Pending, TxStatus::Success, &untouched)
            .await
            .unwrap();
        assert!(!again.is_committed());

        assert!(guard
            .transition::<Transaction>(&path, TxStatus::Success, TxStatus::Pending, &untouched)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mirror_transaction_is_monotone() {
        let (store, _) = guard();
        let template = Transaction::new("ORD_4", "u1", TxKind::Deposit, 500);

        assert!(mirror_transaction(store.as_ref(), &template, TxStatus::Success)
            .await
            .unwrap());
        assert!(!mirror_transaction(store.as_ref(), &template, TxStatus::Failed)
            .await
            .unwrap());

        let path = paths::transaction("u1", "ORD_4").unwrap();
        let stored: Transaction = store::read_as(store.as_ref(), &path).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Success);
    }
}
