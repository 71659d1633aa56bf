//! Wallet buckets and the credit journal
//!
//! A wallet holds two non-negative buckets, `deposited` and `winnings`.
//! Every guarded change is applied together with a journal key in the same
//! compare-and-swap, so replaying the step for the same key is a no-op.
//! Keys older than the retention window are pruned on the next write; the
//! window is far longer than any lease, so the owning record is terminal by then.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::models::now_ms;
use crate::money::{Amount, WalletDelta};
use crate::store::{self, paths, Decision, LedgerStore, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub at: i64,
    #[serde(flatten)]
    pub delta: WalletDelta,
    /// Marks a key whose movement was declined; later applies see it as spent.
    #[serde(default)]
    pub void: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub deposited: Amount,
    pub winnings: Amount,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub journal: BTreeMap<String, JournalEntry>,
}

impl Wallet {
    pub fn total(&self) -> Amount {
        self.deposited
            .checked_add(self.winnings)
            .unwrap_or(self.deposited.max(self.winnings))
    }

    /// `None` when either bucket would go negative.
    fn with_delta(&self, delta: WalletDelta) -> Option<Wallet> {
        let deposited = Amount::from_minor(self.deposited.minor().checked_add(delta.deposited)?).ok()?;
        let winnings = Amount::from_minor(self.winnings.minor().checked_add(delta.winnings)?).ok()?;
        Some(Wallet {
            deposited,
            winnings,
            journal: self.journal.clone(),
        })
    }

    /// Entry-fee split: deposit bucket first, winnings for the remainder.
    pub fn entry_fee_split(&self, fee: Amount) -> Option<WalletDelta> {
        let from_deposit = self.deposited.min(fee);
        let from_winnings = fee.checked_sub(from_deposit)?;
        if self.winnings < from_winnings {
            return None;
        }
        Some(WalletDelta {
            deposited: -from_deposit.minor(),
            winnings: -from_winnings.minor(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Buckets changed in this call.
    Applied { delta: WalletDelta, after: Wallet },
    /// Key already journaled; nothing changed.
    Duplicate { delta: WalletDelta, void: bool },
    /// A bucket would have gone negative; nothing changed.
    Insufficient { wallet: Wallet },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidOutcome {
    Voided,
    /// The movement landed after all.
    AlreadyApplied(WalletDelta),
}

/// Seven days.
pub const DEFAULT_JOURNAL_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct WalletLedger {
    store: Arc<dyn LedgerStore>,
    retention_ms: i64,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            retention_ms: DEFAULT_JOURNAL_RETENTION_MS,
        }
    }

    pub fn with_retention(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    pub async fn balance(&self, uid: &str) -> Result<Wallet> {
        let path = paths::wallet(uid)?;
        Ok(store::read_as::<Wallet>(self.store.as_ref(), &path)
            .await?
            .unwrap_or_default())
    }

    pub async fn journaled(&self, uid: &str, entry: &str) -> Result<Option<JournalEntry>> {
        Ok(self.balance(uid).await?.journal.get(entry).copied())
    }

    /// Apply `delta` once per `entry`.
    pub async fn apply(&self, uid: &str, entry: &str, delta: WalletDelta) -> Result<Applied> {
        self.apply_with(uid, entry, move |_| Some(delta)).await
    }

    /// Debit an entry fee, deposit bucket first. The split is computed
    /// against the wallet version that actually commits.
    pub async fn debit_entry_fee(&self, uid: &str, entry: &str, fee: Amount) -> Result<Applied> {
        self.apply_with(uid, entry, move |w| w.entry_fee_split(fee)).await
    }

    async fn apply_with<F>(&self, uid: &str, entry: &str, plan: F) -> Result<Applied>
    where
        F: Fn(&Wallet) -> Option<WalletDelta> + Send + Sync,
    {
        let path = paths::wallet(uid)?;
        let now = now_ms();
        let horizon = now.saturating_sub(self.retention_ms);

        let outcome = store::mutate_as::<Wallet, _>(self.store.as_ref(), &path, |current| {
            let wallet = current.unwrap_or_default();
            if wallet.journal.contains_key(entry) {
                return Decision::Abort;
            }
            let Some(delta) = plan(&wallet) else {
                return Decision::Abort;
            };
            match wallet.with_delta(delta) {
                Some(mut next) => {
                    next.journal.retain(|_, j| j.at > horizon);
                    next.journal.insert(
                        entry.to_string(),
                        JournalEntry {
                            at: now,
                            delta,
                            void: false,
                        },
                    );
                    Decision::Set(next)
                }
                None => Decision::Abort,
            }
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { after, .. } => {
                let after = after.unwrap_or_default();
                let delta = after
                    .journal
                    .get(entry)
                    .map(|j| j.delta)
                    .unwrap_or_default();
                debug!(user = uid, entry, ?delta, "wallet movement applied");
                Applied::Applied { delta, after }
            }
            Outcome::Aborted(current) => {
                let wallet = current.unwrap_or_default();
                match wallet.journal.get(entry) {
                    Some(j) => Applied::Duplicate {
                        delta: j.delta,
                        void: j.void,
                    },
                    None => Applied::Insufficient { wallet },
                }
            }
        })
    }

    /// Mark `entry` as declined unless it has been applied in the meantime.
    pub async fn void(&self, uid: &str, entry: &str) -> Result<VoidOutcome> {
        let path = paths::wallet(uid)?;
        let now = now_ms();

        let outcome = store::mutate_as::<Wallet, _>(self.store.as_ref(), &path, |current| {
            let mut wallet = current.unwrap_or_default();
            if wallet.journal.contains_key(entry) {
                return Decision::Abort;
            }
            wallet.journal.insert(
                entry.to_string(),
                JournalEntry {
                    at: now,
                    delta: WalletDelta::default(),
                    void: true,
                },
            );
            Decision::Set(wallet)
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { .. } => VoidOutcome::Voided,
            Outcome::Aborted(current) => {
                match current.and_then(|w| w.journal.get(entry).copied()) {
                    Some(j) if !j.void => VoidOutcome::AlreadyApplied(j.delta),
                    _ => VoidOutcome::Voided,
                }
            }
        })
    }

    /// Reverse a journaled movement and drop its key (saga compensation).
    pub async fn revert(&self, uid: &str, entry: &str) -> Result<Option<WalletDelta>> {
        let path = paths::wallet(uid)?;

        let outcome = store::mutate_as::<Wallet, _>(self.store.as_ref(), &path, |current| {
            let Some(wallet) = current else {
                return Decision::Abort;
            };
            let Some(j) = wallet.journal.get(entry).copied() else {
                return Decision::Abort;
            };
            let base = if j.void {
                Some(wallet.clone())
            } else {
                wallet.with_delta(j.delta.negate())
            };
            match base {
                Some(mut next) => {
                    next.journal.remove(entry);
                    Decision::Set(next)
                }
                None => Decision::Abort,
            }
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { before, .. } => before
                .and_then(|w| w.journal.get(entry).copied())
                .filter(|j| !j.void)
                .map(|j| j.delta),
            Outcome::Aborted(_) => None,
        })
    }
}
