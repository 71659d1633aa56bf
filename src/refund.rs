//! Cancellation refunds
//!
//! The `cancelledProcessed` latch and a `refund` run marker are set in one
//! CAS. Each paid player is then refunded through a guarded
//! `REFUND_{contest}_{user}` transaction, so re-running a batch (retry,
//! takeover of a stale run) never pays a player twice. Entries still
//! `reserved` are unwound from the wallet journal instead: whatever the
//! join actually took is reverted, and the join's own compensation then
//! finds nothing left to revert.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::contest::entry_key;
use crate::error::{LedgerError, Result};
use crate::guard::{mirror_transaction, untouched, Intent, MoneyGuard, Movement};
use crate::models::{
    now_ms, Contest, ContestStatus, EntryState, PlayerEntry, RefundPhase, RefundRun, Transaction,
    TxKind, TxRefs, TxStatus,
};
use crate::money::{Amount, WalletDelta};
use crate::store::{self, paths, Decision, LedgerStore, Outcome};

pub fn refund_tx_id(contest_id: &str, user_id: &str) -> String {
    format!("REFUND_{contest_id}_{user_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundOutcome {
    Refunded,
    AlreadyProcessed,
    InProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReport {
    pub contest_id: String,
    pub outcome: RefundOutcome,
    pub refunded: u32,
}

enum Latch {
    Acquired { token: String, contest: Contest },
    Done,
    Running,
}

#[derive(Clone)]
pub struct RefundProcessor {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
    stale_after_ms: i64,
}

impl RefundProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, stale_after_ms: i64) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
            stale_after_ms,
        }
    }

    /// Refund every player of a cancelled contest, at most once per player.
    pub async fn process(&self, contest_id: &str) -> Result<RefundReport> {
        self.process_at(contest_id, now_ms()).await
    }

    pub async fn process_at(&self, contest_id: &str, now: i64) -> Result<RefundReport> {
        let report = |outcome, refunded| RefundReport {
            contest_id: contest_id.to_string(),
            outcome,
            refunded,
        };

        let (token, contest) = match self.latch(contest_id, now).await? {
            Latch::Acquired { token, contest } => (token, contest),
            Latch::Done => return Ok(report(RefundOutcome::AlreadyProcessed, 0)),
            Latch::Running => return Ok(report(RefundOutcome::InProgress, 0)),
        };
        info!(contest = contest_id, players = contest.players.len(), "💸 Refunding cancelled contest");

        let mut refunded = 0u32;
        for (user_id, entry) in &contest.players {
            if self.refund_player(&contest, user_id, entry).await? {
                refunded += 1;
            }
        }

        self.finish(contest_id, &token, refunded).await?;
        info!(contest = contest_id, refunded, "✅ Contest refunds complete");
        Ok(report(RefundOutcome::Refunded, refunded))
    }

    /// Unwind `reserved` entries of a cancelled contest whose join stalled
    /// past the stale window, whatever phase the refund batch is in. A fee
    /// debited after the batch finished is only reachable from here.
    pub async fn release_stale_reservations(&self, contest: &Contest, now: i64) -> Result<u32> {
        if contest.status != ContestStatus::Cancelled {
            return Ok(0);
        }
        let mut released = 0u32;
        for (user_id, entry) in &contest.players {
            if entry.state != EntryState::Reserved
                || now.saturating_sub(entry.joined_at) < self.stale_after_ms
            {
                continue;
            }
            if self.refund_player(contest, user_id, entry).await? {
                warn!(contest = %contest.id, user = %user_id, "🔧 Refunded stalled reservation");
                released += 1;
            }
        }
        Ok(released)
    }

    async fn latch(&self, contest_id: &str, now: i64) -> Result<Latch> {
        let path = paths::contest(contest_id)?;
        let token = Uuid::new_v4().simple().to_string();
        let stale_after = self.stale_after_ms;

        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            if contest.status != ContestStatus::Cancelled {
                return Decision::Abort;
            }
            match &contest.refund {
                Some(run) if run.phase == RefundPhase::Done => return Decision::Abort,
                Some(run) if now.saturating_sub(run.started_at) < stale_after => {
                    return Decision::Abort
                }
                None if contest.cancelled_processed => return Decision::Abort,
                _ => {}
            }
            contest.cancelled_processed = true;
            contest.refund = Some(RefundRun {
                phase: RefundPhase::Running,
                token: token.clone(),
                started_at: now,
                refunded: 0,
            });
            contest.updated_at = now;
            Decision::Set(contest)
        })
        .await?;

        match outcome {
            Outcome::Committed { after: Some(contest), .. } => Ok(Latch::Acquired { token, contest }),
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                Err(LedgerError::NotFound(format!("contest {contest_id}")))
            }
            Outcome::Aborted(Some(contest)) => {
                if contest.status != ContestStatus::Cancelled {
                    return Err(LedgerError::InvalidTransition(format!(
                        "contest {contest_id} is not cancelled"
                    )));
                }
                Ok(match contest.refund {
                    Some(run) if run.phase == RefundPhase::Running => Latch::Running,
                    _ => Latch::Done,
                })
            }
        }
    }

    /// Returns whether money went back to the player in this call.
    async fn refund_player(&self, contest: &Contest, user_id: &str, entry: &PlayerEntry) -> Result<bool> {
        let tx_id = refund_tx_id(&contest.id, user_id);
        let refs = TxRefs {
            contest_id: Some(contest.id.clone()),
            ..TxRefs::default()
        };

        match entry.state {
            EntryState::Paid => {
                let delta = WalletDelta {
                    deposited: entry.deposit_used.minor(),
                    winnings: entry.winnings_used.minor(),
                };
                let total = entry
                    .deposit_used
                    .checked_add(entry.winnings_used)
                    .unwrap_or(Amount::ZERO);
                let template = Transaction::new(tx_id.clone(), user_id, TxKind::Refund, total.minor())
                    .with_refs(refs)
                    .with_note(format!("Refund: {}", contest.title));
                let path = paths::transaction(user_id, &tx_id)?;
                let intent = Intent::new(user_id, tx_id.clone(), delta);

                match self
                    .guard
                    .run_new::<Transaction>(&path, &template, &intent, &untouched)
                    .await?
                {
                    Movement::Completed(_) => Ok(true),
                    Movement::AlreadySettled(_) => Ok(false),
                    other => {
                        warn!(contest = %contest.id, user = user_id, ?other, "Refund still in flight");
                        Err(LedgerError::Busy(tx_id))
                    }
                }
            }
            EntryState::Reserved => {
                let key = entry_key(&contest.id, user_id);
                let Some(taken) = self.guard.wallets().revert(user_id, &key).await? else {
                    return Ok(false);
                };
                let amount = -taken.total();
                let template = Transaction::new(tx_id, user_id, TxKind::Refund, amount)
                    .with_refs(refs)
                    .with_note(format!("Refund: {}", contest.title));
                mirror_transaction(self.store.as_ref(), &template, TxStatus::Success).await?;
                Ok(true)
            }
        }
    }

    async fn finish(&self, contest_id: &str, token: &str, refunded: u32) -> Result<()> {
        let path = paths::contest(contest_id)?;
        let now = now_ms();
        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            match contest.refund.as_mut() {
                Some(run) if run.token == token && run.phase == RefundPhase::Running => {
                    run.phase = RefundPhase::Done;
                    run.refunded = refunded;
                }
                _ => return Decision::Abort,
            }
            contest.updated_at = now;
            Decision::Set(contest)
        })
        .await?;
        if !outcome.is_committed() {
            warn!(contest = contest_id, "Refund run was taken over before it finished");
        }
        Ok(())
    }
}
