//! Contest lifecycle: creation, paid joins, status changes and results.
//!
//! Joining spans two store paths (the contest's player map and the wallet),
//! so it runs as a [`Saga`]: reserve a slot, debit the fee under the journal
//! key `ENTRY_{contest}_{user}`, confirm the entry. A business rejection in a
//! later step releases whatever the earlier steps took.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{LedgerError, Result};
use crate::guard::{mirror_transaction, untouched, Intent, MoneyGuard, Movement};
use crate::leaderboard::LeaderboardService;
use crate::models::{
    now_ms, Contest, ContestStatus, EntryState, PlayerEntry, PlayerResult, PrizeTable, Transaction,
    TxKind, TxRefs, TxStatus,
};
use crate::money::{Amount, WalletDelta};
use crate::refund::{RefundProcessor, RefundReport};
use crate::saga::{Saga, SagaOutcome, SagaStep, Step};
use crate::store::{self, paths, Decision, LedgerStore, Outcome};
use crate::wallet::{Applied, WalletLedger};

pub fn entry_key(contest_id: &str, user_id: &str) -> String {
    format!("ENTRY_{contest_id}_{user_id}")
}

pub fn prize_tx_id(contest_id: &str, user_id: &str) -> String {
    format!("PRIZE_{contest_id}_{user_id}")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContest {
    pub id: String,
    pub title: String,
    pub entry_fee: Amount,
    pub total_slots: u32,
    #[serde(default)]
    pub prizes: PrizeTable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReceipt {
    pub contest_id: String,
    pub entry_fee: Amount,
    pub deposit_used: Amount,
    pub winnings_used: Amount,
    /// A reservation from an earlier attempt was completed.
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub contest: Contest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunds: Option<RefundReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultsOutcome {
    Credited,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizePayout {
    pub user_id: String,
    pub rank: u32,
    pub amount: Amount,
    pub newly_credited: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsReport {
    pub contest_id: String,
    pub outcome: ResultsOutcome,
    pub payouts: Vec<PrizePayout>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReservationRepair {
    pub completed: u32,
    pub released: u32,
}

#[derive(Clone)]
pub struct ContestService {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
    refunds: RefundProcessor,
    leaderboards: LeaderboardService,
}

impl ContestService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        refunds: RefundProcessor,
        leaderboards: LeaderboardService,
    ) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
            refunds,
            leaderboards,
        }
    }

    pub async fn load(&self, contest_id: &str) -> Result<Contest> {
        let path = paths::contest(contest_id)?;
        store::read_as::<Contest>(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("contest {contest_id}")))
    }

    pub async fn create_contest(&self, new: NewContest) -> Result<Contest> {
        let path = paths::contest(&new.id)?;
        if new.title.trim().is_empty() {
            return Err(LedgerError::validation("title is required"));
        }
        if new.total_slots == 0 {
            return Err(LedgerError::validation("totalSlots must be positive"));
        }
        if new.prizes.ranks.contains_key(&0) {
            return Err(LedgerError::validation("prize ranks start at 1"));
        }

        let now = now_ms();
        let contest = Contest {
            id: new.id.clone(),
            title: new.title.trim().to_string(),
            entry_fee: new.entry_fee,
            total_slots: new.total_slots,
            players: Default::default(),
            status: ContestStatus::Upcoming,
            results_credited: false,
            cancelled_processed: false,
            prizes: new.prizes,
            results: Vec::new(),
            payout_done: false,
            refund: None,
            created_at: now,
            updated_at: now,
        };
        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            match current {
                None => Decision::Set(contest.clone()),
                Some(_) => Decision::Abort,
            }
        })
        .await?;
        if !outcome.is_committed() {
            return Err(LedgerError::InvalidTransition(format!(
                "contest {} already exists",
                new.id
            )));
        }
        info!(contest = %contest.id, fee = %contest.entry_fee, slots = contest.total_slots, "🎮 Contest created");
        Ok(contest)
    }

    /// Reserve a slot and pay the entry fee, deposit bucket first.
    pub async fn join(&self, contest_id: &str, user_id: &str, display_name: &str) -> Result<JoinReceipt> {
        paths::contest(contest_id)?;
        paths::wallet(user_id)?;
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(LedgerError::validation("display name is required"));
        }

        let saga = Saga::new("contest_join")
            .step(ReserveSlot {
                store: self.store.clone(),
            })
            .step(DebitFee {
                wallets: self.guard.wallets().clone(),
            })
            .step(ConfirmEntry {
                store: self.store.clone(),
            });

        let mut ctx = JoinCtx {
            contest_id: contest_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            entry: entry_key(contest_id, user_id),
            fee: Amount::ZERO,
            split: None,
            resumed: false,
        };

        match saga.run(&mut ctx).await? {
            SagaOutcome::Completed => {
                let split = ctx.split.unwrap_or_default();
                info!(contest = contest_id, user = user_id, fee = %ctx.fee, resumed = ctx.resumed, "✅ Contest joined");
                Ok(JoinReceipt {
                    contest_id: ctx.contest_id,
                    entry_fee: ctx.fee,
                    deposit_used: used(split.deposited),
                    winnings_used: used(split.winnings),
                    resumed: ctx.resumed,
                })
            }
            SagaOutcome::RolledBack(reason) => Err(reason),
        }
    }

    /// Admin status change. Moving to `cancelled` runs the refund batch;
    /// repeating it on a cancelled contest resumes an unfinished batch.
    pub async fn set_status(&self, contest_id: &str, next: ContestStatus) -> Result<StatusChange> {
        let path = paths::contest(contest_id)?;
        let now = now_ms();
        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            if !contest.status.can_transition_to(next) {
                return Decision::Abort;
            }
            contest.status = next;
            contest.updated_at = now;
            Decision::Set(contest)
        })
        .await?;

        let contest = match outcome {
            Outcome::Committed { after: Some(c), .. } => {
                info!(contest = contest_id, status = ?next, "📋 Contest status changed");
                c
            }
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                return Err(LedgerError::NotFound(format!("contest {contest_id}")))
            }
            Outcome::Aborted(Some(c)) if c.status == next && next == ContestStatus::Cancelled => c,
            Outcome::Aborted(Some(c)) => {
                return Err(LedgerError::InvalidTransition(format!(
                    "contest {contest_id}: {:?} -> {:?}",
                    c.status, next
                )))
            }
        };

        if next != ContestStatus::Cancelled {
            return Ok(StatusChange {
                contest,
                refunds: None,
            });
        }
        let refunds = self.refunds.process(contest_id).await?;
        let contest = self.load(contest_id).await?;
        Ok(StatusChange {
            contest,
            refunds: Some(refunds),
        })
    }

    /// Credit prizes for a finished contest, once. A repeat call after an
    /// interrupted payout finishes it.
    pub async fn submit_results(&self, contest_id: &str, results: Vec<PlayerResult>) -> Result<ResultsReport> {
        let path = paths::contest(contest_id)?;
        validate_results(&results)?;

        let current = self.load(contest_id).await?;
        for r in &results {
            match current.players.get(&r.user_id) {
                Some(entry) if entry.state == EntryState::Paid => {}
                _ => {
                    return Err(LedgerError::validation(format!(
                        "{} is not a paid player of {contest_id}",
                        r.user_id
                    )))
                }
            }
            if current.prizes.prize_for(r.rank, r.kills).is_none() {
                return Err(LedgerError::validation(format!("prize overflow for {}", r.user_id)));
            }
        }

        let now = now_ms();
        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            let open = matches!(contest.status, ContestStatus::Live | ContestStatus::Completed);
            if contest.results_credited || !open {
                return Decision::Abort;
            }
            contest.results_credited = true;
            contest.results = results.clone();
            contest.status = ContestStatus::Completed;
            contest.updated_at = now;
            Decision::Set(contest)
        })
        .await?;

        let contest = match outcome {
            Outcome::Committed { after: Some(c), .. } => c,
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                return Err(LedgerError::NotFound(format!("contest {contest_id}")))
            }
            Outcome::Aborted(Some(c)) if c.results_credited => {
                if c.payout_done {
                    return Ok(ResultsReport {
                        contest_id: contest_id.to_string(),
                        outcome: ResultsOutcome::AlreadyProcessed,
                        payouts: Vec::new(),
                    });
                }
                info!(contest = contest_id, "Resuming interrupted prize payout");
                c
            }
            Outcome::Aborted(Some(c)) => {
                return Err(LedgerError::InvalidTransition(format!(
                    "contest {contest_id} is {:?}",
                    c.status
                )))
            }
        };

        let payouts = self.finish_payout(&contest).await?;
        Ok(ResultsReport {
            contest_id: contest_id.to_string(),
            outcome: ResultsOutcome::Credited,
            payouts,
        })
    }

    /// Pay every latched result through its guarded prize transaction, then
    /// mark the payout done.
    pub async fn finish_payout(&self, contest: &Contest) -> Result<Vec<PrizePayout>> {
        let mut payouts = Vec::with_capacity(contest.results.len());
        for result in &contest.results {
            let Some(amount) = contest.prizes.prize_for(result.rank, result.kills) else {
                warn!(contest = %contest.id, user = %result.user_id, "Prize overflow, skipped");
                continue;
            };
            if amount.is_zero() {
                continue;
            }

            let tx_id = prize_tx_id(&contest.id, &result.user_id);
            let template = Transaction::new(tx_id.clone(), &result.user_id, TxKind::Reward, amount.minor())
                .with_refs(TxRefs {
                    contest_id: Some(contest.id.clone()),
                    rank: Some(result.rank),
                    ..TxRefs::default()
                })
                .with_note(format!("Prize: {}", contest.title));
            let path = paths::transaction(&result.user_id, &tx_id)?;
            let intent = Intent::new(
                result.user_id.clone(),
                tx_id.clone(),
                WalletDelta::credit_winnings(amount),
            );

            let newly_credited = match self
                .guard
                .run_new::<Transaction>(&path, &template, &intent, &untouched)
                .await?
            {
                Movement::Completed(tx) => tx.status == TxStatus::Success,
                Movement::AlreadySettled(_) => false,
                other => {
                    warn!(contest = %contest.id, user = %result.user_id, ?other, "Prize still in flight");
                    return Err(LedgerError::Busy(tx_id));
                }
            };
            if newly_credited {
                self.leaderboards.record_earnings(&result.user_id, amount).await?;
            }
            payouts.push(PrizePayout {
                user_id: result.user_id.clone(),
                rank: result.rank,
                amount,
                newly_credited,
            });
        }

        let path = paths::contest(&contest.id)?;
        let now = now_ms();
        store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| match current {
            Some(mut c) if c.results_credited && !c.payout_done => {
                c.payout_done = true;
                c.updated_at = now;
                Decision::Set(c)
            }
            _ => Decision::Abort,
        })
        .await?;
        info!(contest = %contest.id, winners = payouts.len(), "🏅 Prizes credited");
        Ok(payouts)
    }

    /// Settle reservations abandoned longer than `stale_after_ms`: complete
    /// the entry when the wallet journal shows the fee was taken, release the
    /// slot otherwise. Cancelled contests are left to the refund batch.
    pub async fn settle_stale_reservations(
        &self,
        contest: &Contest,
        now: i64,
        stale_after_ms: i64,
    ) -> Result<ReservationRepair> {
        let mut repair = ReservationRepair::default();
        if contest.status == ContestStatus::Cancelled {
            return Ok(repair);
        }
        let path = paths::contest(&contest.id)?;
        let wallets = self.guard.wallets();

        for (user_id, entry) in &contest.players {
            if entry.state != EntryState::Reserved
                || now.saturating_sub(entry.joined_at) < stale_after_ms
            {
                continue;
            }
            let key = entry_key(&contest.id, user_id);
            match wallets.journaled(user_id, &key).await? {
                Some(j) if !j.void => {
                    if confirm_reserved(self.store.as_ref(), &path, user_id, j.delta).await? {
                        mirror_entry_tx(self.store.as_ref(), contest, user_id).await?;
                        warn!(contest = %contest.id, user = user_id, "🔧 Completed abandoned join");
                        repair.completed += 1;
                    }
                }
                _ => {
                    if release_reserved(self.store.as_ref(), &path, user_id).await? {
                        warn!(contest = %contest.id, user = user_id, "🔧 Released abandoned slot");
                        repair.released += 1;
                    }
                }
            }
        }
        Ok(repair)
    }
}

fn used(bucket_delta: i64) -> Amount {
    Amount::from_minor(bucket_delta.saturating_neg()).unwrap_or(Amount::ZERO)
}

fn validate_results(results: &[PlayerResult]) -> Result<()> {
    if results.is_empty() {
        return Err(LedgerError::validation("results are empty"));
    }
    let mut seen = HashSet::new();
    for r in results {
        paths::wallet(&r.user_id)?;
        if r.rank == 0 {
            return Err(LedgerError::validation("ranks start at 1"));
        }
        if !seen.insert(r.user_id.as_str()) {
            return Err(LedgerError::validation(format!("duplicate result for {}", r.user_id)));
        }
    }
    Ok(())
}

async fn confirm_reserved(
    store: &dyn LedgerStore,
    path: &store::StorePath,
    user_id: &str,
    taken: WalletDelta,
) -> Result<bool> {
    let outcome = store::mutate_as::<Contest, _>(store, path, |current| {
        let Some(mut contest) = current else {
            return Decision::Abort;
        };
        match contest.players.get_mut(user_id) {
            Some(entry) if entry.state == EntryState::Reserved => {
                entry.state = EntryState::Paid;
                entry.deposit_used = used(taken.deposited);
                entry.winnings_used = used(taken.winnings);
            }
            _ => return Decision::Abort,
        }
        Decision::Set(contest)
    })
    .await?;
    Ok(outcome.is_committed())
}

async fn release_reserved(store: &dyn LedgerStore, path: &store::StorePath, user_id: &str) -> Result<bool> {
    let outcome = store::mutate_as::<Contest, _>(store, path, |current| {
        let Some(mut contest) = current else {
            return Decision::Abort;
        };
        match contest.players.get(user_id) {
            Some(entry) if entry.state == EntryState::Reserved => {
                contest.players.remove(user_id);
                Decision::Set(contest)
            }
            _ => Decision::Abort,
        }
    })
    .await?;
    Ok(outcome.is_committed())
}

async fn mirror_entry_tx(store: &dyn LedgerStore, contest: &Contest, user_id: &str) -> Result<bool> {
    let template = Transaction::new(
        entry_key(&contest.id, user_id),
        user_id,
        TxKind::ContestEntry,
        -contest.entry_fee.minor(),
    )
    .with_refs(TxRefs {
        contest_id: Some(contest.id.clone()),
        ..TxRefs::default()
    })
    .with_note(format!("Joined: {}", contest.title));
    mirror_transaction(store, &template, TxStatus::Success).await
}

struct JoinCtx {
    contest_id: String,
    user_id: String,
    display_name: String,
    entry: String,
    fee: Amount,
    split: Option<WalletDelta>,
    resumed: bool,
}

struct ReserveSlot {
    store: Arc<dyn LedgerStore>,
}

#[async_trait]
impl SagaStep<JoinCtx> for ReserveSlot {
    fn name(&self) -> &'static str {
        "reserve_slot"
    }

    async fn forward(&self, ctx: &mut JoinCtx) -> Result<Step> {
        let path = paths::contest(&ctx.contest_id)?;
        let reserved = PlayerEntry {
            display_name: ctx.display_name.clone(),
            state: EntryState::Reserved,
            deposit_used: Amount::ZERO,
            winnings_used: Amount::ZERO,
            joined_at: now_ms(),
        };
        let user_id = ctx.user_id.clone();

        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            if contest.status != ContestStatus::Upcoming
                || contest.players.contains_key(&user_id)
                || contest.is_full()
            {
                return Decision::Abort;
            }
            contest.players.insert(user_id.clone(), reserved.clone());
            Decision::Set(contest)
        })
        .await?;

        let contest = match outcome {
            Outcome::Committed { after: Some(c), .. } => c,
            Outcome::Committed { after: None, .. } | Outcome::Aborted(None) => {
                return Ok(Step::Halt(LedgerError::NotFound(format!(
                    "contest {}",
                    ctx.contest_id
                ))))
            }
            Outcome::Aborted(Some(c)) => {
                let id = ctx.contest_id.clone();
                match c.players.get(&ctx.user_id).map(|e| e.state) {
                    Some(EntryState::Paid) => return Ok(Step::Halt(LedgerError::AlreadyJoined(id))),
                    Some(EntryState::Reserved) if c.status == ContestStatus::Upcoming => {
                        ctx.resumed = true;
                        c
                    }
                    _ if c.status != ContestStatus::Upcoming => {
                        return Ok(Step::Halt(LedgerError::ContestClosed(id)))
                    }
                    _ => return Ok(Step::Halt(LedgerError::ContestFull(id))),
                }
            }
        };
        ctx.fee = contest.entry_fee;
        Ok(Step::Continue)
    }

    async fn compensate(&self, ctx: &mut JoinCtx) -> Result<()> {
        let path = paths::contest(&ctx.contest_id)?;
        release_reserved(self.store.as_ref(), &path, &ctx.user_id).await?;
        Ok(())
    }
}

struct DebitFee {
    wallets: WalletLedger,
}

#[async_trait]
impl SagaStep<JoinCtx> for DebitFee {
    fn name(&self) -> &'static str {
        "debit_fee"
    }

    async fn forward(&self, ctx: &mut JoinCtx) -> Result<Step> {
        match self
            .wallets
            .debit_entry_fee(&ctx.user_id, &ctx.entry, ctx.fee)
            .await?
        {
            Applied::Applied { delta, .. } | Applied::Duplicate { delta, void: false } => {
                ctx.split = Some(delta);
                Ok(Step::Continue)
            }
            Applied::Duplicate { void: true, .. } => Ok(Step::Halt(LedgerError::InvalidTransition(
                format!("entry {} was declined", ctx.entry),
            ))),
            Applied::Insufficient { wallet } => Ok(Step::Halt(LedgerError::InsufficientFunds {
                needed: ctx.fee,
                available: wallet.total(),
            })),
        }
    }

    async fn compensate(&self, ctx: &mut JoinCtx) -> Result<()> {
        self.wallets.revert(&ctx.user_id, &ctx.entry).await?;
        ctx.split = None;
        Ok(())
    }
}

struct ConfirmEntry {
    store: Arc<dyn LedgerStore>,
}

#[async_trait]
impl SagaStep<JoinCtx> for ConfirmEntry {
    fn name(&self) -> &'static str {
        "confirm_entry"
    }

    async fn forward(&self, ctx: &mut JoinCtx) -> Result<Step> {
        let path = paths::contest(&ctx.contest_id)?;
        let split = ctx.split.unwrap_or_default();
        let user_id = ctx.user_id.clone();

        let outcome = store::mutate_as::<Contest, _>(self.store.as_ref(), &path, |current| {
            let Some(mut contest) = current else {
                return Decision::Abort;
            };
            if matches!(contest.status, ContestStatus::Cancelled | ContestStatus::Completed) {
                return Decision::Abort;
            }
            match contest.players.get_mut(&user_id) {
                Some(entry) if entry.state == EntryState::Reserved => {
                    entry.state = EntryState::Paid;
                    entry.deposit_used = used(split.deposited);
                    entry.winnings_used = used(split.winnings);
                    Decision::Set(contest)
                }
                _ => Decision::Abort,
            }
        })
        .await?;

        let contest = match outcome {
            Outcome::Committed { after: Some(c), .. } => c,
            Outcome::Aborted(Some(c))
                if c.players.get(&ctx.user_id).map(|e| e.state) == Some(EntryState::Paid) =>
            {
                c
            }
            Outcome::Aborted(Some(c))
                if matches!(c.status, ContestStatus::Cancelled | ContestStatus::Completed) =>
            {
                return Ok(Step::Halt(LedgerError::ContestClosed(ctx.contest_id.clone())))
            }
            _ => {
                return Ok(Step::Halt(LedgerError::InvalidTransition(format!(
                    "reservation for {} in {} expired",
                    ctx.user_id, ctx.contest_id
                ))))
            }
        };

        mirror_entry_tx(self.store.as_ref(), &contest, &ctx.user_id).await?;
        Ok(Step::Continue)
    }

    async fn compensate(&self, _ctx: &mut JoinCtx) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::LeaderboardSettings;
    use crate::models::{Board, RefundPhase};
    use crate::store::MemoryStore;
    use futures_util::future::join_all;

    fn service() -> (Arc<dyn LedgerStore>, ContestService) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let refunds = RefundProcessor::new(store.clone(), 120_000);
        let leaderboards = LeaderboardService::new(store.clone(), LeaderboardSettings::default());
        (store.clone(), ContestService::new(store, refunds, leaderboards))
    }

    fn new_contest(id: &str, fee: i64, slots: u32) -> NewContest {
        let mut prizes = PrizeTable::default();
        prizes.ranks.insert(1, Amount::from_major(100));
        prizes.per_kill = Amount::from_major(5);
        NewContest {
            id: id.to_string(),
            title: "Squad Scrims".into(),
            entry_fee: Amount::from_major(fee),
            total_slots: slots,
            prizes,
        }
    }

    async fn fund(svc: &ContestService, uid: &str, deposited: i64, winnings: i64) {
        let wallets = svc.guard.wallets();
        wallets
            .apply(uid, &format!("seed_dep_{uid}"), WalletDelta::credit_deposited(Amount::from_major(deposited)))
            .await
            .unwrap();
        wallets
            .apply(uid, &format!("seed_win_{uid}"), WalletDelta::credit_winnings(Amount::from_major(winnings)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_negative_fee_never_reaches_the_store() {
        let (_, svc) = service();
        let body = serde_json::json!({
            "id": "neg",
            "title": "Freebie",
            "entryFee": -5_000,
            "totalSlots": 2,
        });
        assert!(serde_json::from_value::<NewContest>(body).is_err());

        let prizes = serde_json::json!({
            "id": "neg",
            "title": "Freebie",
            "entryFee": 0,
            "totalSlots": 2,
            "prizes": {"ranks": {"1": -100}},
        });
        assert!(serde_json::from_value::<NewContest>(prizes).is_err());
        assert!(matches!(svc.load("neg").await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_join_splits_fee_deposit_first() {
        let (store, svc) = service();
        svc.create_contest(new_contest("c1", 70, 4)).await.unwrap();
        fund(&svc, "alice", 50, 40).await;

        let receipt = svc.join("c1", "alice", "Alice").await.unwrap();
        assert_eq!(receipt.deposit_used, Amount::from_major(50));
        assert_eq!(receipt.winnings_used, Amount::from_major(20));

        let wallet = svc.guard.wallets().balance("alice").await.unwrap();
        assert_eq!(wallet.deposited, Amount::ZERO);
        assert_eq!(wallet.winnings, Amount::from_major(20));

        let contest = svc.load("c1").await.unwrap();
        assert_eq!(contest.players["alice"].state, EntryState::Paid);

        let tx: Transaction = store::read_as(
            store.as_ref(),
            &paths::transaction("alice", &entry_key("c1", "alice")).unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(tx.kind, TxKind::ContestEntry);
        assert_eq!(tx.amount, -7_000);
        assert_eq!(tx.status, TxStatus::Success);

        let again = svc.join("c1", "alice", "Alice").await.unwrap_err();
        assert!(matches!(again, LedgerError::AlreadyJoined(_)));
        let wallet = svc.guard.wallets().balance("alice").await.unwrap();
        assert_eq!(wallet.winnings, Amount::from_major(20));
    }

    #[tokio::test]
    async fn test_insufficient_funds_releases_slot() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 70, 1)).await.unwrap();
        fund(&svc, "bob", 30, 10).await;

        let err = svc.join("c1", "bob", "Bob").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { needed, available }
                if needed == Amount::from_major(70) && available == Amount::from_major(40)
        ));
        assert!(svc.load("c1").await.unwrap().players.is_empty());

        fund(&svc, "carol", 70, 0).await;
        svc.join("c1", "carol", "Carol").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_fill_exactly_the_slots() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 10, 3)).await.unwrap();
        let users: Vec<String> = (0..8).map(|i| format!("user{i}")).collect();
        for uid in &users {
            fund(&svc, uid, 10, 0).await;
        }

        let results = join_all(users.iter().map(|uid| {
            let svc = svc.clone();
            let uid = uid.clone();
            async move { svc.join("c1", &uid, "P").await }
        }))
        .await;

        let joined = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::ContestFull(_))))
            .count();
        assert_eq!(joined, 3);
        assert_eq!(full, 5);

        let contest = svc.load("c1").await.unwrap();
        assert_eq!(contest.players.len(), 3);
        for uid in &users {
            let wallet = svc.guard.wallets().balance(uid).await.unwrap();
            let expected = if contest.players.contains_key(uid) { 0 } else { 10 };
            assert_eq!(wallet.deposited, Amount::from_major(expected));
        }
    }

    #[tokio::test]
    async fn test_retried_join_resumes_reservation_without_double_debit() {
        let (store, svc) = service();
        svc.create_contest(new_contest("c1", 20, 2)).await.unwrap();
        fund(&svc, "dave", 50, 0).await;

        // Crash after reserving and debiting, before confirming.
        let path = paths::contest("c1").unwrap();
        let mut contest: Contest = store::read_as(store.as_ref(), &path).await.unwrap().unwrap();
        contest.players.insert(
            "dave".into(),
            PlayerEntry {
                display_name: "Dave".into(),
                state: EntryState::Reserved,
                deposit_used: Amount::ZERO,
                winnings_used: Amount::ZERO,
                joined_at: now_ms(),
            },
        );
        store::write_as(store.as_ref(), &path, &contest).await.unwrap();
        svc.guard
            .wallets()
            .debit_entry_fee("dave", &entry_key("c1", "dave"), Amount::from_major(20))
            .await
            .unwrap();

        let receipt = svc.join("c1", "dave", "Dave").await.unwrap();
        assert!(receipt.resumed);
        assert_eq!(receipt.deposit_used, Amount::from_major(20));
        let wallet = svc.guard.wallets().balance("dave").await.unwrap();
        assert_eq!(wallet.deposited, Amount::from_major(30));
    }

    #[tokio::test]
    async fn test_status_rules_and_cancel_refunds() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 25, 4)).await.unwrap();
        fund(&svc, "erin", 25, 0).await;
        svc.join("c1", "erin", "Erin").await.unwrap();

        let err = svc
            .set_status("c1", ContestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));

        svc.set_status("c1", ContestStatus::Live).await.unwrap();
        let change = svc.set_status("c1", ContestStatus::Cancelled).await.unwrap();
        assert_eq!(change.refunds.unwrap().refunded, 1);
        assert!(change.contest.cancelled_processed);
        assert_eq!(change.contest.refund.unwrap().phase, RefundPhase::Done);

        let wallet = svc.guard.wallets().balance("erin").await.unwrap();
        assert_eq!(wallet.deposited, Amount::from_major(25));

        let repeat = svc.set_status("c1", ContestStatus::Cancelled).await.unwrap();
        assert_eq!(repeat.refunds.unwrap().refunded, 0);
        assert_eq!(
            svc.guard.wallets().balance("erin").await.unwrap().deposited,
            Amount::from_major(25)
        );

        let late = svc.join("c1", "frank", "Frank").await.unwrap_err();
        assert!(matches!(late, LedgerError::ContestClosed(_)));
    }

    #[tokio::test]
    async fn test_results_pay_prizes_once() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 10, 4)).await.unwrap();
        for uid in ["gina", "hal"] {
            fund(&svc, uid, 10, 0).await;
            svc.join("c1", uid, uid).await.unwrap();
        }

        let early = svc
            .submit_results("c1", vec![PlayerResult { user_id: "gina".into(), rank: 1, kills: 2 }])
            .await
            .unwrap_err();
        assert!(matches!(early, LedgerError::InvalidTransition(_)));

        svc.set_status("c1", ContestStatus::Live).await.unwrap();
        let results = vec![
            PlayerResult { user_id: "gina".into(), rank: 1, kills: 2 },
            PlayerResult { user_id: "hal".into(), rank: 2, kills: 1 },
        ];
        let report = svc.submit_results("c1", results.clone()).await.unwrap();
        assert_eq!(report.outcome, ResultsOutcome::Credited);
        assert_eq!(report.payouts.len(), 2);

        let gina = svc.guard.wallets().balance("gina").await.unwrap();
        assert_eq!(gina.winnings, Amount::from_major(110));
        let hal = svc.guard.wallets().balance("hal").await.unwrap();
        assert_eq!(hal.winnings, Amount::from_major(5));

        let again = svc.submit_results("c1", results).await.unwrap();
        assert_eq!(again.outcome, ResultsOutcome::AlreadyProcessed);
        assert_eq!(
            svc.guard.wallets().balance("gina").await.unwrap().winnings,
            Amount::from_major(110)
        );

        let contest = svc.load("c1").await.unwrap();
        assert_eq!(contest.status, ContestStatus::Completed);
        assert!(contest.results_credited && contest.payout_done);

        let board = svc.leaderboards.load(Board::Weekly).await.unwrap();
        assert_eq!(board.players["gina"].earnings, Amount::from_major(110));
    }

    #[tokio::test]
    async fn test_results_reject_unknown_and_duplicate_players() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 0, 4)).await.unwrap();
        svc.join("c1", "ivy", "Ivy").await.unwrap();
        svc.set_status("c1", ContestStatus::Live).await.unwrap();

        let stranger = svc
            .submit_results("c1", vec![PlayerResult { user_id: "zed".into(), rank: 1, kills: 0 }])
            .await
            .unwrap_err();
        assert!(matches!(stranger, LedgerError::Validation(_)));

        let dup = svc
            .submit_results(
                "c1",
                vec![
                    PlayerResult { user_id: "ivy".into(), rank: 1, kills: 0 },
                    PlayerResult { user_id: "ivy".into(), rank: 2, kills: 0 },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(dup, LedgerError::Validation(_)));
        assert!(!svc.load("c1").await.unwrap().results_credited);
    }

    #[tokio::test]
    async fn test_stale_reservations_are_settled_by_journal() {
        let (store, svc) = service();
        svc.create_contest(new_contest("c1", 15, 4)).await.unwrap();
        fund(&svc, "paid", 15, 0).await;

        let path = paths::contest("c1").unwrap();
        let mut contest: Contest = store::read_as(store.as_ref(), &path).await.unwrap().unwrap();
        for uid in ["paid", "unpaid"] {
            contest.players.insert(
                uid.to_string(),
                PlayerEntry {
                    display_name: uid.to_string(),
                    state: EntryState::Reserved,
                    deposit_used: Amount::ZERO,
                    winnings_used: Amount::ZERO,
                    joined_at: 0,
                },
            );
        }
        store::write_as(store.as_ref(), &path, &contest).await.unwrap();
        svc.guard
            .wallets()
            .debit_entry_fee("paid", &entry_key("c1", "paid"), Amount::from_major(15))
            .await
            .unwrap();

        let repair = svc
            .settle_stale_reservations(&contest, now_ms(), 60_000)
            .await
            .unwrap();
        assert_eq!(repair, ReservationRepair { completed: 1, released: 1 });

        let contest = svc.load("c1").await.unwrap();
        assert_eq!(contest.players.len(), 1);
        assert_eq!(contest.players["paid"].state, EntryState::Paid);
        assert_eq!(contest.players["paid"].deposit_used, Amount::from_major(15));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_input() {
        let (_, svc) = service();
        svc.create_contest(new_contest("c1", 10, 2)).await.unwrap();
        assert!(matches!(
            svc.create_contest(new_contest("c1", 10, 2)).await,
            Err(LedgerError::InvalidTransition(_))
        ));
        assert!(matches!(
            svc.create_contest(new_contest("c2", 10, 0)).await,
            Err(LedgerError::Validation(_))
        ));
        assert!(svc.create_contest(new_contest("bad/id", 10, 2)).await.is_err());
    }
}
