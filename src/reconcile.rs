//! Reconciliation sweep
//!
//! Repairs what a crash can leave behind. Every repair goes through the same
//! guarded paths the live operations use, so running the sweep concurrently
//! with traffic (or with another sweep) never moves money twice.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::contest::ContestService;
use crate::deposit::DepositService;
use crate::error::Result;
use crate::guard::{untouched, Claim, Guarded, MoneyGuard, Movement};
use crate::leaderboard::LeaderboardService;
use crate::models::{Board, Contest, ContestStatus, Order, RefundPhase, Transaction, TxStatus, Withdrawal};
use crate::refund::{RefundOutcome, RefundProcessor};
use crate::store::{self, paths, LedgerStore, StorePath};
use crate::withdraw::WithdrawalService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub leases_resumed: u32,
    pub mirrors_repaired: u32,
    pub reservations_completed: u32,
    pub reservations_released: u32,
    pub refunds_resumed: u32,
    pub payouts_resumed: u32,
    pub leaderboards_resumed: u32,
    pub errors: u32,
}

impl SweepReport {
    pub fn repairs(&self) -> u32 {
        self.leases_resumed
            + self.mirrors_repaired
            + self.reservations_completed
            + self.reservations_released
            + self.refunds_resumed
            + self.payouts_resumed
            + self.leaderboards_resumed
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
    deposits: DepositService,
    withdrawals: WithdrawalService,
    contests: ContestService,
    refunds: RefundProcessor,
    leaderboards: LeaderboardService,
    stale_after_ms: i64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        deposits: DepositService,
        withdrawals: WithdrawalService,
        contests: ContestService,
        refunds: RefundProcessor,
        leaderboards: LeaderboardService,
        stale_after_ms: i64,
    ) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
            deposits,
            withdrawals,
            contests,
            refunds,
            leaderboards,
            stale_after_ms,
        }
    }

    pub async fn sweep(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();

        self.sweep_orders(now, &mut report).await;
        self.sweep_withdrawals(now, &mut report).await;
        self.sweep_transactions(now, &mut report).await;
        self.sweep_contests(now, &mut report).await;
        self.sweep_leaderboards(now, &mut report).await;

        if report.repairs() > 0 || report.errors > 0 {
            info!(
                leases = report.leases_resumed,
                mirrors = report.mirrors_repaired,
                completed = report.reservations_completed,
                released = report.reservations_released,
                refunds = report.refunds_resumed,
                payouts = report.payouts_resumed,
                boards = report.leaderboards_resumed,
                errors = report.errors,
                "🧹 Reconciliation sweep finished"
            );
        }
        report
    }

    /// Take over a stale lease and finish it. Returns the settled record.
    async fn finish_stale<T: Guarded + std::fmt::Debug>(&self, path: &StorePath, now: i64) -> Result<Option<T>> {
        match self
            .guard
            .reclaim_stale::<T>(path, now, self.stale_after_ms)
            .await?
        {
            Claim::Acquired(claimed) => match self.guard.drive(path, claimed, &untouched).await? {
                Movement::Completed(record) => {
                    warn!(path = %path, status = record.status().as_str(), "🔧 Finished stale lease");
                    Ok(Some(record))
                }
                other => {
                    warn!(path = %path, ?other, "Stale lease changed hands during repair");
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    async fn sweep_orders(&self, now: i64, report: &mut SweepReport) {
        let orders = match store::list_as::<Order>(self.store.as_ref(), &paths::orders()).await {
            Ok(orders) => orders,
            Err(e) => {
                error!("Failed to list orders: {}", e);
                report.errors += 1;
                return;
            }
        };
        for (path, mut order) in orders {
            if order.status == TxStatus::Processing {
                match self.finish_stale::<Order>(&path, now).await {
                    Ok(Some(settled)) => {
                        report.leases_resumed += 1;
                        order = settled;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        error!(path = %path, "Order repair failed: {}", e);
                        report.errors += 1;
                        continue;
                    }
                }
            }
            if !order.status.is_terminal() {
                continue;
            }
            match self.deposits.mirror(&order).await {
                Ok(true) => report.mirrors_repaired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(order_id = %order.order_id, "Mirror repair failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    async fn sweep_withdrawals(&self, now: i64, report: &mut SweepReport) {
        let withdrawals =
            match store::list_as::<Withdrawal>(self.store.as_ref(), &paths::withdrawals()).await {
                Ok(list) => list,
                Err(e) => {
                    error!("Failed to list withdrawals: {}", e);
                    report.errors += 1;
                    return;
                }
            };
        for (path, mut withdrawal) in withdrawals {
            if withdrawal.status == TxStatus::Processing {
                match self.finish_stale::<Withdrawal>(&path, now).await {
                    Ok(Some(settled)) => {
                        report.leases_resumed += 1;
                        withdrawal = settled;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        error!(path = %path, "Withdrawal repair failed: {}", e);
                        report.errors += 1;
                        continue;
                    }
                }
            }
            match self.withdrawals.mirror(&withdrawal).await {
                Ok(true) => report.mirrors_repaired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(id = %withdrawal.id, "Mirror repair failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Prize, reward and refund transactions carry their own leases.
    async fn sweep_transactions(&self, now: i64, report: &mut SweepReport) {
        let nodes = match self.store.list(&paths::users()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Failed to list users: {}", e);
                report.errors += 1;
                return;
            }
        };
        for (path, value) in nodes {
            if paths::split_transaction_path(&path).is_none() || !is_processing(&value) {
                continue;
            }
            match self.finish_stale::<Transaction>(&path, now).await {
                Ok(Some(_)) => report.leases_resumed += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(path = %path, "Transaction repair failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    async fn sweep_contests(&self, now: i64, report: &mut SweepReport) {
        let contests = match store::list_as::<Contest>(self.store.as_ref(), &paths::contests()).await {
            Ok(list) => list,
            Err(e) => {
                error!("Failed to list contests: {}", e);
                report.errors += 1;
                return;
            }
        };
        for (_, contest) in contests {
            if let Err(e) = self.repair_contest(&contest, now, report).await {
                error!(contest = %contest.id, "Contest repair failed: {}", e);
                report.errors += 1;
            }
        }
    }

    async fn repair_contest(&self, contest: &Contest, now: i64, report: &mut SweepReport) -> Result<()> {
        let stale = |at: i64| now.saturating_sub(at) >= self.stale_after_ms;

        if contest.status == ContestStatus::Cancelled {
            let unfinished = match &contest.refund {
                None => !contest.cancelled_processed,
                Some(run) => run.phase == RefundPhase::Running && stale(run.started_at),
            };
            if unfinished {
                let refund = self.refunds.process_at(&contest.id, now).await?;
                if refund.outcome == RefundOutcome::Refunded {
                    warn!(contest = %contest.id, refunded = refund.refunded, "🔧 Resumed contest refunds");
                    report.refunds_resumed += 1;
                }
            }
            report.reservations_released += self
                .refunds
                .release_stale_reservations(contest, now)
                .await?;
            return Ok(());
        }

        let repair = self
            .contests
            .settle_stale_reservations(contest, now, self.stale_after_ms)
            .await?;
        report.reservations_completed += repair.completed;
        report.reservations_released += repair.released;

        if contest.results_credited && !contest.payout_done && stale(contest.updated_at) {
            warn!(contest = %contest.id, "🔧 Resuming unfinished prize payout");
            self.contests.finish_payout(contest).await?;
            report.payouts_resumed += 1;
        }
        Ok(())
    }

    async fn sweep_leaderboards(&self, now: i64, report: &mut SweepReport) {
        for board in Board::ALL {
            match self.leaderboards.resume_stale(board, now).await {
                Ok(Some(_)) => report.leaderboards_resumed += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(board = board.as_str(), "Leaderboard repair failed: {}", e);
                    report.errors += 1;
                }
            }
        }
    }
}

fn is_processing(value: &Value) -> bool {
    value.get("status").and_then(Value::as_str) == Some(TxStatus::Processing.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contest::{entry_key, NewContest};
    use crate::deposit::DepositSettings;
    use crate::gateway::SandboxGateway;
    use crate::guard::Intent;
    use crate::leaderboard::LeaderboardSettings;
    use crate::models::{now_ms, EntryState, PlayerEntry, PrizeTable, TxKind};
    use crate::money::{Amount, WalletDelta};
    use crate::store::MemoryStore;

    const STALE: i64 = 60_000;

    struct Fixture {
        store: Arc<dyn LedgerStore>,
        guard: MoneyGuard,
        contests: ContestService,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let deposits = DepositService::new(
            store.clone(),
            Arc::new(SandboxGateway::new()),
            DepositSettings::default(),
        );
        let withdrawals = WithdrawalService::new(store.clone());
        let refunds = RefundProcessor::new(store.clone(), STALE);
        let leaderboards = LeaderboardService::new(
            store.clone(),
            LeaderboardSettings {
                stale_after_ms: STALE,
                ..LeaderboardSettings::default()
            },
        );
        let contests = ContestService::new(store.clone(), refunds.clone(), leaderboards.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            deposits,
            withdrawals,
            contests.clone(),
            refunds,
            leaderboards,
            STALE,
        );
        Fixture {
            guard: MoneyGuard::new(store.clone()),
            store,
            contests,
            reconciler,
        }
    }

    fn pending_order(id: &str, uid: &str, major: i64) -> Order {
        Order {
            order_id: id.into(),
            user_id: uid.into(),
            amount: Amount::from_major(major),
            status: TxStatus::Pending,
            created_at: 0,
            updated_at: 0,
            gateway_txn_id: None,
            utr: None,
            payment: None,
            lease: None,
        }
    }

    #[tokio::test]
    async fn test_half_applied_credit_is_finished_once() {
        let fx = fixture();
        let path = paths::order("ORD_1").unwrap();
        store::write_as(fx.store.as_ref(), &path, &pending_order("ORD_1", "u1", 100))
            .await
            .unwrap();
        let intent = Intent::new("u1", "ORD_1", WalletDelta::credit_deposited(Amount::from_major(100)));

        // Crash between the status flip and the wallet credit.
        let claim = fx.guard.claim::<Order>(&path, TxStatus::Pending, &intent).await.unwrap();
        assert!(matches!(claim, Claim::Acquired(_)));

        let early = fx.reconciler.sweep(now_ms()).await;
        assert_eq!(early.leases_resumed, 0);

        let later = now_ms() + 2 * STALE;
        let report = fx.reconciler.sweep(later).await;
        assert_eq!(report.leases_resumed, 1);
        assert_eq!(report.mirrors_repaired, 1);
        assert_eq!(report.errors, 0);

        let again = fx.reconciler.sweep(later + 1).await;
        assert_eq!(again.repairs(), 0);

        let wallet = fx.guard.wallets().balance("u1").await.unwrap();
        assert_eq!(wallet.deposited, Amount::from_major(100));
        let tx: Transaction = store::read_as(fx.store.as_ref(), &paths::transaction("u1", "ORD_1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TxStatus::Success);
        assert_eq!(tx.kind, TxKind::Deposit);
    }

    #[tokio::test]
    async fn test_stale_withdrawal_lease_is_settled_pending() {
        let fx = fixture();
        fx.guard
            .wallets()
            .apply("u2", "seed", WalletDelta::credit_winnings(Amount::from_major(30)))
            .await
            .unwrap();
        let path = paths::withdrawal("WD_1").unwrap();
        let template = Withdrawal {
            id: "WD_1".into(),
            user_id: "u2".into(),
            amount: Amount::from_major(30),
            upi_id: "p@ybl".into(),
            status: TxStatus::Pending,
            created_at: 0,
            updated_at: 0,
            settlement_ref: None,
            reason: None,
            lease: None,
        };
        let intent = Intent::new("u2", "WD_1", WalletDelta::debit_winnings(Amount::from_major(30)))
            .settle_as(TxStatus::Pending, TxStatus::Failed);
        fx.guard.claim_or_insert(&path, &template, &intent).await.unwrap();

        let report = fx.reconciler.sweep(now_ms() + 2 * STALE).await;
        assert_eq!(report.leases_resumed, 1);

        let stored: Withdrawal = store::read_as(fx.store.as_ref(), &path).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Pending);
        assert!(stored.lease.is_none());
        assert_eq!(fx.guard.wallets().balance("u2").await.unwrap().winnings, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_contest_remnants_are_repaired() {
        let fx = fixture();
        fx.contests
            .create_contest(NewContest {
                id: "c1".into(),
                title: "Solo".into(),
                entry_fee: Amount::from_major(10),
                total_slots: 4,
                prizes: PrizeTable::default(),
            })
            .await
            .unwrap();
        fx.guard
            .wallets()
            .apply("p1", "seed", WalletDelta::credit_deposited(Amount::from_major(10)))
            .await
            .unwrap();

        let path = paths::contest("c1").unwrap();
        let mut contest: Contest = store::read_as(fx.store.as_ref(), &path).await.unwrap().unwrap();
        contest.players.insert(
            "p1".into(),
            PlayerEntry {
                display_name: "P1".into(),
                state: EntryState::Reserved,
                deposit_used: Amount::ZERO,
                winnings_used: Amount::ZERO,
                joined_at: 0,
            },
        );
        store::write_as(fx.store.as_ref(), &path, &contest).await.unwrap();
        fx.guard
            .wallets()
            .debit_entry_fee("p1", &entry_key("c1", "p1"), Amount::from_major(10))
            .await
            .unwrap();

        let report = fx.reconciler.sweep(now_ms()).await;
        assert_eq!(report.reservations_completed, 1);
        let contest = fx.contests.load("c1").await.unwrap();
        assert_eq!(contest.players["p1"].state, EntryState::Paid);

        // Cancelled without the refund batch ever starting.
        let mut cancelled = contest.clone();
        cancelled.status = ContestStatus::Cancelled;
        store::write_as(fx.store.as_ref(), &path, &cancelled).await.unwrap();

        let report = fx.reconciler.sweep(now_ms()).await;
        assert_eq!(report.refunds_resumed, 1);
        assert_eq!(
            fx.guard.wallets().balance("p1").await.unwrap().deposited,
            Amount::from_major(10)
        );
        assert_eq!(fx.reconciler.sweep(now_ms()).await.refunds_resumed, 0);
    }

    #[tokio::test]
    async fn test_fee_debited_after_cancel_refund_is_returned() {
        let fx = fixture();
        fx.contests
            .create_contest(NewContest {
                id: "c9".into(),
                title: "Late".into(),
                entry_fee: Amount::from_major(10),
                total_slots: 4,
                prizes: PrizeTable::default(),
            })
            .await
            .unwrap();
        fx.guard
            .wallets()
            .apply("p1", "seed", WalletDelta::credit_deposited(Amount::from_major(10)))
            .await
            .unwrap();

        // The join reserved its slot, then the contest was cancelled and refunded.
        let now = now_ms();
        let path = paths::contest("c9").unwrap();
        let mut contest: Contest = store::read_as(fx.store.as_ref(), &path).await.unwrap().unwrap();
        contest.players.insert(
            "p1".into(),
            PlayerEntry {
                display_name: "P1".into(),
                state: EntryState::Reserved,
                deposit_used: Amount::ZERO,
                winnings_used: Amount::ZERO,
                joined_at: now,
            },
        );
        store::write_as(fx.store.as_ref(), &path, &contest).await.unwrap();
        let change = fx.contests.set_status("c9", ContestStatus::Cancelled).await.unwrap();
        assert_eq!(change.refunds.unwrap().outcome, RefundOutcome::Refunded);
        let cancelled = fx.contests.load("c9").await.unwrap();
        assert!(matches!(&cancelled.refund, Some(run) if run.phase == RefundPhase::Done));

        // The stalled join's debit lands afterwards and never confirms.
        fx.guard
            .wallets()
            .debit_entry_fee("p1", &entry_key("c9", "p1"), Amount::from_major(10))
            .await
            .unwrap();
        assert_eq!(fx.guard.wallets().balance("p1").await.unwrap().deposited, Amount::ZERO);

        // Inside the stale window a live join is left alone.
        let early = fx.reconciler.sweep(now + 1).await;
        assert_eq!(early.reservations_released, 0);
        assert_eq!(fx.guard.wallets().balance("p1").await.unwrap().deposited, Amount::ZERO);

        let later = now + 10 * STALE;
        let report = fx.reconciler.sweep(later).await;
        assert_eq!(report.reservations_released, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(
            fx.guard.wallets().balance("p1").await.unwrap().deposited,
            Amount::from_major(10)
        );
        let refund: Transaction = store::read_as(
            fx.store.as_ref(),
            &paths::transaction("p1", &crate::refund::refund_tx_id("c9", "p1")).unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(refund.status, TxStatus::Success);
        assert_eq!(refund.amount, Amount::from_major(10).minor());

        let again = fx.reconciler.sweep(later + 1).await;
        assert_eq!(again.reservations_released, 0);
        assert_eq!(
            fx.guard.wallets().balance("p1").await.unwrap().deposited,
            Amount::from_major(10)
        );
    }
}
