//! Period leaderboards and the reward distributor
//!
//! Each board is a single node. A distribution run:
//! lock + freeze (one CAS, records the period being paid) → claim each rank
//! at `reward_claims/{board}/{period}/{rank}` and pay its holder through a
//! guarded `REWARD_{board}_{period}_{rank}` transaction → reset and unlock
//! (CAS on the lock token). A failed run unlocks but stays frozen, so the
//! retry ranks the same players and a claimed rank is never paid to anyone
//! else.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::guard::{untouched, Intent, MoneyGuard, Movement};
use crate::models::{Board, Leaderboard, RewardClaim, Transaction, TxKind, TxRefs, TxStatus};
use crate::money::{Amount, WalletDelta};
use crate::store::{self, paths, Decision, LedgerStore, Outcome};

#[derive(Debug, Clone)]
pub struct LeaderboardSettings {
    pub top_n: usize,
    pub utc_offset_minutes: i32,
    pub stale_after_ms: i64,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            top_n: 10,
            utc_offset_minutes: 330,
            stale_after_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub rank: u32,
    pub user_id: String,
    pub amount: Amount,
    pub newly_credited: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub board: Board,
    pub period: String,
    pub outcome: DistributionOutcome,
    pub payouts: Vec<Payout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionOutcome {
    Distributed,
    AlreadyDistributed,
    Locked,
}

fn local_date(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    FixedOffset::east_opt(utc_offset_minutes * 60)
        .map(|offset| now.with_timezone(&offset).date_naive())
        .unwrap_or_else(|| now.date_naive())
}

/// Key of the most recently closed period of `board` as of `now`.
pub fn closed_period(board: Board, now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    let today = local_date(now, utc_offset_minutes);
    match board {
        Board::Today => (today - ChronoDuration::days(1)).format("%Y-%m-%d").to_string(),
        Board::Weekly => {
            // Weeks run Sunday..Saturday; the current one started on `this_sunday`.
            let since_sunday = today.weekday().num_days_from_sunday() as i64;
            let this_sunday = today - ChronoDuration::days(since_sunday);
            let closed_start = this_sunday - ChronoDuration::days(7);
            format!("wk-{}", closed_start.format("%Y-%m-%d"))
        }
        Board::Monthly => {
            let (year, month) = if today.month() == 1 {
                (today.year() - 1, 12)
            } else {
                (today.year(), today.month() - 1)
            };
            format!("{year:04}-{month:02}")
        }
    }
}

pub fn reward_tx_id(board: Board, period: &str, rank: u32) -> String {
    format!("REWARD_{}_{}_{}", board.as_str(), period, rank)
}

enum Lock {
    Acquired { period: String, token: String, snapshot: Leaderboard },
    AlreadyDone(String),
    Held(String),
}

#[derive(Clone)]
pub struct LeaderboardService {
    store: Arc<dyn LedgerStore>,
    guard: MoneyGuard,
    settings: LeaderboardSettings,
}

impl LeaderboardService {
    pub fn new(store: Arc<dyn LedgerStore>, settings: LeaderboardSettings) -> Self {
        Self {
            guard: MoneyGuard::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &LeaderboardSettings {
        &self.settings
    }

    pub async fn load(&self, board: Board) -> Result<Leaderboard> {
        let path = paths::leaderboard(board.as_str())?;
        Ok(store::read_as::<Leaderboard>(self.store.as_ref(), &path)
            .await?
            .unwrap_or_default())
    }

    /// Add earnings to every board. While a board is frozen they are parked
    /// in `pending` and carried into the next period.
    pub async fn record_earnings(&self, user_id: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        paths::wallet(user_id)?;
        for board in Board::ALL {
            let path = paths::leaderboard(board.as_str())?;
            store::mutate_as::<Leaderboard, _>(self.store.as_ref(), &path, |current| {
                let mut lb = current.unwrap_or_default();
                let bucket = if lb.frozen {
                    &mut lb.pending
                } else {
                    &mut lb.players
                };
                let entry = bucket.entry(user_id.to_string()).or_default();
                match entry.earnings.checked_add(amount) {
                    Some(total) => {
                        entry.earnings = total;
                        Decision::Set(lb)
                    }
                    None => Decision::Abort,
                }
            })
            .await?;
        }
        debug!(user = user_id, %amount, "earnings recorded");
        Ok(())
    }

    pub async fn set_rewards(&self, board: Board, rewards: BTreeMap<u32, Amount>) -> Result<Leaderboard> {
        if rewards.keys().any(|rank| *rank == 0) {
            return Err(LedgerError::validation("ranks start at 1"));
        }
        let path = paths::leaderboard(board.as_str())?;
        let outcome = store::mutate_as::<Leaderboard, _>(self.store.as_ref(), &path, |current| {
            let mut lb = current.unwrap_or_default();
            lb.rewards = rewards.clone();
            Decision::Set(lb)
        })
        .await?;
        info!(board = board.as_str(), ranks = rewards.len(), "🏆 Reward table updated");
        match outcome {
            Outcome::Committed { after, .. } => Ok(after.unwrap_or_default()),
            Outcome::Aborted(current) => Ok(current.unwrap_or_default()),
        }
    }

    /// Distribute every board whose closed period has not been paid yet.
    /// A board that has never closed a period starts counting from `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<DistributionReport> {
        let mut reports = Vec::new();
        for board in Board::ALL {
            let period = closed_period(board, now, self.settings.utc_offset_minutes);
            let due = match self.load(board).await {
                Ok(lb) if lb.last_period.is_none() && !lb.lock => {
                    if let Err(e) = self.start_counting(board, &period).await {
                        warn!(board = board.as_str(), "Failed to initialise period: {}", e);
                    }
                    false
                }
                Ok(lb) => lb.last_period.as_deref() != Some(period.as_str()),
                Err(e) => {
                    warn!(board = board.as_str(), "Leaderboard unreadable: {}", e);
                    false
                }
            };
            if !due {
                continue;
            }
            match self.distribute(board, now).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(board = board.as_str(), "❌ Distribution failed: {}", e),
            }
        }
        reports
    }

    async fn start_counting(&self, board: Board, period: &str) -> Result<()> {
        let path = paths::leaderboard(board.as_str())?;
        store::mutate_as::<Leaderboard, _>(self.store.as_ref(), &path, |current| {
            let mut lb = current.unwrap_or_default();
            if lb.last_period.is_some() || lb.lock {
                return Decision::Abort;
            }
            lb.last_period = Some(period.to_string());
            Decision::Set(lb)
        })
        .await?;
        debug!(board = board.as_str(), period, "leaderboard period initialised");
        Ok(())
    }

    /// Pay the closed period.
    pub async fn distribute(&self, board: Board, now: DateTime<Utc>) -> Result<DistributionReport> {
        let period = closed_period(board, now, self.settings.utc_offset_minutes);
        self.run(board, period, now.timestamp_millis()).await
    }

    /// Finish a run whose lock holder disappeared. Returns `None` when the
    /// board is not stuck.
    pub async fn resume_stale(&self, board: Board, now_millis: i64) -> Result<Option<DistributionReport>> {
        let lb = self.load(board).await?;
        let stale = lb.lock
            && lb
                .locked_at
                .map_or(true, |at| now_millis.saturating_sub(at) >= self.settings.stale_after_ms);
        if !stale {
            return Ok(None);
        }
        let Some(period) = lb.lock_period.clone() else {
            return Ok(None);
        };
        warn!(board = board.as_str(), period = %period, "♻️ Taking over stale leaderboard lock");
        self.run(board, period, now_millis).await.map(Some)
    }

    async fn run(&self, board: Board, period: String, now_millis: i64) -> Result<DistributionReport> {
        let (period, token, snapshot) = match self.lock(board, &period, now_millis).await? {
            Lock::Acquired {
                period,
                token,
                snapshot,
            } => (period, token, snapshot),
            Lock::AlreadyDone(period) => {
                return Ok(DistributionReport {
                    board,
                    period,
                    outcome: DistributionOutcome::AlreadyDistributed,
                    payouts: Vec::new(),
                })
            }
            Lock::Held(period) => {
                info!(board = board.as_str(), "{} already locked", board.as_str());
                return Ok(DistributionReport {
                    board,
                    period,
                    outcome: DistributionOutcome::Locked,
                    payouts: Vec::new(),
                });
            }
        };

        match self.pay(board, &period, &snapshot).await {
            Ok(payouts) => {
                self.release(board, &token, Some(&period)).await?;
                info!(
                    board = board.as_str(),
                    period = %period,
                    winners = payouts.len(),
                    "🏆 {} leaderboard processed successfully",
                    board.as_str()
                );
                Ok(DistributionReport {
                    board,
                    period,
                    outcome: DistributionOutcome::Distributed,
                    payouts,
                })
            }
            Err(e) => {
                error!(board = board.as_str(), period = %period, "{} failed: {}", board.as_str(), e);
                if let Err(release_err) = self.release(board, &token, None).await {
                    error!(board = board.as_str(), "Failed to release lock: {}", release_err);
                }
                Err(e)
            }
        }
    }

    async fn lock(&self, board: Board, period: &str, now_millis: i64) -> Result<Lock> {
        let path = paths::leaderboard(board.as_str())?;
        let token = Uuid::new_v4().simple().to_string();
        let stale_after = self.settings.stale_after_ms;

        let outcome = store::mutate_as::<Leaderboard, _>(self.store.as_ref(), &path, |current| {
            let mut lb = current.unwrap_or_default();
            if lb.lock {
                let stale = lb
                    .locked_at
                    .map_or(true, |at| now_millis.saturating_sub(at) >= stale_after);
                // A takeover only ever finishes the period the dead run started.
                if !stale || lb.lock_period.as_deref().is_some_and(|p| p != period) {
                    return Decision::Abort;
                }
            } else if lb.last_period.as_deref() == Some(period) {
                return Decision::Abort;
            }
            lb.lock = true;
            lb.frozen = true;
            lb.locked_at = Some(now_millis);
            lb.lock_token = Some(token.clone());
            lb.lock_period = Some(period.to_string());
            Decision::Set(lb)
        })
        .await?;

        Ok(match outcome {
            Outcome::Committed { after, .. } => Lock::Acquired {
                period: period.to_string(),
                token,
                snapshot: after.unwrap_or_default(),
            },
            Outcome::Aborted(current) => {
                let lb = current.unwrap_or_default();
                if lb.lock {
                    Lock::Held(lb.lock_period.unwrap_or_else(|| period.to_string()))
                } else {
                    Lock::AlreadyDone(period.to_string())
                }
            }
        })
    }

    async fn pay(&self, board: Board, period: &str, snapshot: &Leaderboard) -> Result<Vec<Payout>> {
        let mut payouts = Vec::new();
        for (idx, (user_id, _earnings)) in snapshot.ranked(self.settings.top_n).into_iter().enumerate() {
            let rank = idx as u32 + 1;
            let amount = snapshot.rewards.get(&rank).copied().unwrap_or(Amount::ZERO);
            if amount.is_zero() {
                continue;
            }

            let claim = self.claim_rank(board, period, rank, &user_id, amount).await?;
            if claim.user_id != user_id {
                warn!(
                    board = board.as_str(),
                    period,
                    rank,
                    holder = %claim.user_id,
                    ranked = %user_id,
                    "Rank already claimed, finishing the holder's reward"
                );
            }
            let RewardClaim { user_id, amount, .. } = claim;

            let tx_id = reward_tx_id(board, period, rank);
            let path = paths::transaction(&user_id, &tx_id)?;
            let template = Transaction::new(tx_id.clone(), user_id.clone(), TxKind::Reward, amount.minor())
                .with_refs(TxRefs {
                    leaderboard: Some(board.as_str().to_string()),
                    period: Some(period.to_string()),
                    rank: Some(rank),
                    ..TxRefs::default()
                })
                .with_note("Leaderboard Reward");
            let intent = Intent::new(user_id.clone(), tx_id.clone(), WalletDelta::credit_winnings(amount));

            let movement = self
                .guard
                .run_new::<Transaction>(&path, &template, &intent, &untouched)
                .await?;
            let newly_credited = match &movement {
                Movement::Completed(_) => true,
                Movement::AlreadySettled(tx) if tx.status == TxStatus::Success => false,
                Movement::AlreadySettled(_) => {
                    return Err(LedgerError::InvalidTransition(format!(
                        "reward {tx_id} settled without credit"
                    )))
                }
                Movement::InFlight(_)
                | Movement::Superseded
                | Movement::Missing
                | Movement::Unexpected(_) => {
                    return Err(LedgerError::Busy(tx_id));
                }
            };
            payouts.push(Payout {
                rank,
                user_id,
                amount,
                newly_credited,
            });
        }
        Ok(payouts)
    }

    /// Record `user_id` as the holder of `rank`, or return the existing holder.
    async fn claim_rank(
        &self,
        board: Board,
        period: &str,
        rank: u32,
        user_id: &str,
        amount: Amount,
    ) -> Result<RewardClaim> {
        let path = paths::reward_claim(board.as_str(), period, rank)?;
        let claim = RewardClaim {
            user_id: user_id.to_string(),
            amount,
            claimed_at: Utc::now().timestamp_millis(),
        };
        let outcome = store::mutate_as::<RewardClaim, _>(self.store.as_ref(), &path, |current| {
            match current {
                None => Decision::Set(claim.clone()),
                Some(_) => Decision::Abort,
            }
        })
        .await?;
        let holder = match outcome {
            Outcome::Committed { after, .. } => after,
            Outcome::Aborted(current) => current,
        };
        holder.ok_or_else(|| LedgerError::Busy(path.to_string()))
    }

    /// Unlock. With `finished`, the paid board is replaced by whatever
    /// accumulated while frozen and unfrozen. Without it the board stays
    /// frozen with its snapshot and parked earnings untouched.
    async fn release(&self, board: Board, token: &str, finished: Option<&str>) -> Result<()> {
        let path = paths::leaderboard(board.as_str())?;
        let outcome = store::mutate_as::<Leaderboard, _>(self.store.as_ref(), &path, |current| {
            let Some(mut lb) = current else {
                return Decision::Abort;
            };
            if lb.lock_token.as_deref() != Some(token) {
                return Decision::Abort;
            }
            if let Some(period) = finished {
                lb.players = std::mem::take(&mut lb.pending);
                lb.last_period = Some(period.to_string());
                lb.frozen = false;
            }
            lb.lock = false;
            lb.locked_at = None;
            lb.lock_token = None;
            lb.lock_period = None;
            Decision::Set(lb)
        })
        .await?;
        if !outcome.is_committed() {
            warn!(board = board.as_str(), "Lock was taken over before release");
        }
        Ok(())
    }
}
