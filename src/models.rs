//! Ledger entities
//!
//! Everything persisted in the ledger store. Field names are camelCase on the
//! wire to stay compatible with the document layout the app clients read.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::money::{Amount, WalletDelta};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Deposit,
    Withdrawal,
    ContestEntry,
    Refund,
    Reward,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdrawal => "withdrawal",
            TxKind::ContestEntry => "contest_entry",
            TxKind::Refund => "refund",
            TxKind::Reward => "reward",
        }
    }
}

/// Status shared by every guarded record. `Processing` is the in-flight
/// marker held under a [`Lease`]; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Processing,
    Success,
    Rejected,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Rejected | TxStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::Processing => 1,
            TxStatus::Success | TxStatus::Rejected | TxStatus::Failed => 2,
        }
    }

    /// Monotone order: never back to an earlier stage, never off a terminal.
    pub fn can_advance_to(&self, next: TxStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Processing => "processing",
            TxStatus::Success => "success",
            TxStatus::Rejected => "rejected",
            TxStatus::Failed => "failed",
        }
    }
}

/// Ownership of an in-flight money movement. Carries everything needed to
/// replay the wallet step, so a stale lease can be finished by anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub token: String,
    pub at: i64,
    pub user_id: String,
    /// Wallet journal key.
    pub entry: String,
    pub delta: WalletDelta,
    pub on_success: TxStatus,
    pub on_insufficient: TxStatus,
}

/// External and internal references attached to a transaction for audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_txn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TxKind,
    /// Signed minor units; negative is a debit.
    pub amount: i64,
    pub status: TxStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub refs: TxRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, kind: TxKind, amount: i64) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            kind,
            amount,
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
            refs: TxRefs::default(),
            note: None,
            lease: None,
        }
    }

    pub fn with_refs(mut self, refs: TxRefs) -> Self {
        self.refs = refs;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Deposit order, keyed by the gateway order id. The stored `amount` is the
/// only amount ever credited for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub amount: Amount,
    pub status: TxStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_txn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utr: Option<String>,
    /// Redirect / QR payload returned by the gateway at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl Order {
    pub fn is_locked(&self) -> bool {
        self.lease.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestStatus {
    Upcoming,
    Live,
    Completed,
    Cancelled,
}

impl ContestStatus {
    pub fn can_transition_to(&self, next: ContestStatus) -> bool {
        use ContestStatus::*;
        matches!(
            (self, next),
            (Upcoming, Live) | (Live, Completed) | (Upcoming, Cancelled) | (Live, Cancelled)
        )
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "upcoming" => Some(ContestStatus::Upcoming),
            "live" => Some(ContestStatus::Live),
            "completed" => Some(ContestStatus::Completed),
            "cancelled" | "canceled" => Some(ContestStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Slot held, fee not yet confirmed.
    Reserved,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntry {
    pub display_name: String,
    pub state: EntryState,
    pub deposit_used: Amount,
    pub winnings_used: Amount,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeTable {
    #[serde(default)]
    pub ranks: BTreeMap<u32, Amount>,
    #[serde(default)]
    pub per_kill: Amount,
}

impl PrizeTable {
    pub fn prize_for(&self, rank: u32, kills: u32) -> Option<Amount> {
        let rank_prize = self.ranks.get(&rank).copied().unwrap_or(Amount::ZERO);
        self.per_kill.checked_mul(kills)?.checked_add(rank_prize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundPhase {
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRun {
    pub phase: RefundPhase,
    pub token: String,
    pub started_at: i64,
    #[serde(default)]
    pub refunded: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contest {
    pub id: String,
    pub title: String,
    pub entry_fee: Amount,
    pub total_slots: u32,
    #[serde(default)]
    pub players: BTreeMap<String, PlayerEntry>,
    pub status: ContestStatus,
    #[serde(default)]
    pub results_credited: bool,
    #[serde(default)]
    pub cancelled_processed: bool,
    #[serde(default)]
    pub prizes: PrizeTable,
    /// Latched together with `results_credited`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PlayerResult>,
    #[serde(default)]
    pub payout_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundRun>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contest {
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.total_slots as usize
    }
}

/// One line of an admin result submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub user_id: String,
    pub rank: u32,
    #[serde(default)]
    pub kills: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub id: String,
    pub user_id: String,
    pub amount: Amount,
    pub upi_id: String,
    pub status: TxStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

/// Leaderboard periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Board {
    Today,
    Weekly,
    Monthly,
}

impl Board {
    pub const ALL: [Board; 3] = [Board::Today, Board::Weekly, Board::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Board::Today => "today",
            Board::Weekly => "weekly",
            Board::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "today" | "daily" => Some(Board::Today),
            "weekly" => Some(Board::Weekly),
            "monthly" => Some(Board::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardEntry {
    pub earnings: Amount,
}

/// First writer wins; a rank of a period is paid to its holder only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    pub user_id: String,
    pub amount: Amount,
    pub claimed_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    #[serde(default)]
    pub players: BTreeMap<String, BoardEntry>,
    /// Earnings that arrived while the board was frozen.
    #[serde(default)]
    pub pending: BTreeMap<String, BoardEntry>,
    #[serde(default)]
    pub rewards: BTreeMap<u32, Amount>,
    #[serde(default)]
    pub lock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    /// Period the current lock holder is paying out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_period: Option<String>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_period: Option<String>,
}

impl Leaderboard {
    /// Highest earnings first, ties broken by user id.
    pub fn ranked(&self, top_n: usize) -> Vec<(String, Amount)> {
        let mut rows: Vec<(String, Amount)> = self
            .players
            .iter()
            .map(|(uid, e)| (uid.clone(), e.earnings))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(top_n);
        rows
    }
}
