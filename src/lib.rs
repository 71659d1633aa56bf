//! ElitePros Backend Library
//!
//! Wallet ledger, deposit reconciliation and contest settlement. The binary
//! in `main.rs` only wires configuration, background loops and the HTTP
//! server around these modules.

pub mod api;
pub mod auth;
pub mod config;
pub mod contest;
pub mod deposit;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod leaderboard;
pub mod middleware;
pub mod models;
pub mod money;
pub mod reconcile;
pub mod refund;
pub mod saga;
pub mod store;
pub mod wallet;
pub mod withdraw;

pub use error::{LedgerError, Result};
pub use money::{Amount, WalletDelta};
