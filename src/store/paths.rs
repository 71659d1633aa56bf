//! Store path layout
//!
//! ```text
//! users/{uid}/wallet
//! users/{uid}/transactions/{txid}
//! orders/{orderId}
//! contests/{contestId}
//! withdrawals/{withdrawalId}
//! leaderboards/{board}
//! ```

use std::fmt;

use super::StoreError;
use crate::error::{LedgerError, Result};

const MAX_SEGMENT_LEN: usize = 128;

/// Validated `/`-joined path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

pub fn validate_segment(segment: &str) -> std::result::Result<(), StoreError> {
    let ok = !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(segment.to_string()))
    }
}

impl StorePath {
    pub fn from_segments<I, S>(segments: I) -> std::result::Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for seg in segments {
            let seg = seg.as_ref();
            validate_segment(seg)?;
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(seg);
        }
        if joined.is_empty() {
            return Err(StoreError::InvalidPath(String::new()));
        }
        Ok(Self(joined))
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, StoreError> {
        Self::from_segments(raw.split('/'))
    }

    pub fn child(&self, segment: &str) -> std::result::Result<Self, StoreError> {
        validate_segment(segment)?;
        Ok(Self(format!("{}/{}", self.0, segment)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn last(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Inclusive lower / exclusive upper key bounds covering every descendant.
    /// `'0'` is the byte right after `'/'`.
    pub(crate) fn descendant_range(&self) -> (String, String) {
        (format!("{}/", self.0), format!("{}0", self.0))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn build<const N: usize>(segments: [&str; N]) -> Result<StorePath> {
    StorePath::from_segments(segments).map_err(|e| match e {
        StoreError::InvalidPath(seg) => {
            LedgerError::validation(format!("invalid identifier {seg:?}"))
        }
        other => LedgerError::Store(other),
    })
}

pub fn users() -> StorePath {
    StorePath("users".to_string())
}

pub fn wallet(uid: &str) -> Result<StorePath> {
    build(["users", uid, "wallet"])
}

pub fn transactions(uid: &str) -> Result<StorePath> {
    build(["users", uid, "transactions"])
}

pub fn transaction(uid: &str, tx_id: &str) -> Result<StorePath> {
    build(["users", uid, "transactions", tx_id])
}

pub fn orders() -> StorePath {
    StorePath("orders".to_string())
}

pub fn order(order_id: &str) -> Result<StorePath> {
    build(["orders", order_id])
}

pub fn contests() -> StorePath {
    StorePath("contests".to_string())
}

pub fn contest(contest_id: &str) -> Result<StorePath> {
    build(["contests", contest_id])
}

pub fn withdrawals() -> StorePath {
    StorePath("withdrawals".to_string())
}

pub fn withdrawal(withdrawal_id: &str) -> Result<StorePath> {
    build(["withdrawals", withdrawal_id])
}

pub fn leaderboards() -> StorePath {
    StorePath("leaderboards".to_string())
}

pub fn leaderboard(board: &str) -> Result<StorePath> {
    build(["leaderboards", board])
}

/// Holder of one paid rank, outside the board node so resets never touch it.
pub fn reward_claim(board: &str, period: &str, rank: u32) -> Result<StorePath> {
    build(["reward_claims", board, period, &rank.to_string()])
}

/// `users/{uid}/transactions/{txid}` -> `(uid, txid)`.
pub fn split_transaction_path(path: &StorePath) -> Option<(&str, &str)> {
    let mut segs = path.segments();
    match (segs.next(), segs.next(), segs.next(), segs.next(), segs.next()) {
        (Some("users"), Some(uid), Some("transactions"), Some(tx), None) => Some((uid, tx)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_produce_expected_layout() {
        assert_eq!(wallet("u1").unwrap().as_str(), "users/u1/wallet");
        assert_eq!(
            transaction("u1", "ORD_1_u1").unwrap().as_str(),
            "users/u1/transactions/ORD_1_u1"
        );
        assert_eq!(leaderboard("weekly").unwrap().last(), "weekly");
        assert_eq!(
            reward_claim("weekly", "wk-2026-10-11", 2).unwrap().as_str(),
            "reward_claims/weekly/wk-2026-10-11/2"
        );
    }

    #[test]
    fn test_rejects_segments_that_escape_subtree() {
        for bad in ["", "a/b", "..", "a.b", "a b", "$x", "#"] {
            assert!(wallet(bad).is_err(), "accepted {bad:?}");
        }
        assert!(matches!(
            order("x/y"),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_split_transaction_path() {
        let p = transaction("abc", "REFUND_c1_abc").unwrap();
        assert_eq!(split_transaction_path(&p), Some(("abc", "REFUND_c1_abc")));
        assert_eq!(split_transaction_path(&wallet("abc").unwrap()), None);
    }

    #[test]
    fn test_descendant_range_excludes_siblings_with_shared_prefix() {
        let (lo, hi) = StorePath::parse("users/u1").unwrap().descendant_range();
        assert!("users/u1/wallet" >= lo.as_str() && "users/u1/wallet" < hi.as_str());
        assert!(!("users/u10/wallet" >= lo.as_str() && "users/u10/wallet" < hi.as_str()));
    }
}
