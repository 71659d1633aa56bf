//! Money types
//!
//! Amounts are integer minor units (paise). Payloads arrive in major units as
//! JSON numbers or strings and are validated here before anything touches the
//! store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{LedgerError, Result};

const MINOR_PER_MAJOR: i64 = 100;
/// Upper bound for a single amount (1e10 major units).
const MAX_MINOR: i64 = 1_000_000_000_000;

/// Non-negative amount in minor units. Deserializing goes through
/// [`Amount::from_minor`], so stored nodes and request bodies get the same
/// range check.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor(minor: i64) -> Result<Self> {
        if !(0..=MAX_MINOR).contains(&minor) {
            return Err(LedgerError::validation(format!(
                "amount out of range: {minor}"
            )));
        }
        Ok(Amount(minor))
    }

    /// Whole major units; saturates into the valid range.
    pub fn from_major(major: i64) -> Self {
        Amount(major.saturating_mul(MINOR_PER_MAJOR).clamp(0, MAX_MINOR))
    }

    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0
            .checked_sub(other.0)
            .filter(|v| *v >= 0)
            .map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount((self.0 - other.0).max(0))
    }

    pub fn min(self, other: Amount) -> Amount {
        Amount(self.0.min(other.0))
    }

    pub fn checked_mul(self, n: u32) -> Option<Amount> {
        self.0
            .checked_mul(n as i64)
            .filter(|v| *v <= MAX_MINOR)
            .map(Amount)
    }

    /// Parse a major-unit decimal string such as `"100"` or `"99.5"`.
    pub fn parse_major(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(LedgerError::validation("amount is empty"));
        }
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f.trim_end_matches('0')),
            None => (s, ""),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::validation(format!("invalid amount: {raw}")));
        }
        if frac_part.len() > 2 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::validation(format!(
                "amount has more than two decimals: {raw}"
            )));
        }
        if int_part.len() > 12 {
            return Err(LedgerError::validation(format!("amount too large: {raw}")));
        }

        let major: i64 = int_part
            .parse()
            .map_err(|_| LedgerError::validation(format!("invalid amount: {raw}")))?;
        let frac: i64 = if frac_part.is_empty() {
            0
        } else {
            let padded = format!("{frac_part:0<2}");
            padded
                .parse()
                .map_err(|_| LedgerError::validation(format!("invalid amount: {raw}")))?
        };

        Amount::from_minor(major * MINOR_PER_MAJOR + frac)
    }

    /// Accepts the loosely-typed amount field of a request body.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => Amount::parse_major(&n.to_string()),
            Value::String(s) => Amount::parse_major(s),
            Value::Null => Err(LedgerError::validation("amount is required")),
            other => Err(LedgerError::validation(format!(
                "amount must be a number or string, got {other}"
            ))),
        }
    }

    /// Same as [`Amount::from_json`] but rejects zero.
    pub fn positive_from_json(value: &Value) -> Result<Self> {
        let amount = Amount::from_json(value)?;
        if amount.is_zero() {
            return Err(LedgerError::validation("amount must be greater than zero"));
        }
        Ok(amount)
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(minor: i64) -> Result<Self> {
        Amount::from_minor(minor)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> i64 {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02}",
            self.0 / MINOR_PER_MAJOR,
            self.0 % MINOR_PER_MAJOR
        )
    }
}

/// Signed change applied to both wallet buckets in one compare-and-swap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDelta {
    pub deposited: i64,
    pub winnings: i64,
}

impl WalletDelta {
    pub fn credit_deposited(amount: Amount) -> Self {
        Self {
            deposited: amount.minor(),
            winnings: 0,
        }
    }

    pub fn credit_winnings(amount: Amount) -> Self {
        Self {
            deposited: 0,
            winnings: amount.minor(),
        }
    }

    pub fn debit_winnings(amount: Amount) -> Self {
        Self {
            deposited: 0,
            winnings: -amount.minor(),
        }
    }

    pub fn total(&self) -> i64 {
        self.deposited + self.winnings
    }

    pub fn negate(&self) -> Self {
        Self {
            deposited: -self.deposited,
            winnings: -self.winnings,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.deposited == 0 && self.winnings == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_major_units() {
        assert_eq!(Amount::parse_major("100").unwrap().minor(), 10_000);
        assert_eq!(Amount::parse_major("99.5").unwrap().minor(), 9_950);
        assert_eq!(Amount::parse_major("0.05").unwrap().minor(), 5);
        assert_eq!(Amount::parse_major(" 12.30 ").unwrap().minor(), 1_230);
        assert_eq!(Amount::parse_major("1000.0").unwrap().minor(), 100_000);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "-5", "abc", "1.234", "1e3", ".5", "12,5", "NaN"] {
            assert!(Amount::parse_major(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_from_json_accepts_numbers_and_strings() {
        assert_eq!(Amount::from_json(&json!(100)).unwrap().minor(), 10_000);
        assert_eq!(Amount::from_json(&json!(100.5)).unwrap().minor(), 10_050);
        assert_eq!(Amount::from_json(&json!("250")).unwrap().minor(), 25_000);
        assert!(Amount::from_json(&json!(-1)).is_err());
        assert!(Amount::from_json(&json!(null)).is_err());
        assert!(Amount::from_json(&json!(true)).is_err());
        assert!(Amount::positive_from_json(&json!(0)).is_err());
    }

    #[test]
    fn test_checked_arithmetic_never_goes_negative() {
        let ten = Amount::from_major(10);
        let five = Amount::from_major(5);
        assert_eq!(ten.checked_sub(five), Some(five));
        assert_eq!(five.checked_sub(ten), None);
        assert_eq!(five.saturating_sub(ten), Amount::ZERO);
        assert_eq!(ten.to_string(), "10.00");
    }

    #[test]
    fn test_deserialize_enforces_range() {
        assert_eq!(serde_json::from_value::<Amount>(json!(5000)).unwrap().minor(), 5_000);
        assert_eq!(serde_json::to_value(Amount::from_major(3)).unwrap(), json!(300));
        assert!(serde_json::from_value::<Amount>(json!(-5000)).is_err());
        assert!(serde_json::from_value::<Amount>(json!(MAX_MINOR + 1)).is_err());
    }
}
