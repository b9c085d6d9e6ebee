//! Amounts and fixed-point multipliers.
//!
//! Money is carried as integer minor units. Multipliers are stored in
//! hundredths so `Multiplier(250)` reads as `2.50x`; every payout is
//! floored, never rounded up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;

/// Unsigned amount in minor currency units.
pub type Amount = u64;

/// Signed ledger delta in minor currency units.
pub type Delta = i64;

/// Multiplier expressed in hundredths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u32);

impl Multiplier {
    pub const ONE: Self = Self(100);

    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Payout for a stake at this multiplier: `floor(amount * m / 100)`.
    pub fn payout(self, amount: Amount) -> Amount {
        let raw = (amount as u128) * (self.0 as u128) / 100;
        u64::try_from(raw).unwrap_or(u64::MAX)
    }

    pub fn saturating_add(self, hundredths: u32) -> Self {
        Self(self.0.saturating_add(hundredths))
    }

    pub fn clamp_to(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0.max(min.0)))
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ParseMultiplierError {
    #[error("multiplier is empty")]
    Empty,
    #[error("multiplier has more than two decimal places")]
    TooPrecise,
    #[error("multiplier is not a number: {0}")]
    Invalid(String),
    #[error("multiplier is too large")]
    Overflow,
}

impl FromStr for Multiplier {
    type Err = ParseMultiplierError;

    /// Parses `2.5`, `2.50` and `2.50x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(['x', 'X']);
        if trimmed.is_empty() {
            return Err(ParseMultiplierError::Empty);
        }
        let (whole, frac) = match trimmed.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (trimmed, ""),
        };
        if frac.len() > 2 {
            return Err(ParseMultiplierError::TooPrecise);
        }
        let invalid = || ParseMultiplierError::Invalid(s.to_string());
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole: u32 = whole.parse().map_err(|_| ParseMultiplierError::Overflow)?;
        let frac: u32 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };
        whole
            .checked_mul(100)
            .and_then(|h| h.checked_add(frac))
            .map(Self)
            .ok_or(ParseMultiplierError::Overflow)
    }
}

/// `amount * bps / 10_000`, floored.
pub fn basis_points(amount: Amount, bps: u64) -> Amount {
    let raw = (amount as u128) * (bps as u128) / 10_000;
    u64::try_from(raw).unwrap_or(u64::MAX)
}
