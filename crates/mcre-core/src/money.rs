//! Fixed-point money helpers.
//!
//! All monetary values are `rust_decimal::Decimal`. Rates are bounded to `[0, 1]` at
//! construction so downstream arithmetic never has to re-check them.

use crate::{McreError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default smallest currency unit: two decimal places (cents, kobo).
pub const DEFAULT_CURRENCY_SCALE: u32 = 2;

/// Upper bound on configurable currency scale.
pub const MAX_CURRENCY_SCALE: u32 = 8;

/// A fraction in `[0, 1]` (correct-by-construction).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Rate(Decimal);

impl Rate {
    pub const ZERO: Rate = Rate(Decimal::ZERO);
    pub const ONE: Rate = Rate(Decimal::ONE);

    /// Constructs a bounded rate.
    ///
    /// Preconditions:
    /// - `0 <= v <= 1` (else returns an error; fail-closed).
    pub fn new(v: Decimal) -> Result<Rate> {
        if v.is_sign_negative() && !v.is_zero() {
            return Err(McreError::Validation(format!("rate must not be negative: {v}")));
        }
        if v > Decimal::ONE {
            return Err(McreError::Validation(format!("rate out of range: {v} > 1")));
        }
        Ok(Rate(v.normalize()))
    }

    /// Rate from basis points; `bps <= 10_000`.
    pub fn from_bps(bps: u32) -> Result<Rate> {
        Rate::new(Decimal::new(i64::from(bps), 4))
    }

    pub fn get(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// `amount × rate`, rounded down to `scale` decimal places.
    pub fn apply(self, amount: Decimal, scale: u32) -> Decimal {
        floor_to_scale(amount * self.0, scale)
    }
}

impl TryFrom<Decimal> for Rate {
    type Error = McreError;
    fn try_from(value: Decimal) -> std::result::Result<Self, Self::Error> {
        Rate::new(value)
    }
}

impl From<Rate> for Decimal {
    fn from(rate: Rate) -> Decimal {
        rate.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rounds toward negative infinity at `scale` decimal places. Commission amounts are never
/// rounded up.
pub fn floor_to_scale(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::ToNegativeInfinity)
}

/// Rejects negative amounts at API boundaries.
pub fn ensure_non_negative(what: &str, amount: Decimal) -> Result<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(McreError::Validation(format!(
            "{what} must not be negative: {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn rate_bounds_are_enforced() {
        assert!(Rate::new(d("0")).is_ok());
        assert!(Rate::new(d("1")).is_ok());
        assert!(Rate::new(d("1.0001")).is_err());
        assert!(Rate::new(d("-0.01")).is_err());
        assert!(Rate::from_bps(10_001).is_err());
    }

    #[test]
    fn from_bps_matches_decimal() {
        assert_eq!(Rate::from_bps(500).unwrap().get(), d("0.05"));
        assert_eq!(Rate::from_bps(10_000).unwrap(), Rate::ONE);
    }

    #[test]
    fn apply_rounds_down_never_up() {
        let rate = Rate::from_bps(333).unwrap();
        // 0.0333 * 10.00 = 0.333 -> 0.33
        assert_eq!(rate.apply(d("10.00"), 2), d("0.33"));
        // 0.0333 * 29.99 = 0.998667 -> 0.99
        assert_eq!(rate.apply(d("29.99"), 2), d("0.99"));
    }

    #[test]
    fn repeated_small_amounts_sum_exactly() {
        let cent = d("0.01");
        let total: Decimal = std::iter::repeat(cent).take(10_000).sum();
        assert_eq!(total, d("100.00"));
    }

    #[test]
    fn rate_serde_rejects_out_of_range() {
        let ok: Rate = serde_json::from_str("\"0.25\"").unwrap();
        assert_eq!(ok.get(), d("0.25"));
        assert!(serde_json::from_str::<Rate>("\"1.5\"").is_err());
    }
}
