// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Fixed-point money arithmetic.
//!
//! Every amount is a signed integer number of minor currency units (cents).
//! Percentages are exact [`Decimal`] values; applying one rounds the result
//! to the nearest cent, half up. Proportional splits multiply before they
//! divide so no rounding drift accumulates.
//!
//! # Example
//!
//! ```
//! use booking_settlement::{Money, TaxRate};
//! use rust_decimal_macros::dec;
//!
//! let subtotal = Money::from_cents(10_000);
//! let tax = TaxRate::new(dec!(15)).unwrap().tax_on(subtotal);
//! assert_eq!(tax, Money::from_cents(1_500));
//! ```

use crate::error::ValidationError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// An amount in minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Converts an amount in major units (`115.00`), rounding half up to
    /// the cent. `None` if it does not fit.
    pub fn from_major(amount: Decimal) -> Option<Money> {
        amount
            .checked_mul(dec!(100))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Money)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `None` on overflow.
    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    /// `self - other`, floored at zero.
    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    /// Applies a percentage, rounding half up to the nearest cent.
    ///
    /// Saturates at `i64::MAX` if the result does not fit.
    pub fn percent(self, percent: Decimal) -> Money {
        let exact = Decimal::from(self.0) * percent / dec!(100);
        let rounded = exact.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        Money(rounded.to_i64().unwrap_or(i64::MAX))
    }

    /// `floor(self * part / whole)`, computed in 128-bit integers.
    ///
    /// Returns zero when `whole` is zero.
    pub fn prorate(self, part: Money, whole: Money) -> Money {
        if whole.0 == 0 {
            return Money::ZERO;
        }
        let product = i128::from(self.0) * i128::from(part.0);
        Money(product.div_euclid(i128::from(whole.0)) as i64)
    }

    /// `round(self * part / whole)` with halves rounded up.
    ///
    /// Returns zero when `whole` is zero. Intended for non-negative operands.
    pub fn prorate_rounded(self, part: Money, whole: Money) -> Money {
        if whole.0 == 0 {
            return Money::ZERO;
        }
        let product = i128::from(self.0) * i128::from(part.0);
        let whole = i128::from(whole.0);
        Money((2 * product + whole).div_euclid(2 * whole) as i64)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

/// Formats as major units with two decimals, e.g. `115.00`.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// A tax rate expressed in percent (`15` means 15%).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct TaxRate(Decimal);

impl TaxRate {
    pub const ZERO: TaxRate = TaxRate(Decimal::ZERO);

    /// Creates a tax rate, rejecting values outside `0..=100`.
    pub fn new(percent: Decimal) -> Result<Self, ValidationError> {
        if percent < Decimal::ZERO || percent > dec!(100) {
            return Err(ValidationError::InvalidTaxRate(percent));
        }
        Ok(TaxRate(percent))
    }

    pub fn percent(&self) -> Decimal {
        self.0
    }

    /// `round(subtotal * rate / 100)`; zero when no tax is configured.
    pub fn tax_on(&self, subtotal: Money) -> Money {
        if self.0.is_zero() {
            return Money::ZERO;
        }
        subtotal.percent(self.0)
    }
}

impl TryFrom<Decimal> for TaxRate {
    type Error = ValidationError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        TaxRate::new(value)
    }
}

impl From<TaxRate> for Decimal {
    fn from(rate: TaxRate) -> Decimal {
        rate.0
    }
}

/// Platform fee schedule: a percentage of the charged amount plus a flat part.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub percent: Decimal,
    pub fixed: Money,
}

impl FeeSchedule {
    pub fn new(percent: Decimal, fixed: Money) -> Self {
        Self { percent, fixed }
    }

    /// Fee owed on `amount`. Never negative and never above `amount`.
    pub fn fee_for(&self, amount: Money) -> Money {
        if !amount.is_positive() {
            return Money::ZERO;
        }
        let fee = amount.percent(self.percent) + self.fixed;
        fee.max(Money::ZERO).min(amount)
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            percent: dec!(5),
            fixed: Money::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_major_rounds_to_the_cent() {
        assert_eq!(Money::from_major(dec!(115)), Some(Money::from_cents(11_500)));
        assert_eq!(Money::from_major(dec!(0.005)), Some(Money::from_cents(1)));
        assert_eq!(Money::from_major(dec!(-2.50)), Some(Money::from_cents(-250)));
        assert_eq!(Money::from_major(Decimal::MAX), None);
    }

    #[test]
    fn percent_rounds_half_up() {
        // 15% of 10 cents = 1.5 -> 2
        assert_eq!(Money::from_cents(10).percent(dec!(15)), Money::from_cents(2));
        // 15% of 9 cents = 1.35 -> 1
        assert_eq!(Money::from_cents(9).percent(dec!(15)), Money::from_cents(1));
        assert_eq!(
            Money::from_cents(12_000).percent(dec!(15)),
            Money::from_cents(1_800)
        );
    }

    #[test]
    fn fractional_percent_is_exact() {
        // 8.875% of 10000 = 887.5 -> 888
        assert_eq!(
            Money::from_cents(10_000).percent(dec!(8.875)),
            Money::from_cents(888)
        );
    }

    #[test]
    fn prorate_floors() {
        let total = Money::from_cents(100);
        assert_eq!(
            total.prorate(Money::from_cents(1), Money::from_cents(3)),
            Money::from_cents(33)
        );
        assert_eq!(
            total.prorate(Money::from_cents(2), Money::from_cents(3)),
            Money::from_cents(66)
        );
    }

    #[test]
    fn prorate_rounded_rounds_half_up() {
        let total = Money::from_cents(100);
        assert_eq!(
            total.prorate_rounded(Money::from_cents(2), Money::from_cents(3)),
            Money::from_cents(67)
        );
        // 5 * 1 / 2 = 2.5 -> 3
        assert_eq!(
            Money::from_cents(5).prorate_rounded(Money::from_cents(1), Money::from_cents(2)),
            Money::from_cents(3)
        );
    }

    #[test]
    fn prorate_by_zero_whole_is_zero() {
        let total = Money::from_cents(100);
        assert_eq!(total.prorate(Money::from_cents(5), Money::ZERO), Money::ZERO);
        assert_eq!(
            total.prorate_rounded(Money::from_cents(5), Money::ZERO),
            Money::ZERO
        );
    }

    #[test]
    fn prorate_does_not_overflow_on_large_amounts() {
        let big = Money::from_cents(i64::MAX / 2);
        assert_eq!(big.prorate(big, big), big);
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        assert_eq!(
            Money::from_cents(5).saturating_sub(Money::from_cents(9)),
            Money::ZERO
        );
        assert_eq!(
            Money::from_cents(9).saturating_sub(Money::from_cents(5)),
            Money::from_cents(4)
        );
    }

    #[test]
    fn display_uses_major_units() {
        assert_eq!(Money::from_cents(11_500).to_string(), "115.00");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
        assert_eq!(Money::from_cents(7).to_string(), "0.07");
    }

    #[test]
    fn tax_rate_rejects_out_of_range() {
        assert_eq!(
            TaxRate::new(dec!(-1)),
            Err(ValidationError::InvalidTaxRate(dec!(-1)))
        );
        assert!(TaxRate::new(dec!(100.5)).is_err());
        assert!(TaxRate::new(dec!(0)).is_ok());
    }

    #[test]
    fn zero_tax_rate_yields_no_tax() {
        assert_eq!(TaxRate::ZERO.tax_on(Money::from_cents(12_345)), Money::ZERO);
    }

    #[test]
    fn fee_never_exceeds_amount() {
        let schedule = FeeSchedule::new(dec!(10), Money::from_cents(50));
        assert_eq!(schedule.fee_for(Money::from_cents(20)), Money::from_cents(20));
        assert_eq!(
            schedule.fee_for(Money::from_cents(1_000)),
            Money::from_cents(150)
        );
        assert_eq!(schedule.fee_for(Money::ZERO), Money::ZERO);
    }

    #[test]
    fn money_sums() {
        let amounts = [Money::from_cents(1), Money::from_cents(2), Money::from_cents(3)];
        assert_eq!(amounts.iter().sum::<Money>(), Money::from_cents(6));
    }
}
