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

//! Capture and refund amount computation.
//!
//! Pure functions over booking, line item and ledger values. The engine
//! turns the resulting plans into processor calls and store writes.

use crate::base::LineItemId;
use crate::error::{SettlementError, ValidationError};
use crate::ledger::LedgerEntry;
use crate::line_item::LineItem;
use crate::money::{FeeSchedule, Money, TaxRate};
use std::collections::BTreeSet;

/// Amounts for capturing an approved booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    pub approved_subtotal: Money,
    pub tax: Money,
    pub capture_amount: Money,
    /// Recomputed on `capture_amount`, never on the authorized amount.
    pub platform_fee: Money,
    pub authorized_amount: Money,
    pub approved: Vec<LineItemId>,
    pub rejected: Vec<LineItemId>,
}

impl CapturePlan {
    /// Less than the authorized amount will be captured.
    pub fn is_partial(&self) -> bool {
        !self.rejected.is_empty() || self.capture_amount < self.authorized_amount
    }

    pub fn base_amount(&self) -> Money {
        self.capture_amount - self.platform_fee
    }
}

/// Amount authorized for a booking and all of its active line items.
pub fn authorization_amount(
    base_price: Money,
    tax_rate: TaxRate,
    items: &[LineItem],
) -> Result<Money, SettlementError> {
    let subtotal = items
        .iter()
        .filter(|i| i.is_active())
        .try_fold(base_price, |sum, i| sum.checked_add(i.price))
        .ok_or(ValidationError::AmountOverflow)?;
    let total = subtotal
        .checked_add(tax_rate.tax_on(subtotal))
        .ok_or(ValidationError::AmountOverflow)?;
    Ok(total)
}

/// Plans the capture for an approval decision.
///
/// The booking's base price is always approved; every active line item not
/// in `rejected` is approved.
pub fn capture_plan(
    base_price: Money,
    tax_rate: TaxRate,
    items: &[LineItem],
    rejected: &BTreeSet<LineItemId>,
    authorized_amount: Money,
    fees: &FeeSchedule,
) -> Result<CapturePlan, SettlementError> {
    if base_price.is_negative() || authorized_amount.is_negative() {
        return Err(ValidationError::NegativeAmount.into());
    }

    let mut approved = Vec::new();
    let mut rejected_ids = Vec::new();
    let mut approved_subtotal = base_price;
    for item in items.iter().filter(|item| item.is_active()) {
        if item.price.is_negative() {
            return Err(ValidationError::NegativeAmount.into());
        }
        if rejected.contains(&item.id) {
            rejected_ids.push(item.id);
        } else {
            approved.push(item.id);
            approved_subtotal = approved_subtotal
                .checked_add(item.price)
                .ok_or(ValidationError::AmountOverflow)?;
        }
    }

    let tax = tax_rate.tax_on(approved_subtotal);
    let capture_amount = approved_subtotal
        .checked_add(tax)
        .ok_or(ValidationError::AmountOverflow)?;
    if capture_amount > authorized_amount {
        return Err(SettlementError::InvariantViolation(format!(
            "capture {capture_amount} exceeds authorized {authorized_amount}"
        )));
    }

    Ok(CapturePlan {
        approved_subtotal,
        tax,
        capture_amount,
        platform_fee: fees.fee_for(capture_amount),
        authorized_amount,
        approved,
        rejected: rejected_ids,
    })
}

/// Amounts for refunding part of a settled charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPlan {
    pub rejected_subtotal: Money,
    pub proportional_tax: Money,
    pub gross_refund: Money,
    pub proportional_processor_fee: Money,
    pub net_refund: Money,
    /// Credited to the payer.
    pub refund_amount: Money,
    /// Debited from the manager's settled balance. Always equal to
    /// `refund_amount`.
    pub reversal_amount: Money,
}

/// Plans the unified refund of `rejected_subtotal` against a settled entry.
///
/// The refund is net of the proportional processor fee and capped at the
/// manager balance still unrefunded. The payer is credited exactly what the
/// manager is debited.
pub fn refund_plan(
    rejected_subtotal: Money,
    tax_rate: TaxRate,
    ledger: &LedgerEntry,
) -> Result<RefundPlan, SettlementError> {
    if rejected_subtotal.is_negative() {
        return Err(ValidationError::NegativeAmount.into());
    }
    let (Some(processor_fee), Some(remaining)) = (ledger.processor_fee, ledger.remaining_balance())
    else {
        return Err(SettlementError::InvariantViolation(format!(
            "ledger entry {} is not settled yet",
            ledger.intent
        )));
    };

    let proportional_tax = tax_rate.tax_on(rejected_subtotal);
    let gross_refund = rejected_subtotal
        .checked_add(proportional_tax)
        .ok_or(ValidationError::AmountOverflow)?;
    let proportional_processor_fee =
        processor_fee.prorate_rounded(gross_refund, ledger.gross_amount);
    let net_refund = gross_refund.saturating_sub(proportional_processor_fee);
    let refund_amount = net_refund.min(remaining);

    Ok(RefundPlan {
        rejected_subtotal,
        proportional_tax,
        gross_refund,
        proportional_processor_fee,
        net_refund,
        refund_amount,
        reversal_amount: refund_amount,
    })
}
