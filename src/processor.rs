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

//! Interface to the external payment processor.
//!
//! Calls are synchronous and fallible. Every successful capture or refund
//! also produces a [`ProcessorEvent`], delivered at least once and possibly
//! before the call that caused it has returned.

use crate::base::{BookingId, IntentRef, PayerRef, RefundRef, ReversalRef};
use crate::error::ProcessorError;
use crate::ledger::ChargeKind;
use crate::money::Money;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub amount: Money,
    pub currency: String,
    pub payer: PayerRef,
    /// Platform fee on the full authorized amount.
    pub application_fee: Money,
    pub booking_id: BookingId,
    pub kind: ChargeKind,
}

/// Processor-side state of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresCapture,
    Processing,
    Succeeded,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResponse {
    pub captured_amount: Money,
    pub status: IntentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundResponse {
    pub refund: RefundRef,
    pub reversal: ReversalRef,
}

/// A refund the processor has applied to an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundState {
    pub refund: RefundRef,
    pub reversal: Option<ReversalRef>,
    pub amount: Money,
}

/// Result of re-querying an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentState {
    pub intent: IntentRef,
    pub status: IntentStatus,
    pub authorized_amount: Money,
    pub captured_amount: Money,
    /// Known once the processor has settled the capture.
    pub processor_fee: Option<Money>,
    pub net_amount: Option<Money>,
    /// Oldest first.
    pub refunds: Vec<RefundState>,
}

/// Operations the settlement engine needs from a payment processor.
pub trait ProcessorAdapter: Send + Sync {
    /// Places a hold; returns the new intent reference.
    fn authorize(&self, request: AuthorizeRequest) -> Result<IntentRef, ProcessorError>;

    /// Captures the hold. `amount = None` captures the full authorized
    /// amount; a smaller amount releases the remainder. `application_fee`
    /// replaces the platform fee set at authorization.
    fn capture(
        &self,
        intent: &IntentRef,
        amount: Option<Money>,
        application_fee: Option<Money>,
    ) -> Result<CaptureResponse, ProcessorError>;

    fn cancel_authorization(&self, intent: &IntentRef) -> Result<IntentStatus, ProcessorError>;

    /// Refunds `amount` to the payer, funded by reversing `reversal_amount`
    /// from the manager's settled balance.
    fn refund_with_reversal(
        &self,
        intent: &IntentRef,
        amount: Money,
        reason: &str,
        reversal_amount: Money,
    ) -> Result<RefundResponse, ProcessorError>;

    fn retrieve(&self, intent: &IntentRef) -> Result<IntentState, ProcessorError>;

    /// The most recent intent placed for `booking_id` and `kind`, if any.
    ///
    /// Used to find a hold whose authorization call never answered.
    fn find_authorization(
        &self,
        booking_id: BookingId,
        kind: ChargeKind,
    ) -> Result<Option<IntentState>, ProcessorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CaptureSucceeded,
    RefundSucceeded,
}

/// Asynchronous notification from the processor (webhook payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub intent_ref: IntentRef,
    pub amount: Money,
    pub processor_fee: Money,
    pub net_amount: Money,
    /// Present on refund events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_ref: Option<RefundRef>,
}

impl ProcessorEvent {
    pub fn capture_succeeded(
        intent_ref: IntentRef,
        amount: Money,
        processor_fee: Money,
        net_amount: Money,
    ) -> Self {
        Self {
            kind: EventKind::CaptureSucceeded,
            intent_ref,
            amount,
            processor_fee,
            net_amount,
            refund_ref: None,
        }
    }

    pub fn refund_succeeded(intent_ref: IntentRef, refund_ref: RefundRef, amount: Money) -> Self {
        Self {
            kind: EventKind::RefundSucceeded,
            intent_ref,
            amount,
            processor_fee: Money::ZERO,
            net_amount: Money::ZERO,
            refund_ref: Some(refund_ref),
        }
    }
}
