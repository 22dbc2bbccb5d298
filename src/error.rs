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

//! Error types for settlement processing.
//!
//! - [`ValidationError`]: bad input, raised before any processor call.
//! - [`ProcessorError`]: the remote processor call failed or timed out.
//! - [`SettlementError`]: everything an engine operation can return.

use crate::base::{BookingId, ExtensionId, IntentRef, LineItemId};
use crate::booking::{BookingStatus, PaymentStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// Input rejected before any money moves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("line item {0} not found")]
    LineItemNotFound(LineItemId),

    #[error("extension {0} not found")]
    ExtensionNotFound(ExtensionId),

    #[error("no ledger entry for payment intent {0}")]
    LedgerEntryNotFound(IntentRef),

    #[error("line item {item} does not belong to booking {booking}")]
    ForeignLineItem { item: LineItemId, booking: BookingId },

    #[error("line item {0} is both approved and rejected")]
    ConflictingDecision(LineItemId),

    #[error("line item {0} cannot be changed in its current state")]
    LineItemNotSettleable(LineItemId),

    #[error("invalid amount (must not be negative)")]
    NegativeAmount,

    #[error("tax rate {0}% outside 0..=100")]
    InvalidTaxRate(Decimal),

    #[error("cannot {action} a booking in state {status}/{payment_status}")]
    InvalidTransition {
        action: &'static str,
        status: BookingStatus,
        payment_status: PaymentStatus,
    },

    #[error("booking {0} has no payment intent")]
    MissingPaymentIntent(BookingId),

    #[error("booking {0} is awaiting payment reconciliation")]
    AwaitingReconciliation(BookingId),

    #[error("extension {0} is not awaiting a decision")]
    ExtensionNotPending(ExtensionId),

    #[error("no line items given")]
    EmptySelection,

    #[error("amount overflows")]
    AmountOverflow,

    #[error("duplicate identifier {0}")]
    Duplicate(String),
}

/// Failure of a call to the external payment processor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Transport failure; the request never reached the processor.
    #[error("payment could not be settled, please retry: {0}")]
    Network(String),

    #[error("payment declined: {0}")]
    Declined(String),

    /// Holds are time-boxed and cannot be renewed.
    #[error("payment authorization lapsed; a new booking and payment must be created")]
    AuthorizationExpired,

    #[error("processor call timed out after {0} ms")]
    Timeout(u64),

    #[error("processor does not know payment intent {0}")]
    UnknownIntent(IntentRef),
}

impl ProcessorError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Network(_))
    }

    /// Whether the processor may or may not have applied the call.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ProcessorError::Timeout(_))
    }
}

/// Errors returned by settlement operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Another operation changed the booking first.
    #[error("booking {booking} was modified concurrently")]
    Conflict { booking: BookingId },

    /// The processor call may have been applied; resolve via re-query.
    #[error("payment outcome unknown for intent {intent}; awaiting reconciliation")]
    OutcomeUnknown { intent: IntentRef },

    /// A programming error, never user-triggered.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
