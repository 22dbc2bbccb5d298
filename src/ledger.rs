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

//! Payment transaction ledger.
//!
//! One [`LedgerEntry`] per payment intent holds the authoritative totals of
//! that intent across its capture / refund history:
//!
//! ```text
//! gross_amount    = amount currently captured
//! base_amount     = gross_amount - platform_fee
//! manager_revenue = base_amount - processor_fee     (known after settlement)
//! refunded       <= manager_revenue                 (always)
//! ```
//!
//! Ledger status:
//!
//! ```text
//! Pending ──capture──► Processing ──ok──► Succeeded ──refund──► PartiallyRefunded ──► Refunded
//!    │                     │
//!    └──cancel──► Canceled └──expired──► Canceled
//! ```

use crate::base::{BookingId, IntentRef, LineItemId, RefundRef, ReversalRef};
use crate::error::{SettlementError, ValidationError};
use crate::money::Money;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Processing,
    Succeeded,
    PartiallyRefunded,
    Refunded,
    Canceled,
    Failed,
}

impl LedgerStatus {
    pub fn is_captured(self) -> bool {
        matches!(
            self,
            LedgerStatus::Succeeded | LedgerStatus::PartiallyRefunded | LedgerStatus::Refunded
        )
    }
}

/// What a payment intent pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    Booking,
    Extension,
    Penalty,
}

/// How the captured amount was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// The whole authorized amount.
    Full,
    /// Approved subtotal plus tax, below the authorized amount.
    Partial,
}

/// A processor call whose outcome is not known yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PendingOperation {
    Capture {
        rejected: Vec<LineItemId>,
    },
    CancelAuthorization,
    /// A refund of `amount` for the listed items. `known_refunds` are the
    /// refunds already on the entry when the call was issued.
    Refund {
        amount: Money,
        items: Vec<LineItemId>,
        whole_booking: bool,
        #[serde(default)]
        known_refunds: Vec<RefundRef>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    BookingCancelled,
    LineItemsRejected,
    /// Issued outside the engine and learned from a notification.
    ProcessorInitiated,
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefundReason::BookingCancelled => "booking_cancelled",
            RefundReason::LineItemsRejected => "line_items_rejected",
            RefundReason::ProcessorInitiated => "processor_initiated",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub amount: Money,
    pub reason: RefundReason,
    pub refund: Option<RefundRef>,
    pub reversal: Option<ReversalRef>,
    pub at: DateTime<Utc>,
}

/// Typed metadata carried by a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    pub schema_version: u16,
    pub kind: ChargeKind,
    /// Set before a partial capture is issued; tells the reconciliation
    /// listener the amount fields are authoritative and must not be synced.
    pub partial_capture: bool,
    pub approved_subtotal: Option<Money>,
    pub approved_tax: Option<Money>,
    pub capture_source: Option<CaptureSource>,
    pub pending_operation: Option<PendingOperation>,
}

impl LedgerMetadata {
    pub const SCHEMA_VERSION: u16 = 1;

    pub fn new(kind: ChargeKind) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            kind,
            partial_capture: false,
            approved_subtotal: None,
            approved_tax: None,
            capture_source: None,
            pending_operation: None,
        }
    }

    fn merge(&mut self, patch: MetadataPatch) {
        if let Some(partial) = patch.partial_capture {
            self.partial_capture = partial;
        }
        if let Some(subtotal) = patch.approved_subtotal {
            self.approved_subtotal = Some(subtotal);
        }
        if let Some(tax) = patch.approved_tax {
            self.approved_tax = Some(tax);
        }
        if let Some(source) = patch.capture_source {
            self.capture_source = Some(source);
        }
        if let Some(pending) = patch.pending_operation {
            self.pending_operation = pending;
        }
    }
}

/// Fields of [`LedgerMetadata`] to overwrite; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub partial_capture: Option<bool>,
    pub approved_subtotal: Option<Money>,
    pub approved_tax: Option<Money>,
    pub capture_source: Option<CaptureSource>,
    /// `Some(None)` clears the pending operation.
    pub pending_operation: Option<Option<PendingOperation>>,
}

/// Partial update of a ledger entry; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub status: Option<LedgerStatus>,
    pub gross_amount: Option<Money>,
    pub base_amount: Option<Money>,
    pub platform_fee: Option<Money>,
    pub processor_fee: Option<Money>,
    pub manager_revenue: Option<Money>,
    pub metadata: MetadataPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub intent: IntentRef,
    pub booking_id: BookingId,
    pub authorized_amount: Money,
    pub gross_amount: Money,
    pub base_amount: Money,
    pub platform_fee: Money,
    pub processor_fee: Option<Money>,
    pub manager_revenue: Option<Money>,
    pub refunded: Money,
    pub status: LedgerStatus,
    pub refunds: Vec<RefundRecord>,
    pub metadata: LedgerMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// New entry for a freshly authorized intent; nothing captured yet.
    pub fn authorized(
        intent: IntentRef,
        booking_id: BookingId,
        kind: ChargeKind,
        authorized_amount: Money,
        platform_fee: Money,
    ) -> Self {
        let now = Utc::now();
        Self {
            intent,
            booking_id,
            authorized_amount,
            gross_amount: Money::ZERO,
            base_amount: Money::ZERO,
            platform_fee,
            processor_fee: None,
            manager_revenue: None,
            refunded: Money::ZERO,
            status: LedgerStatus::Pending,
            refunds: Vec::new(),
            metadata: LedgerMetadata::new(kind),
            created_at: now,
            updated_at: now,
        }
    }

    /// Manager balance still available to fund refunds, once settled.
    pub fn remaining_balance(&self) -> Option<Money> {
        self.manager_revenue
            .map(|revenue| revenue.saturating_sub(self.refunded))
    }

    pub fn has_refund(&self, refund: &RefundRef) -> bool {
        self.refunds
            .iter()
            .any(|record| record.refund.as_ref() == Some(refund))
    }

    fn apply(&mut self, update: LedgerUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(gross) = update.gross_amount {
            self.gross_amount = gross;
        }
        if let Some(base) = update.base_amount {
            self.base_amount = base;
        }
        if let Some(fee) = update.platform_fee {
            self.platform_fee = fee;
        }
        if let Some(fee) = update.processor_fee {
            self.processor_fee = Some(fee);
        }
        if let Some(revenue) = update.manager_revenue {
            self.manager_revenue = Some(revenue);
        }
        self.metadata.merge(update.metadata);
        self.updated_at = Utc::now();
    }
}

/// Persistence for ledger entries.
///
/// Every write is single-entry and atomic: readers observe either the pre-
/// or the post-image, never a partially applied update.
pub trait LedgerStore: Send + Sync {
    fn get(&self, intent: &IntentRef) -> Option<LedgerEntry>;

    fn create(&self, entry: LedgerEntry) -> Result<(), SettlementError>;

    /// Overwrites the given fields and merges metadata. Returns the post-image.
    fn update(&self, intent: &IntentRef, update: LedgerUpdate)
    -> Result<LedgerEntry, SettlementError>;

    /// Appends a refund record and adds it to the refunded total.
    ///
    /// Returns `Ok(false)` if a record with the same processor refund
    /// reference already exists; a notification-sourced record is then
    /// completed with the issuer's reason and reversal reference. Fails with
    /// [`SettlementError::InvariantViolation`] if the refunded total would
    /// exceed the manager revenue.
    fn append_refund_record(
        &self,
        intent: &IntentRef,
        record: RefundRecord,
    ) -> Result<bool, SettlementError>;

    fn entries_for_booking(&self, booking_id: BookingId) -> Vec<LedgerEntry>;
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: DashMap<IntentRef, LedgerEntry>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn get(&self, intent: &IntentRef) -> Option<LedgerEntry> {
        self.entries.get(intent).map(|entry| entry.clone())
    }

    fn create(&self, entry: LedgerEntry) -> Result<(), SettlementError> {
        match self.entries.entry(entry.intent.clone()) {
            Entry::Occupied(_) => Err(ValidationError::Duplicate(format!(
                "ledger entry {}",
                entry.intent
            ))
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    fn update(
        &self,
        intent: &IntentRef,
        update: LedgerUpdate,
    ) -> Result<LedgerEntry, SettlementError> {
        let mut entry = self
            .entries
            .get_mut(intent)
            .ok_or_else(|| ValidationError::LedgerEntryNotFound(intent.clone()))?;
        entry.apply(update);
        Ok(entry.clone())
    }

    fn append_refund_record(
        &self,
        intent: &IntentRef,
        record: RefundRecord,
    ) -> Result<bool, SettlementError> {
        if record.amount.is_negative() {
            return Err(ValidationError::NegativeAmount.into());
        }
        let mut entry = self
            .entries
            .get_mut(intent)
            .ok_or_else(|| ValidationError::LedgerEntryNotFound(intent.clone()))?;
        if let Some(refund) = &record.refund {
            if let Some(existing) = entry
                .refunds
                .iter_mut()
                .find(|r| r.refund.as_ref() == Some(refund))
            {
                // A notification can record a refund before the issuer does.
                if existing.reason == RefundReason::ProcessorInitiated {
                    existing.reason = record.reason;
                }
                if existing.reversal.is_none() {
                    existing.reversal = record.reversal;
                }
                return Ok(false);
            }
        }

        let refunded = entry.refunded + record.amount;
        match entry.manager_revenue {
            Some(revenue) if refunded <= revenue => {}
            revenue => {
                error!(
                    intent = %intent,
                    refunded = %refunded,
                    manager_revenue = ?revenue,
                    "refund would exceed manager revenue"
                );
                return Err(SettlementError::InvariantViolation(format!(
                    "refunds on {intent} would total {refunded}, above manager revenue {revenue:?}"
                )));
            }
        }

        entry.refunded = refunded;
        entry.refunds.push(record);
        entry.updated_at = Utc::now();
        Ok(true)
    }

    fn entries_for_booking(&self, booking_id: BookingId) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.booking_id == booking_id)
            .map(|entry| entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }
}
