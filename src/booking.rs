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

//! Primary bookings and their per-record write discipline.
//!
//! Booking lifecycle (status / payment status):
//!
//! ```text
//!  pending/authorized ──approve──────────► confirmed/paid ──cancel+refund──► cancelled/refunded
//!         │            ──approve partial─► confirmed/paid ──reject items───► confirmed/partially_refunded
//!         │                                     │
//!         └──reject / cancel──► cancelled/failed └──cancel, no refund──► cancelled/paid (manual refund)
//! ```
//!
//! Payment fields are written only by the settlement engine, through a
//! [`BookingClaim`]: an exclusive, optimistic lease on one booking that is
//! taken at the start of an operation and compare-and-swaps on the version
//! read at that point.

use crate::base::{BookingId, IntentRef, LineItemId};
use crate::error::{SettlementError, ValidationError};
use crate::line_item::{LineItem, LineItemKind};
use crate::money::{Money, TaxRate};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CancellationRequested,
    Cancelled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CancellationRequested => "cancellation_requested",
            BookingStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Paid,
    PartiallyRefunded,
    Refunded,
    Failed,
}

impl PaymentStatus {
    /// Money has been captured and not fully returned.
    pub fn is_settled(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::PartiallyRefunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Paid => "paid",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        })
    }
}

/// Copy of a line item's key fields, embedded in the booking for list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub line_item_id: LineItemId,
    pub kind: LineItemKind,
    pub price: Money,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub rejected: bool,
}

impl From<&LineItem> for SnapshotEntry {
    fn from(item: &LineItem) -> Self {
        Self {
            line_item_id: item.id,
            kind: item.kind,
            price: item.price,
            status: item.status,
            payment_status: item.payment_status,
            rejected: item.is_rejected(),
        }
    }
}

/// Input for creating a booking: base price is `hourly_rate × duration_hours`.
#[derive(Debug, Clone)]
pub struct BookingDraft {
    pub id: BookingId,
    pub hourly_rate: Money,
    pub duration_hours: u32,
    pub tax_rate: TaxRate,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    /// Pre-tax price of the primary reservation.
    pub base_price: Money,
    pub tax_rate: TaxRate,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent: Option<IntentRef>,
    pub snapshot: Vec<SnapshotEntry>,
    /// A refund is owed to the payer and must be issued by an operator.
    pub requires_manual_refund: bool,
    /// A processor call ended ambiguously; see `SettlementEngine::resolve_pending`.
    pub awaiting_reconciliation: bool,
    /// Bumped by every committed write to status or payment fields.
    pub version: u64,
}

impl Booking {
    pub fn new(id: BookingId, base_price: Money, tax_rate: TaxRate) -> Self {
        Self {
            id,
            base_price,
            tax_rate,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_intent: None,
            snapshot: Vec::new(),
            requires_manual_refund: false,
            awaiting_reconciliation: false,
            version: 0,
        }
    }

    pub fn intent(&self) -> Result<&IntentRef, ValidationError> {
        self.payment_intent
            .as_ref()
            .ok_or(ValidationError::MissingPaymentIntent(self.id))
    }

    pub(crate) fn invalid_transition(&self, action: &'static str) -> ValidationError {
        ValidationError::InvalidTransition {
            action,
            status: self.status,
            payment_status: self.payment_status,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.status != BookingStatus::Confirmed || self.payment_status.is_settled(),
            "Invariant violated: booking {} confirmed with payment status {}",
            self.id,
            self.payment_status
        );
    }
}

#[derive(Debug)]
struct BookingRecord {
    booking: Booking,
    in_flight: bool,
}

/// In-memory booking table.
///
/// Each entry is only ever written under its [`DashMap`] shard lock, so a
/// reader sees either the pre- or the post-image of a write.
#[derive(Debug, Default)]
pub struct BookingStore {
    records: DashMap<BookingId, BookingRecord>,
}

impl BookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking: Booking) -> Result<(), ValidationError> {
        match self.records.entry(booking.id) {
            Entry::Occupied(_) => Err(ValidationError::Duplicate(format!(
                "booking {}",
                booking.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(BookingRecord {
                    booking,
                    in_flight: false,
                });
                Ok(())
            }
        }
    }

    pub fn get(&self, id: BookingId) -> Option<Booking> {
        self.records.get(&id).map(|record| record.booking.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All bookings, ordered by ID.
    pub fn all(&self) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .records
            .iter()
            .map(|record| record.booking.clone())
            .collect();
        bookings.sort_by_key(|booking| booking.id);
        bookings
    }

    /// Takes the exclusive settlement lease on `observed.id`.
    ///
    /// Succeeds only if no other operation holds the booking and its
    /// version still equals `observed.version`.
    pub(crate) fn claim(&self, observed: &Booking) -> Result<BookingClaim<'_>, SettlementError> {
        let mut record = self
            .records
            .get_mut(&observed.id)
            .ok_or(ValidationError::BookingNotFound(observed.id))?;
        if record.in_flight || record.booking.version != observed.version {
            return Err(SettlementError::Conflict {
                booking: observed.id,
            });
        }
        record.in_flight = true;
        Ok(BookingClaim {
            store: self,
            booking: record.booking.clone(),
        })
    }

    /// Rewrites the denormalized snapshot only. Does not bump the version.
    pub(crate) fn update_snapshot(
        &self,
        id: BookingId,
        update: impl FnOnce(&mut Vec<SnapshotEntry>),
    ) -> Result<(), ValidationError> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(ValidationError::BookingNotFound(id))?;
        update(&mut record.booking.snapshot);
        Ok(())
    }

    fn release(&self, id: BookingId) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.in_flight = false;
        }
    }
}

/// Exclusive lease on one booking for the duration of a settlement operation.
///
/// Released when dropped.
#[derive(Debug)]
pub(crate) struct BookingClaim<'a> {
    store: &'a BookingStore,
    booking: Booking,
}

impl BookingClaim<'_> {
    pub(crate) fn booking(&self) -> &Booking {
        &self.booking
    }

    /// Applies `update` if the stored version still matches the claimed one.
    pub(crate) fn commit(
        &mut self,
        update: impl FnOnce(&mut Booking),
    ) -> Result<&Booking, SettlementError> {
        let id = self.booking.id;
        let mut record = self
            .store
            .records
            .get_mut(&id)
            .ok_or(ValidationError::BookingNotFound(id))?;
        if !record.in_flight || record.booking.version != self.booking.version {
            return Err(SettlementError::Conflict { booking: id });
        }
        update(&mut record.booking);
        record.booking.version += 1;
        record.booking.assert_invariants();
        self.booking = record.booking.clone();
        Ok(&self.booking)
    }
}

impl Drop for BookingClaim<'_> {
    fn drop(&mut self) {
        self.store.release(self.booking.id);
    }
}
