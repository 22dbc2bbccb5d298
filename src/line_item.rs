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

//! Storage and equipment add-ons attached to a primary booking.

use crate::base::{BookingId, LineItemId};
use crate::booking::{BookingStatus, PaymentStatus};
use crate::error::{SettlementError, ValidationError};
use crate::money::Money;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Storage,
    Equipment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub booking_id: BookingId,
    pub kind: LineItemKind,
    /// Pre-tax price, independent of the booking's base price.
    pub price: Money,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
}

impl LineItem {
    pub fn new(id: LineItemId, booking_id: BookingId, kind: LineItemKind, price: Money) -> Self {
        Self {
            id,
            booking_id,
            kind,
            price,
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == BookingStatus::Cancelled
            || self.payment_status == PaymentStatus::Failed
    }

    /// Still part of what the payer is being charged for.
    pub fn is_active(&self) -> bool {
        !self.is_rejected()
    }
}

/// Registry of all line items, indexed by booking.
#[derive(Debug, Default)]
pub struct LineItemRegistry {
    items: DashMap<LineItemId, LineItem>,
    by_booking: DashMap<BookingId, Vec<LineItemId>>,
}

impl LineItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, item: LineItem) -> Result<(), ValidationError> {
        if item.price.is_negative() {
            return Err(ValidationError::NegativeAmount);
        }
        let (id, booking_id) = (item.id, item.booking_id);
        match self.items.entry(id) {
            Entry::Occupied(_) => {
                return Err(ValidationError::Duplicate(format!("line item {id}")));
            }
            Entry::Vacant(entry) => {
                entry.insert(item);
            }
        }
        self.by_booking.entry(booking_id).or_default().push(id);
        Ok(())
    }

    pub fn get(&self, id: LineItemId) -> Option<LineItem> {
        self.items.get(&id).map(|item| item.clone())
    }

    /// Line items of a booking, ordered by ID.
    pub fn for_booking(&self, booking_id: BookingId) -> Vec<LineItem> {
        let ids = self
            .by_booking
            .get(&booking_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut items: Vec<LineItem> = ids.iter().filter_map(|id| self.get(*id)).collect();
        items.sort_by_key(|item| item.id);
        items
    }

    /// Moves each listed item to `(status, payment_status)`.
    ///
    /// Every item is compare-and-swapped individually against the payment
    /// status it must currently hold (`expected`).
    pub fn transition(
        &self,
        ids: &[LineItemId],
        expected: &[PaymentStatus],
        status: BookingStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), SettlementError> {
        for id in ids {
            let mut item = self
                .items
                .get_mut(id)
                .ok_or(ValidationError::LineItemNotFound(*id))?;
            if !expected.contains(&item.payment_status) {
                return Err(SettlementError::Conflict {
                    booking: item.booking_id,
                });
            }
            item.status = status;
            item.payment_status = payment_status;
        }
        Ok(())
    }
}
