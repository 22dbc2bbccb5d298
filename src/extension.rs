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

//! Extension and penalty charges.
//!
//! Each one is authorized on its own hold and settled against its own ledger
//! entry; the original booking's ledger entry is never reopened.

use crate::base::{BookingId, ExtensionId, IntentRef};
use crate::booking::PaymentStatus;
use crate::error::{SettlementError, ValidationError};
use crate::ledger::ChargeKind;
use crate::money::{Money, TaxRate};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Pending,
    Approved,
    Declined,
}

#[derive(Debug, Clone)]
pub struct ExtensionDraft {
    pub id: ExtensionId,
    pub booking_id: BookingId,
    /// [`ChargeKind::Extension`] or [`ChargeKind::Penalty`].
    pub kind: ChargeKind,
    pub subtotal: Money,
    pub tax_rate: TaxRate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub id: ExtensionId,
    pub booking_id: BookingId,
    pub kind: ChargeKind,
    pub subtotal: Money,
    pub tax_rate: TaxRate,
    pub status: ExtensionStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent: Option<IntentRef>,
}

impl Extension {
    pub fn total(&self) -> Money {
        self.subtotal + self.tax_rate.tax_on(self.subtotal)
    }

    pub fn intent(&self) -> Result<&IntentRef, ValidationError> {
        self.payment_intent
            .as_ref()
            .ok_or(ValidationError::MissingPaymentIntent(self.booking_id))
    }
}

impl TryFrom<ExtensionDraft> for Extension {
    type Error = ValidationError;

    fn try_from(draft: ExtensionDraft) -> Result<Self, Self::Error> {
        if draft.subtotal.is_negative() {
            return Err(ValidationError::NegativeAmount);
        }
        draft
            .subtotal
            .checked_add(draft.tax_rate.tax_on(draft.subtotal))
            .ok_or(ValidationError::AmountOverflow)?;
        Ok(Self {
            id: draft.id,
            booking_id: draft.booking_id,
            kind: draft.kind,
            subtotal: draft.subtotal,
            tax_rate: draft.tax_rate,
            status: ExtensionStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_intent: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct ExtensionStore {
    extensions: DashMap<ExtensionId, Extension>,
}

impl ExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, extension: Extension) -> Result<(), ValidationError> {
        match self.extensions.entry(extension.id) {
            Entry::Occupied(_) => Err(ValidationError::Duplicate(format!(
                "extension {}",
                extension.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(extension);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: ExtensionId) -> Option<Extension> {
        self.extensions.get(&id).map(|extension| extension.clone())
    }

    /// Applies `update` if the payment status still equals `expected`.
    pub fn update(
        &self,
        id: ExtensionId,
        expected: PaymentStatus,
        update: impl FnOnce(&mut Extension),
    ) -> Result<Extension, SettlementError> {
        let mut extension = self
            .extensions
            .get_mut(&id)
            .ok_or(ValidationError::ExtensionNotFound(id))?;
        if extension.payment_status != expected {
            return Err(SettlementError::Conflict {
                booking: extension.booking_id,
            });
        }
        update(&mut extension);
        Ok(extension.clone())
    }
}
