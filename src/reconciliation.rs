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

//! Consumer of asynchronous processor notifications.
//!
//! For a capture notification on an entry carrying the partial-capture
//! marker, only the fields knowable after settlement are written (processor
//! fee, manager revenue); the amounts the engine computed stay untouched.
//! Without the marker all financial fields are synced from the payload.
//!
//! Every application is idempotent: notifications are delivered at least
//! once and applying one twice changes nothing the second time.

use crate::error::SettlementError;
use crate::ledger::{
    LedgerEntry, LedgerStatus, LedgerStore, LedgerUpdate, RefundReason, RefundRecord,
};
use crate::processor::{EventKind, ProcessorEvent};
use chrono::Utc;
use crossbeam::channel::Receiver;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What applying a notification did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Only processor fee and manager revenue were written.
    SettlementFieldsSynced,
    /// All financial fields were written from the payload.
    FullSync,
    RefundRecorded,
    /// The ledger already reflected the notification.
    AlreadyApplied,
    /// No ledger entry for the intent.
    Ignored,
}

#[derive(Clone)]
pub struct ReconciliationListener {
    ledger: Arc<dyn LedgerStore>,
}

impl ReconciliationListener {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub fn apply(&self, event: &ProcessorEvent) -> Result<ReconcileOutcome, SettlementError> {
        let Some(entry) = self.ledger.get(&event.intent_ref) else {
            warn!(
                intent = %event.intent_ref,
                kind = ?event.kind,
                "notification for unknown intent"
            );
            return Ok(ReconcileOutcome::Ignored);
        };

        match event.kind {
            EventKind::CaptureSucceeded if entry.metadata.partial_capture => {
                self.sync_settlement_fields(&entry, event)
            }
            EventKind::CaptureSucceeded => self.full_sync(&entry, event),
            EventKind::RefundSucceeded => self.record_refund(&entry, event),
        }
    }

    /// Applies notifications until the channel closes.
    pub fn run(&self, events: Receiver<ProcessorEvent>) {
        for event in events {
            if let Err(e) = self.apply(&event) {
                error!(intent = %event.intent_ref, error = %e, "failed to apply notification");
            }
        }
        debug!("notification channel closed");
    }

    fn sync_settlement_fields(
        &self,
        entry: &LedgerEntry,
        event: &ProcessorEvent,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let manager_revenue = entry.base_amount - event.processor_fee;
        if entry.processor_fee == Some(event.processor_fee)
            && entry.manager_revenue == Some(manager_revenue)
        {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }
        if event.amount != entry.gross_amount {
            warn!(
                intent = %entry.intent,
                notified = %event.amount,
                recorded = %entry.gross_amount,
                "partial capture notification amount differs from recorded capture"
            );
        }

        self.ledger.update(
            &entry.intent,
            LedgerUpdate {
                processor_fee: Some(event.processor_fee),
                manager_revenue: Some(manager_revenue),
                ..Default::default()
            },
        )?;
        info!(
            intent = %entry.intent,
            processor_fee = %event.processor_fee,
            manager_revenue = %manager_revenue,
            "partial capture settled"
        );
        Ok(ReconcileOutcome::SettlementFieldsSynced)
    }

    fn full_sync(
        &self,
        entry: &LedgerEntry,
        event: &ProcessorEvent,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let base_amount = event.amount - entry.platform_fee;
        // A late duplicate must not move a refunded entry back to succeeded.
        let status = matches!(entry.status, LedgerStatus::Pending | LedgerStatus::Processing)
            .then_some(LedgerStatus::Succeeded);

        if entry.gross_amount == event.amount
            && entry.base_amount == base_amount
            && entry.processor_fee == Some(event.processor_fee)
            && entry.manager_revenue == Some(event.net_amount)
            && status.is_none()
        {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        self.ledger.update(
            &entry.intent,
            LedgerUpdate {
                status,
                gross_amount: Some(event.amount),
                base_amount: Some(base_amount),
                processor_fee: Some(event.processor_fee),
                manager_revenue: Some(event.net_amount),
                ..Default::default()
            },
        )?;
        info!(
            intent = %entry.intent,
            amount = %event.amount,
            manager_revenue = %event.net_amount,
            "capture synced from notification"
        );
        Ok(ReconcileOutcome::FullSync)
    }

    fn record_refund(
        &self,
        entry: &LedgerEntry,
        event: &ProcessorEvent,
    ) -> Result<ReconcileOutcome, SettlementError> {
        let Some(refund) = &event.refund_ref else {
            warn!(intent = %entry.intent, "refund notification without refund reference");
            return Ok(ReconcileOutcome::Ignored);
        };
        if entry.has_refund(refund) {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let record = RefundRecord {
            amount: event.amount,
            reason: RefundReason::ProcessorInitiated,
            refund: Some(refund.clone()),
            reversal: None,
            at: Utc::now(),
        };
        if !self.ledger.append_refund_record(&entry.intent, record)? {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let after = self.ledger.get(&entry.intent);
        if let Some(remaining) = after.as_ref().and_then(LedgerEntry::remaining_balance) {
            let status = if remaining.is_zero() {
                LedgerStatus::Refunded
            } else {
                LedgerStatus::PartiallyRefunded
            };
            self.ledger.update(
                &entry.intent,
                LedgerUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            )?;
        }
        info!(
            intent = %entry.intent,
            refund = %refund,
            amount = %event.amount,
            "external refund recorded"
        );
        Ok(ReconcileOutcome::RefundRecorded)
    }
}
