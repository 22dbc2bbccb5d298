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

//! Booking payment settlement engine.
//!
//! The [`SettlementEngine`] turns booking decisions into processor calls and
//! keeps bookings, line items and the ledger consistent with what the
//! processor actually did.
//!
//! # Decisions
//!
//! | Booking state        | Decision                 | Processor call                 | Result                          |
//! |----------------------|--------------------------|--------------------------------|---------------------------------|
//! | pending/authorized   | approve all              | capture (full)                 | confirmed/paid                  |
//! | pending/authorized   | approve, reject some     | capture (partial), fee redone  | confirmed/paid                  |
//! | pending/authorized   | reject all, cancel       | cancel authorization           | cancelled/failed                |
//! | confirmed/paid       | cancel with refund       | refund + reversal              | cancelled/refunded              |
//! | confirmed/paid       | reject items with refund | refund + reversal              | confirmed/partially_refunded    |
//! | confirmed/paid       | cancel without refund    | none                           | cancelled/paid, manual refund   |
//!
//! # Concurrency
//!
//! Each operation takes a claim on its booking first (see
//! [`BookingStore`]); a second operation on the same booking gets
//! [`SettlementError::Conflict`] after `conflict_retries` attempts instead
//! of issuing a second processor call. Operations on different bookings run
//! in parallel.
//!
//! Processor calls run on a worker thread and are bounded by
//! `processor_timeout_ms`. A call that does not answer in time may still
//! have been applied: the booking is flagged `awaiting_reconciliation`, the
//! ledger records the pending operation, and [`SettlementEngine::resolve_pending`]
//! settles it later by re-querying the processor. An authorization that
//! does not answer leaves no intent to record; the booking is flagged all
//! the same and resolution looks the hold up by booking.

use crate::base::{
    BookingId, ExtensionId, IntentRef, LineItemId, PayerRef, RefundRef, ReversalRef,
};
use crate::booking::{
    Booking, BookingClaim, BookingDraft, BookingStatus, BookingStore, PaymentStatus,
    SnapshotEntry,
};
use crate::config::SettlementConfig;
use crate::error::{ProcessorError, SettlementError, ValidationError};
use crate::extension::{Extension, ExtensionDraft, ExtensionStatus, ExtensionStore};
use crate::ledger::{
    CaptureSource, ChargeKind, LedgerEntry, LedgerStatus, LedgerStore, LedgerUpdate,
    MetadataPatch, PendingOperation, RefundReason, RefundRecord,
};
use crate::line_item::{LineItem, LineItemRegistry};
use crate::money::Money;
use crate::processor::{
    AuthorizeRequest, IntentState, IntentStatus, ProcessorAdapter, ProcessorEvent,
};
use crate::reconciliation::ReconciliationListener;
use crate::settlement::{self, CapturePlan};
use chrono::Utc;
use crossbeam::channel::{RecvTimeoutError, bounded};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Manager's decision on a pending booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Confirm the booking. Line items in `rejected` are dropped from the
    /// charge; every other active line item is approved with it.
    Approve {
        approved: Vec<LineItemId>,
        rejected: Vec<LineItemId>,
    },
    /// Decline the whole booking.
    Reject,
}

impl ApprovalDecision {
    pub fn approve_all() -> Self {
        ApprovalDecision::Approve {
            approved: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub amount: Money,
    pub refund: RefundRef,
    pub reversal: ReversalRef,
}

/// Outcome of a settlement operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementResult {
    pub booking_status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub refund: Option<RefundReceipt>,
    pub requires_manual_refund: bool,
}

impl SettlementResult {
    fn of(booking: &Booking, refund: Option<RefundReceipt>) -> Self {
        Self {
            booking_status: booking.status,
            payment_status: booking.payment_status,
            refund,
            requires_manual_refund: booking.requires_manual_refund,
        }
    }
}

/// Line items leaving a settled booking, and whether the booking goes too.
struct Rejection {
    whole_booking: bool,
    items: Vec<LineItem>,
}

impl Rejection {
    fn ids(&self) -> Vec<LineItemId> {
        self.items.iter().map(|item| item.id).collect()
    }

    fn reason(&self) -> RefundReason {
        if self.whole_booking {
            RefundReason::BookingCancelled
        } else {
            RefundReason::LineItemsRejected
        }
    }
}

pub struct SettlementEngine {
    config: SettlementConfig,
    bookings: BookingStore,
    line_items: LineItemRegistry,
    extensions: ExtensionStore,
    ledger: Arc<dyn LedgerStore>,
    processor: Arc<dyn ProcessorAdapter>,
    listener: ReconciliationListener,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        ledger: Arc<dyn LedgerStore>,
        processor: Arc<dyn ProcessorAdapter>,
    ) -> Self {
        let listener = ReconciliationListener::new(Arc::clone(&ledger));
        Self {
            config,
            bookings: BookingStore::new(),
            line_items: LineItemRegistry::new(),
            extensions: ExtensionStore::new(),
            ledger,
            processor,
            listener,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// A listener writing to this engine's ledger.
    pub fn listener(&self) -> &ReconciliationListener {
        &self.listener
    }

    pub fn booking(&self, id: BookingId) -> Option<Booking> {
        self.bookings.get(id)
    }

    /// All bookings, ordered by ID.
    pub fn bookings(&self) -> Vec<Booking> {
        self.bookings.all()
    }

    pub fn line_items(&self, booking_id: BookingId) -> Vec<LineItem> {
        self.line_items.for_booking(booking_id)
    }

    pub fn extension(&self, id: ExtensionId) -> Option<Extension> {
        self.extensions.get(id)
    }

    pub fn ledger_entry(&self, intent: &IntentRef) -> Option<LedgerEntry> {
        self.ledger.get(intent)
    }

    pub fn ledger_entries(&self, booking_id: BookingId) -> Vec<LedgerEntry> {
        self.ledger.entries_for_booking(booking_id)
    }

    /// Registers a new booking with its line items.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::Duplicate`] - booking or line item ID already in use.
    /// - [`ValidationError::ForeignLineItem`] - a line item names another booking.
    /// - [`ValidationError::NegativeAmount`] - negative rate or price.
    /// - [`ValidationError::AmountOverflow`] - the total does not fit in an amount.
    pub fn create_booking(&self, draft: BookingDraft) -> Result<Booking, SettlementError> {
        if draft.hourly_rate.is_negative() {
            return Err(ValidationError::NegativeAmount.into());
        }
        let base_price = draft
            .hourly_rate
            .cents()
            .checked_mul(i64::from(draft.duration_hours))
            .map(Money::from_cents)
            .ok_or(ValidationError::AmountOverflow)?;
        if self.bookings.get(draft.id).is_some() {
            return Err(ValidationError::Duplicate(format!("booking {}", draft.id)).into());
        }
        if draft.line_items.iter().any(|i| i.price.is_negative()) {
            return Err(ValidationError::NegativeAmount.into());
        }
        if let Some(item) = draft.line_items.iter().find(|i| i.booking_id != draft.id) {
            return Err(ValidationError::ForeignLineItem {
                item: item.id,
                booking: draft.id,
            }
            .into());
        }
        // The hold must be expressible before the booking is accepted.
        settlement::authorization_amount(base_price, draft.tax_rate, &draft.line_items)?;

        let mut booking = Booking::new(draft.id, base_price, draft.tax_rate);
        booking.snapshot = draft.line_items.iter().map(SnapshotEntry::from).collect();
        for item in draft.line_items {
            self.line_items.attach(item)?;
        }
        self.bookings.insert(booking.clone())?;
        info!(booking_id = %booking.id, base_price = %base_price, "booking created");
        Ok(booking)
    }

    pub fn create_extension(&self, draft: ExtensionDraft) -> Result<Extension, SettlementError> {
        if self.bookings.get(draft.booking_id).is_none() {
            return Err(ValidationError::BookingNotFound(draft.booking_id).into());
        }
        let extension = Extension::try_from(draft)?;
        self.extensions.insert(extension.clone())?;
        info!(
            extension_id = %extension.id,
            booking_id = %extension.booking_id,
            kind = ?extension.kind,
            total = %extension.total(),
            "extension created"
        );
        Ok(extension)
    }

    /// Places the hold for the booking and all its active line items.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::AwaitingReconciliation`] - an earlier authorization
    ///   timed out and has not been resolved.
    /// - [`ProcessorError::Timeout`] - no answer in time; the booking is
    ///   flagged until [`SettlementEngine::resolve_pending`] runs.
    pub fn authorize_booking(
        &self,
        booking_id: BookingId,
        payer: &PayerRef,
    ) -> Result<SettlementResult, SettlementError> {
        let result = self.with_claim(booking_id, |claim| self.authorize(claim, payer));
        self.finish(booking_id, "authorize", result)
    }

    /// Applies a manager's approval decision to a pending booking.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidTransition`] - booking is not pending/authorized.
    /// - [`ValidationError::ConflictingDecision`] - an item is both approved and rejected.
    /// - [`ValidationError::ForeignLineItem`] - an item belongs to another booking.
    /// - [`SettlementError::Conflict`] - another operation holds the booking.
    /// - [`SettlementError::OutcomeUnknown`] - the processor did not answer in time.
    /// - [`ProcessorError::AuthorizationExpired`] - the hold lapsed before capture.
    pub fn decide_approval(
        &self,
        booking_id: BookingId,
        decision: &ApprovalDecision,
    ) -> Result<SettlementResult, SettlementError> {
        let result = self.with_claim(booking_id, |claim| match decision {
            ApprovalDecision::Approve { approved, rejected } => {
                self.approve(claim, approved, rejected)
            }
            ApprovalDecision::Reject => self.reject(claim),
        });
        self.finish(booking_id, "approval", result)
    }

    /// Payer asks to cancel a confirmed booking; the manager decides later.
    pub fn request_cancellation(
        &self,
        booking_id: BookingId,
    ) -> Result<SettlementResult, SettlementError> {
        let result = self.with_claim(booking_id, |claim| {
            let booking = claim.booking();
            Self::ensure_not_awaiting(booking)?;
            if booking.status != BookingStatus::Confirmed {
                return Err(booking.invalid_transition("request cancellation of").into());
            }
            let booking = claim.commit(|b| b.status = BookingStatus::CancellationRequested)?;
            Ok(SettlementResult::of(booking, None))
        });
        self.finish(booking_id, "cancellation request", result)
    }

    /// Cancels a booking in any non-terminal state.
    ///
    /// Before capture the hold is released. After capture the booking is
    /// refunded if `refund_requested`, otherwise it is flagged for a manual
    /// refund.
    pub fn decide_cancellation(
        &self,
        booking_id: BookingId,
        refund_requested: bool,
    ) -> Result<SettlementResult, SettlementError> {
        let result = self.with_claim(booking_id, |claim| {
            let booking = claim.booking().clone();
            Self::ensure_not_awaiting(&booking)?;
            match (booking.status, booking.payment_status) {
                (BookingStatus::Pending, PaymentStatus::Authorized) => {
                    self.release_hold(claim)
                }
                (BookingStatus::Pending, PaymentStatus::Pending | PaymentStatus::Failed) => {
                    self.cancel_unpaid(claim)
                }
                (
                    BookingStatus::Confirmed | BookingStatus::CancellationRequested,
                    payment,
                ) if payment.is_settled() => {
                    let rejection = Rejection {
                        whole_booking: true,
                        items: self.active_items(booking_id),
                    };
                    self.settle_rejection(claim, rejection, refund_requested)
                }
                _ => Err(booking.invalid_transition("cancel").into()),
            }
        });
        self.finish(booking_id, "cancellation", result)
    }

    /// Rejects line items of a confirmed booking; the booking stays confirmed.
    pub fn cancel_line_items(
        &self,
        booking_id: BookingId,
        items: &[LineItemId],
        refund_requested: bool,
    ) -> Result<SettlementResult, SettlementError> {
        if items.is_empty() {
            return Err(ValidationError::EmptySelection.into());
        }
        let result = self.with_claim(booking_id, |claim| {
            let booking = claim.booking().clone();
            Self::ensure_not_awaiting(&booking)?;
            if booking.status != BookingStatus::Confirmed || !booking.payment_status.is_settled()
            {
                return Err(booking.invalid_transition("cancel line items of").into());
            }
            let selected = self.select_items(&booking, items)?;
            if let Some(item) = selected
                .iter()
                .find(|item| !item.is_active() || !item.payment_status.is_settled())
            {
                return Err(ValidationError::LineItemNotSettleable(item.id).into());
            }
            let rejection = Rejection {
                whole_booking: false,
                items: selected,
            };
            self.settle_rejection(claim, rejection, refund_requested)
        });
        self.finish(booking_id, "line item cancellation", result)
    }

    /// Places the hold for an extension or penalty on its own intent.
    pub fn authorize_extension(
        &self,
        extension_id: ExtensionId,
        payer: &PayerRef,
    ) -> Result<Extension, SettlementError> {
        let extension = self.find_extension(extension_id)?;
        let result = self.with_claim(extension.booking_id, |claim| {
            let booking = claim.booking();
            if booking.status != BookingStatus::Confirmed {
                return Err(booking.invalid_transition("extend").into());
            }
            let extension = self.find_extension(extension_id)?;
            if extension.payment_status != PaymentStatus::Pending {
                return Err(ValidationError::ExtensionNotPending(extension_id).into());
            }

            let amount = extension.total();
            let platform_fee = self.config.platform_fee.fee_for(amount);
            let request = AuthorizeRequest {
                amount,
                currency: self.config.currency.clone(),
                payer: payer.clone(),
                application_fee: platform_fee,
                booking_id: extension.booking_id,
                kind: extension.kind,
            };
            match self.call("authorize", move |p| p.authorize(request)) {
                Ok(intent) => {
                    self.ledger.create(LedgerEntry::authorized(
                        intent.clone(),
                        extension.booking_id,
                        extension.kind,
                        amount,
                        platform_fee,
                    ))?;
                    info!(
                        extension_id = %extension_id,
                        intent = %intent,
                        amount = %amount,
                        "extension authorized"
                    );
                    self.extensions
                        .update(extension_id, PaymentStatus::Pending, |e| {
                            e.payment_status = PaymentStatus::Authorized;
                            e.payment_intent = Some(intent);
                        })
                }
                Err(ProcessorError::Declined(reason)) => {
                    self.extensions
                        .update(extension_id, PaymentStatus::Pending, |e| {
                            e.payment_status = PaymentStatus::Failed;
                        })?;
                    Err(ProcessorError::Declined(reason).into())
                }
                Err(e) => Err(e.into()),
            }
        });
        if let Err(e) = &result {
            Self::log_failure("extension authorization", extension.booking_id, e);
        }
        result
    }

    /// Captures an authorized extension or penalty in full.
    pub fn approve_extension(
        &self,
        extension_id: ExtensionId,
    ) -> Result<Extension, SettlementError> {
        let extension = self.find_extension(extension_id)?;
        let result = self.with_claim(extension.booking_id, |claim| {
            let extension = self.authorized_extension(claim, extension_id, "approve")?;
            let intent = extension.intent()?.clone();
            let entry = self.find_entry(&intent)?;
            let plan = settlement::capture_plan(
                extension.subtotal,
                extension.tax_rate,
                &[],
                &BTreeSet::new(),
                entry.authorized_amount,
                &self.config.platform_fee,
            )?;

            self.begin_capture(&intent, &plan)?;
            match self.issue_capture(&intent, &plan) {
                Ok(captured) => {
                    self.mark_captured(&intent, captured)?;
                    info!(
                        extension_id = %extension_id,
                        intent = %intent,
                        captured = %captured,
                        "extension captured"
                    );
                    self.extensions
                        .update(extension_id, PaymentStatus::Authorized, |e| {
                            e.status = ExtensionStatus::Approved;
                            e.payment_status = PaymentStatus::Paid;
                        })
                }
                Err(e) if e.is_ambiguous() => {
                    self.mark_pending(&intent, PendingOperation::Capture { rejected: Vec::new() })?;
                    Err(SettlementError::OutcomeUnknown { intent })
                }
                Err(ProcessorError::AuthorizationExpired) => {
                    self.mark_canceled(&intent)?;
                    self.extensions
                        .update(extension_id, PaymentStatus::Authorized, |e| {
                            e.payment_status = PaymentStatus::Failed;
                        })?;
                    Err(ProcessorError::AuthorizationExpired.into())
                }
                Err(e) => {
                    self.abort_capture(&intent)?;
                    Err(e.into())
                }
            }
        });
        if let Err(e) = &result {
            Self::log_failure("extension approval", extension.booking_id, e);
        }
        result
    }

    /// Releases the hold of an authorized extension or penalty.
    pub fn decline_extension(
        &self,
        extension_id: ExtensionId,
    ) -> Result<Extension, SettlementError> {
        let extension = self.find_extension(extension_id)?;
        let result = self.with_claim(extension.booking_id, |claim| {
            let extension = self.authorized_extension(claim, extension_id, "decline")?;
            let intent = extension.intent()?.clone();
            let call_intent = intent.clone();
            match self.call("cancel_authorization", move |p| {
                p.cancel_authorization(&call_intent)
            }) {
                Ok(_) | Err(ProcessorError::AuthorizationExpired) => {
                    self.mark_canceled(&intent)?;
                    info!(extension_id = %extension_id, intent = %intent, "extension declined");
                    self.extensions
                        .update(extension_id, PaymentStatus::Authorized, |e| {
                            e.status = ExtensionStatus::Declined;
                            e.payment_status = PaymentStatus::Failed;
                        })
                }
                Err(e) if e.is_ambiguous() => {
                    self.mark_pending(&intent, PendingOperation::CancelAuthorization)?;
                    Err(SettlementError::OutcomeUnknown { intent })
                }
                Err(e) => Err(e.into()),
            }
        });
        if let Err(e) = &result {
            Self::log_failure("extension decline", extension.booking_id, e);
        }
        result
    }

    /// Settles a booking whose last processor call ended ambiguously.
    ///
    /// Re-queries the intent and completes or rolls back the recorded
    /// pending operation to match what the processor reports. A booking
    /// without an intent had its authorization time out; the processor is
    /// asked for a hold placed for the booking.
    pub fn resolve_pending(
        &self,
        booking_id: BookingId,
    ) -> Result<SettlementResult, SettlementError> {
        let result = self.with_claim(booking_id, |claim| {
            let booking = claim.booking().clone();
            if !booking.awaiting_reconciliation {
                return Err(booking.invalid_transition("resolve").into());
            }
            let Some(intent) = booking.payment_intent.clone() else {
                return self.resolve_authorization(claim);
            };
            let entry = self.find_entry(&intent)?;
            let Some(operation) = entry.metadata.pending_operation.clone() else {
                let booking = claim.commit(|b| b.awaiting_reconciliation = false)?;
                return Ok(SettlementResult::of(booking, None));
            };

            let state = self.retrieve(&intent)?;
            match (operation, state.status) {
                (
                    PendingOperation::Refund {
                        amount,
                        items,
                        whole_booking,
                        known_refunds,
                    },
                    _,
                ) => {
                    let rejection = Rejection {
                        whole_booking,
                        items: self.select_items(&booking, &items)?,
                    };
                    self.resolve_refund(claim, &state, rejection, amount, &known_refunds)
                }
                (PendingOperation::Capture { rejected }, IntentStatus::Succeeded) => {
                    self.complete_capture(claim, &intent, &rejected, state.captured_amount)
                }
                (PendingOperation::CancelAuthorization, IntentStatus::Canceled) => {
                    self.complete_release(claim, &intent)
                }
                (PendingOperation::Capture { .. }, IntentStatus::Canceled) => {
                    self.authorization_lapsed(claim, &intent)
                }
                (_, IntentStatus::RequiresCapture) => {
                    // The call never took effect; the hold is still in place.
                    self.abort_capture(&intent)?;
                    let booking = claim.commit(|b| b.awaiting_reconciliation = false)?;
                    info!(
                        booking_id = %booking_id,
                        intent = %intent,
                        "pending operation did not apply"
                    );
                    Ok(SettlementResult::of(booking, None))
                }
                (_, IntentStatus::Processing) => Err(SettlementError::OutcomeUnknown { intent }),
                (PendingOperation::CancelAuthorization, IntentStatus::Succeeded) => {
                    Err(SettlementError::InvariantViolation(format!(
                        "intent {intent} was captured while its hold was being released"
                    )))
                }
            }
        });
        self.finish(booking_id, "resolution", result)
    }

    /// Settles an extension whose last processor call ended ambiguously.
    pub fn resolve_extension(
        &self,
        extension_id: ExtensionId,
    ) -> Result<Extension, SettlementError> {
        let extension = self.find_extension(extension_id)?;
        let result = self.with_claim(extension.booking_id, |_claim| {
            let extension = self.find_extension(extension_id)?;
            let intent = extension.intent()?.clone();
            let entry = self.find_entry(&intent)?;
            let Some(operation) = entry.metadata.pending_operation.clone() else {
                return Ok(extension);
            };
            let state = self.retrieve(&intent)?;
            match (operation, state.status) {
                (PendingOperation::Refund { .. }, _) => {
                    Err(SettlementError::InvariantViolation(format!(
                        "extension intent {intent} has a pending refund"
                    )))
                }
                (PendingOperation::Capture { .. }, IntentStatus::Succeeded) => {
                    self.mark_captured(&intent, state.captured_amount)?;
                    self.extensions
                        .update(extension_id, PaymentStatus::Authorized, |e| {
                            e.status = ExtensionStatus::Approved;
                            e.payment_status = PaymentStatus::Paid;
                        })
                }
                (_, IntentStatus::Canceled) => {
                    self.mark_canceled(&intent)?;
                    self.extensions
                        .update(extension_id, PaymentStatus::Authorized, |e| {
                            e.status = ExtensionStatus::Declined;
                            e.payment_status = PaymentStatus::Failed;
                        })
                }
                (_, IntentStatus::RequiresCapture) => {
                    self.abort_capture(&intent)?;
                    Ok(extension)
                }
                (_, IntentStatus::Processing) => Err(SettlementError::OutcomeUnknown { intent }),
                (PendingOperation::CancelAuthorization, IntentStatus::Succeeded) => {
                    Err(SettlementError::InvariantViolation(format!(
                        "intent {intent} was captured while its hold was being released"
                    )))
                }
            }
        });
        if let Err(e) = &result {
            Self::log_failure("extension resolution", extension.booking_id, e);
        }
        result
    }

    /// Re-derives the booking's line item snapshot from the line items.
    ///
    /// Idempotent. An item once marked rejected stays rejected.
    pub fn ensure_snapshot_consistency(
        &self,
        booking_id: BookingId,
    ) -> Result<(), SettlementError> {
        let items = self.line_items.for_booking(booking_id);
        self.bookings.update_snapshot(booking_id, |snapshot| {
            for item in &items {
                match snapshot.iter_mut().find(|e| e.line_item_id == item.id) {
                    Some(entry) => {
                        entry.status = item.status;
                        entry.payment_status = item.payment_status;
                        entry.rejected |= item.is_rejected();
                    }
                    None => snapshot.push(SnapshotEntry::from(item)),
                }
            }
            snapshot.sort_by_key(|entry| entry.line_item_id);
        })?;
        Ok(())
    }

    // --- operations under a booking claim ---

    fn authorize(
        &self,
        claim: &mut BookingClaim<'_>,
        payer: &PayerRef,
    ) -> Result<SettlementResult, SettlementError> {
        let booking = claim.booking().clone();
        Self::ensure_not_awaiting(&booking)?;
        if booking.status != BookingStatus::Pending
            || booking.payment_status != PaymentStatus::Pending
        {
            return Err(booking.invalid_transition("authorize").into());
        }
        let items = self.active_items(booking.id);
        let amount = settlement::authorization_amount(booking.base_price, booking.tax_rate, &items)?;
        let platform_fee = self.config.platform_fee.fee_for(amount);
        let request = AuthorizeRequest {
            amount,
            currency: self.config.currency.clone(),
            payer: payer.clone(),
            application_fee: platform_fee,
            booking_id: booking.id,
            kind: ChargeKind::Booking,
        };

        match self.call("authorize", move |p| p.authorize(request)) {
            Ok(intent) => self.record_authorization(claim, intent, amount, platform_fee),
            Err(ProcessorError::Declined(reason)) => {
                claim.commit(|b| b.payment_status = PaymentStatus::Failed)?;
                Err(ProcessorError::Declined(reason).into())
            }
            Err(e) if e.is_ambiguous() => {
                // A hold may already exist.
                claim.commit(|b| b.awaiting_reconciliation = true)?;
                warn!(
                    booking_id = %booking.id,
                    "authorization outcome unknown; awaiting reconciliation"
                );
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records a hold the processor has placed for the booking.
    fn record_authorization(
        &self,
        claim: &mut BookingClaim<'_>,
        intent: IntentRef,
        amount: Money,
        platform_fee: Money,
    ) -> Result<SettlementResult, SettlementError> {
        let booking_id = claim.booking().id;
        self.ledger.create(LedgerEntry::authorized(
            intent.clone(),
            booking_id,
            ChargeKind::Booking,
            amount,
            platform_fee,
        ))?;
        let ids: Vec<LineItemId> = self
            .active_items(booking_id)
            .iter()
            .map(|item| item.id)
            .collect();
        self.line_items.transition(
            &ids,
            &[PaymentStatus::Pending],
            BookingStatus::Pending,
            PaymentStatus::Authorized,
        )?;
        info!(booking_id = %booking_id, intent = %intent, amount = %amount, "booking authorized");
        let booking = claim.commit(|b| {
            b.payment_status = PaymentStatus::Authorized;
            b.payment_intent = Some(intent);
            b.awaiting_reconciliation = false;
        })?;
        Ok(SettlementResult::of(booking, None))
    }

    /// Settles an authorization that timed out: adopts the hold if the
    /// processor placed one, otherwise lets the booking be authorized again.
    fn resolve_authorization(
        &self,
        claim: &mut BookingClaim<'_>,
    ) -> Result<SettlementResult, SettlementError> {
        let booking_id = claim.booking().id;
        let found = self.call("find_authorization", move |p| {
            p.find_authorization(booking_id, ChargeKind::Booking)
        })?;
        match found {
            Some(state) if state.status == IntentStatus::RequiresCapture => {
                let platform_fee = self.config.platform_fee.fee_for(state.authorized_amount);
                let amount = state.authorized_amount;
                self.record_authorization(claim, state.intent, amount, platform_fee)
            }
            Some(state) if state.status != IntentStatus::Canceled => {
                Err(SettlementError::InvariantViolation(format!(
                    "intent {} of unauthorized booking {booking_id} is {:?}",
                    state.intent, state.status
                )))
            }
            // No hold, or one that has already lapsed.
            _ => {
                let booking = claim.commit(|b| b.awaiting_reconciliation = false)?;
                info!(booking_id = %booking_id, "no hold placed; authorization can be retried");
                Ok(SettlementResult::of(booking, None))
            }
        }
    }

    fn approve(
        &self,
        claim: &mut BookingClaim<'_>,
        approved: &[LineItemId],
        rejected: &[LineItemId],
    ) -> Result<SettlementResult, SettlementError> {
        let booking = claim.booking().clone();
        Self::ensure_not_awaiting(&booking)?;
        if booking.status != BookingStatus::Pending
            || booking.payment_status != PaymentStatus::Authorized
        {
            return Err(booking.invalid_transition("approve").into());
        }
        let intent = booking.intent()?.clone();

        let rejected = self.validate_decision(&booking, approved, rejected)?;
        let items = self.line_items.for_booking(booking.id);
        let entry = self.find_entry(&intent)?;
        let plan = settlement::capture_plan(
            booking.base_price,
            booking.tax_rate,
            &items,
            &rejected,
            entry.authorized_amount,
            &self.config.platform_fee,
        )?;
        debug!(
            booking_id = %booking.id,
            capture = %plan.capture_amount,
            authorized = %plan.authorized_amount,
            platform_fee = %plan.platform_fee,
            partial = plan.is_partial(),
            "capture planned"
        );

        self.begin_capture(&intent, &plan)?;
        match self.issue_capture(&intent, &plan) {
            Ok(captured) => self.complete_capture(claim, &intent, &plan.rejected, captured),
            Err(e) if e.is_ambiguous() => self.park(
                claim,
                &intent,
                PendingOperation::Capture {
                    rejected: plan.rejected.clone(),
                },
            ),
            Err(ProcessorError::AuthorizationExpired) => {
                self.authorization_lapsed(claim, &intent)?;
                Err(ProcessorError::AuthorizationExpired.into())
            }
            Err(e) => {
                self.abort_capture(&intent)?;
                Err(e.into())
            }
        }
    }

    fn reject(&self, claim: &mut BookingClaim<'_>) -> Result<SettlementResult, SettlementError> {
        let booking = claim.booking().clone();
        Self::ensure_not_awaiting(&booking)?;
        match (booking.status, booking.payment_status) {
            (BookingStatus::Pending, PaymentStatus::Authorized) => self.release_hold(claim),
            (BookingStatus::Pending, PaymentStatus::Pending | PaymentStatus::Failed) => {
                self.cancel_unpaid(claim)
            }
            _ => Err(booking.invalid_transition("reject").into()),
        }
    }

    fn release_hold(
        &self,
        claim: &mut BookingClaim<'_>,
    ) -> Result<SettlementResult, SettlementError> {
        let intent = claim.booking().intent()?.clone();
        let call_intent = intent.clone();
        match self.call("cancel_authorization", move |p| {
            p.cancel_authorization(&call_intent)
        }) {
            // A lapsed hold is as released as a cancelled one.
            Ok(_) | Err(ProcessorError::AuthorizationExpired) => {
                self.complete_release(claim, &intent)
            }
            Err(e) if e.is_ambiguous() => {
                self.park(claim, &intent, PendingOperation::CancelAuthorization)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn complete_release(
        &self,
        claim: &mut BookingClaim<'_>,
        intent: &IntentRef,
    ) -> Result<SettlementResult, SettlementError> {
        self.mark_canceled(intent)?;
        let ids = self.fail_active_items(claim.booking().id)?;
        let booking = claim.commit(|b| {
            b.status = BookingStatus::Cancelled;
            b.payment_status = PaymentStatus::Failed;
            b.awaiting_reconciliation = false;
            mark_rejected(&mut b.snapshot, &ids);
        })?;
        info!(booking_id = %booking.id, intent = %intent, "hold released, booking cancelled");
        Ok(SettlementResult::of(booking, None))
    }

    fn cancel_unpaid(
        &self,
        claim: &mut BookingClaim<'_>,
    ) -> Result<SettlementResult, SettlementError> {
        let ids = self.fail_active_items(claim.booking().id)?;
        let booking = claim.commit(|b| {
            b.status = BookingStatus::Cancelled;
            b.payment_status = PaymentStatus::Failed;
            mark_rejected(&mut b.snapshot, &ids);
        })?;
        info!(booking_id = %booking.id, "unpaid booking cancelled");
        Ok(SettlementResult::of(booking, None))
    }

    fn complete_capture(
        &self,
        claim: &mut BookingClaim<'_>,
        intent: &IntentRef,
        rejected: &[LineItemId],
        captured: Money,
    ) -> Result<SettlementResult, SettlementError> {
        let entry = self.mark_captured(intent, captured)?;
        let booking_id = claim.booking().id;
        let (rejected_items, approved_items): (Vec<LineItem>, Vec<LineItem>) = self
            .line_items
            .for_booking(booking_id)
            .into_iter()
            .filter(LineItem::is_active)
            .partition(|item| rejected.contains(&item.id));
        let approved: Vec<LineItemId> = approved_items.iter().map(|item| item.id).collect();
        let rejected: Vec<LineItemId> = rejected_items.iter().map(|item| item.id).collect();
        let hold = [PaymentStatus::Authorized, PaymentStatus::Pending];
        self.line_items
            .transition(&approved, &hold, BookingStatus::Confirmed, PaymentStatus::Paid)?;
        self.line_items
            .transition(&rejected, &hold, BookingStatus::Cancelled, PaymentStatus::Failed)?;

        let booking = claim.commit(|b| {
            b.status = BookingStatus::Confirmed;
            b.payment_status = PaymentStatus::Paid;
            b.awaiting_reconciliation = false;
            mark_rejected(&mut b.snapshot, &rejected);
        })?;
        info!(
            booking_id = %booking.id,
            intent = %intent,
            captured = %captured,
            platform_fee = %entry.platform_fee,
            rejected_items = rejected.len(),
            "booking captured"
        );
        Ok(SettlementResult::of(booking, None))
    }

    /// Hold expired before capture. Nothing was charged.
    fn authorization_lapsed(
        &self,
        claim: &mut BookingClaim<'_>,
        intent: &IntentRef,
    ) -> Result<SettlementResult, SettlementError> {
        self.mark_canceled(intent)?;
        let booking = claim.commit(|b| {
            b.payment_status = PaymentStatus::Failed;
            b.awaiting_reconciliation = false;
        })?;
        warn!(booking_id = %booking.id, intent = %intent, "authorization lapsed before capture");
        Ok(SettlementResult::of(booking, None))
    }

    /// Records an ambiguous call and reports it to the caller.
    fn park(
        &self,
        claim: &mut BookingClaim<'_>,
        intent: &IntentRef,
        operation: PendingOperation,
    ) -> Result<SettlementResult, SettlementError> {
        self.mark_pending(intent, operation)?;
        claim.commit(|b| b.awaiting_reconciliation = true)?;
        warn!(intent = %intent, "processor outcome unknown; awaiting reconciliation");
        Err(SettlementError::OutcomeUnknown {
            intent: intent.clone(),
        })
    }

    /// Removes settled line items (or the whole booking) from the charge.
    fn settle_rejection(
        &self,
        claim: &mut BookingClaim<'_>,
        rejection: Rejection,
        refund_requested: bool,
    ) -> Result<SettlementResult, SettlementError> {
        if !refund_requested {
            warn!(
                booking_id = %claim.booking().id,
                whole_booking = rejection.whole_booking,
                "cancelled without refund; flagged for manual refund"
            );
            return self.commit_rejection(claim, &rejection, None, false, true);
        }

        let booking = claim.booking().clone();
        let intent = booking.intent()?.clone();
        let entry = self.settled_entry(&intent)?;
        if entry.manager_revenue.is_none() {
            warn!(
                booking_id = %booking.id,
                intent = %intent,
                "capture not settled yet; refund needs manual handling"
            );
            return self.commit_rejection(claim, &rejection, None, false, true);
        }

        let start = if rejection.whole_booking {
            booking.base_price
        } else {
            Money::ZERO
        };
        let rejected_subtotal = rejection
            .items
            .iter()
            .try_fold(start, |sum, item| sum.checked_add(item.price))
            .ok_or(ValidationError::AmountOverflow)?;
        let plan = settlement::refund_plan(rejected_subtotal, booking.tax_rate, &entry)?;
        if plan.refund_amount != plan.reversal_amount {
            return Err(SettlementError::InvariantViolation(format!(
                "refund {} differs from reversal {}",
                plan.refund_amount, plan.reversal_amount
            )));
        }
        debug!(
            booking_id = %booking.id,
            gross_refund = %plan.gross_refund,
            processor_fee_share = %plan.proportional_processor_fee,
            refund = %plan.refund_amount,
            "refund planned"
        );
        if plan.refund_amount.is_zero() {
            info!(booking_id = %booking.id, intent = %intent, "nothing left to refund");
            return self.commit_rejection(claim, &rejection, None, true, false);
        }

        let reason = rejection.reason();
        let (amount, call_intent) = (plan.refund_amount, intent.clone());
        match self.call("refund", move |p| {
            p.refund_with_reversal(&call_intent, amount, &reason.to_string(), amount)
        }) {
            Ok(response) => {
                self.ledger.append_refund_record(
                    &intent,
                    RefundRecord {
                        amount,
                        reason,
                        refund: Some(response.refund.clone()),
                        reversal: Some(response.reversal.clone()),
                        at: Utc::now(),
                    },
                )?;
                self.sync_refund_status(&intent)?;
                info!(
                    booking_id = %booking.id,
                    intent = %intent,
                    refund = %response.refund,
                    amount = %amount,
                    "refund issued"
                );
                let receipt = RefundReceipt {
                    amount,
                    refund: response.refund,
                    reversal: response.reversal,
                };
                self.commit_rejection(claim, &rejection, Some(receipt), true, false)
            }
            Err(e) if e.is_ambiguous() => {
                let known_refunds = entry
                    .refunds
                    .iter()
                    .filter_map(|record| record.refund.clone())
                    .collect();
                let operation = PendingOperation::Refund {
                    amount,
                    items: rejection.ids(),
                    whole_booking: rejection.whole_booking,
                    known_refunds,
                };
                self.park(claim, &intent, operation)
            }
            Err(e) => {
                warn!(
                    booking_id = %booking.id,
                    intent = %intent,
                    error = %e,
                    "refund failed; flagged for manual refund"
                );
                self.commit_rejection(claim, &rejection, None, false, true)
            }
        }
    }

    /// Settles a refund whose call timed out. A refund the processor lists
    /// that was not on the entry before the call, for the same amount, is
    /// the one issued; without it the refund is left to an operator.
    fn resolve_refund(
        &self,
        claim: &mut BookingClaim<'_>,
        state: &IntentState,
        rejection: Rejection,
        amount: Money,
        known_refunds: &[RefundRef],
    ) -> Result<SettlementResult, SettlementError> {
        let (booking_id, intent) = (claim.booking().id, &state.intent);
        let issued = state
            .refunds
            .iter()
            .find(|refund| refund.amount == amount && !known_refunds.contains(&refund.refund));
        let Some(issued) = issued else {
            self.clear_pending(intent)?;
            warn!(
                booking_id = %booking_id,
                intent = %intent,
                amount = %amount,
                "pending refund did not apply; flagged for manual refund"
            );
            return self.commit_rejection(claim, &rejection, None, false, true);
        };

        self.ledger.append_refund_record(
            intent,
            RefundRecord {
                amount,
                reason: rejection.reason(),
                refund: Some(issued.refund.clone()),
                reversal: issued.reversal.clone(),
                at: Utc::now(),
            },
        )?;
        self.sync_refund_status(intent)?;
        self.clear_pending(intent)?;
        info!(
            booking_id = %booking_id,
            intent = %intent,
            refund = %issued.refund,
            amount = %amount,
            "pending refund confirmed"
        );
        let receipt = issued.reversal.clone().map(|reversal| RefundReceipt {
            amount,
            refund: issued.refund.clone(),
            reversal,
        });
        self.commit_rejection(claim, &rejection, receipt, true, false)
    }

    fn commit_rejection(
        &self,
        claim: &mut BookingClaim<'_>,
        rejection: &Rejection,
        receipt: Option<RefundReceipt>,
        refunded: bool,
        manual_refund: bool,
    ) -> Result<SettlementResult, SettlementError> {
        let ids = rejection.ids();
        for item in &rejection.items {
            let payment = if refunded {
                PaymentStatus::Refunded
            } else {
                item.payment_status
            };
            self.line_items.transition(
                &[item.id],
                &[item.payment_status],
                BookingStatus::Cancelled,
                payment,
            )?;
        }

        let whole_booking = rejection.whole_booking;
        let booking = claim.commit(|b| {
            if whole_booking {
                b.status = BookingStatus::Cancelled;
                if refunded {
                    b.payment_status = PaymentStatus::Refunded;
                }
            } else if refunded {
                b.payment_status = PaymentStatus::PartiallyRefunded;
            }
            b.requires_manual_refund |= manual_refund;
            b.awaiting_reconciliation = false;
            mark_rejected(&mut b.snapshot, &ids);
        })?;
        Ok(SettlementResult::of(booking, receipt))
    }

    // --- ledger helpers ---

    /// Writes the capture plan and the `Processing` status before the
    /// capture is issued, so a notification arriving first sees the marker.
    fn begin_capture(&self, intent: &IntentRef, plan: &CapturePlan) -> Result<(), SettlementError> {
        let partial = plan.is_partial();
        self.ledger.update(
            intent,
            LedgerUpdate {
                status: Some(LedgerStatus::Processing),
                gross_amount: Some(plan.capture_amount),
                base_amount: Some(plan.base_amount()),
                platform_fee: Some(plan.platform_fee),
                metadata: MetadataPatch {
                    partial_capture: Some(partial),
                    approved_subtotal: Some(plan.approved_subtotal),
                    approved_tax: Some(plan.tax),
                    capture_source: Some(if partial {
                        CaptureSource::Partial
                    } else {
                        CaptureSource::Full
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn issue_capture(
        &self,
        intent: &IntentRef,
        plan: &CapturePlan,
    ) -> Result<Money, ProcessorError> {
        let (amount, fee) = if plan.is_partial() {
            (Some(plan.capture_amount), Some(plan.platform_fee))
        } else {
            (None, None)
        };
        let call_intent = intent.clone();
        self.call("capture", move |p| p.capture(&call_intent, amount, fee))
            .map(|response| response.captured_amount)
    }

    fn mark_captured(
        &self,
        intent: &IntentRef,
        captured: Money,
    ) -> Result<LedgerEntry, SettlementError> {
        let entry = self.find_entry(intent)?;
        if captured != entry.gross_amount {
            warn!(
                intent = %intent,
                captured = %captured,
                planned = %entry.gross_amount,
                "processor captured a different amount"
            );
        }
        let status = if entry.status.is_captured() {
            None
        } else {
            Some(LedgerStatus::Succeeded)
        };
        self.ledger.update(
            intent,
            LedgerUpdate {
                status,
                gross_amount: Some(captured),
                base_amount: Some(captured - entry.platform_fee),
                metadata: MetadataPatch {
                    pending_operation: Some(None),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    /// The capture did not happen; the entry goes back to its authorized state.
    fn abort_capture(&self, intent: &IntentRef) -> Result<(), SettlementError> {
        let entry = self.find_entry(intent)?;
        self.ledger.update(
            intent,
            LedgerUpdate {
                status: Some(LedgerStatus::Pending),
                gross_amount: Some(Money::ZERO),
                base_amount: Some(Money::ZERO),
                platform_fee: Some(self.config.platform_fee.fee_for(entry.authorized_amount)),
                metadata: MetadataPatch {
                    partial_capture: Some(false),
                    pending_operation: Some(None),
                    ..Default::default()
                },
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn mark_canceled(&self, intent: &IntentRef) -> Result<(), SettlementError> {
        self.ledger.update(
            intent,
            LedgerUpdate {
                status: Some(LedgerStatus::Canceled),
                gross_amount: Some(Money::ZERO),
                base_amount: Some(Money::ZERO),
                metadata: MetadataPatch {
                    partial_capture: Some(false),
                    pending_operation: Some(None),
                    ..Default::default()
                },
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn mark_pending(
        &self,
        intent: &IntentRef,
        operation: PendingOperation,
    ) -> Result<(), SettlementError> {
        self.set_pending(intent, Some(operation))
    }

    fn clear_pending(&self, intent: &IntentRef) -> Result<(), SettlementError> {
        self.set_pending(intent, None)
    }

    fn set_pending(
        &self,
        intent: &IntentRef,
        operation: Option<PendingOperation>,
    ) -> Result<(), SettlementError> {
        self.ledger.update(
            intent,
            LedgerUpdate {
                metadata: MetadataPatch {
                    pending_operation: Some(operation),
                    ..Default::default()
                },
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn sync_refund_status(&self, intent: &IntentRef) -> Result<(), SettlementError> {
        let entry = self.find_entry(intent)?;
        let status = match entry.remaining_balance() {
            Some(remaining) if remaining.is_zero() => LedgerStatus::Refunded,
            _ => LedgerStatus::PartiallyRefunded,
        };
        self.ledger.update(
            intent,
            LedgerUpdate {
                status: Some(status),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// The ledger entry, with settlement fields pulled from the processor
    /// if the capture notification has not been applied yet.
    fn settled_entry(&self, intent: &IntentRef) -> Result<LedgerEntry, SettlementError> {
        let entry = self.find_entry(intent)?;
        if entry.processor_fee.is_some() {
            return Ok(entry);
        }
        match self.retrieve(intent) {
            Ok(state) => {
                if let (Some(fee), Some(net)) = (state.processor_fee, state.net_amount) {
                    let event = ProcessorEvent::capture_succeeded(
                        intent.clone(),
                        state.captured_amount,
                        fee,
                        net,
                    );
                    self.listener.apply(&event)?;
                }
            }
            Err(e) => warn!(intent = %intent, error = %e, "cannot re-query settlement"),
        }
        self.find_entry(intent)
    }

    // --- plumbing ---

    /// Runs `operation` under a claim on the booking, retrying a lost claim
    /// up to `conflict_retries` times.
    fn with_claim<T>(
        &self,
        booking_id: BookingId,
        operation: impl FnOnce(&mut BookingClaim<'_>) -> Result<T, SettlementError>,
    ) -> Result<T, SettlementError> {
        let mut attempts = 0;
        let mut claim = loop {
            let observed = self
                .bookings
                .get(booking_id)
                .ok_or(ValidationError::BookingNotFound(booking_id))?;
            match self.bookings.claim(&observed) {
                Ok(claim) => break claim,
                Err(SettlementError::Conflict { .. })
                    if attempts < self.config.conflict_retries =>
                {
                    attempts += 1;
                    debug!(booking_id = %booking_id, attempts, "booking claim lost, retrying");
                    thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        };
        operation(&mut claim)
    }

    /// Calls the processor on a worker thread, giving up after the
    /// configured timeout.
    fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, ProcessorError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProcessorAdapter) -> Result<T, ProcessorError> + Send + 'static,
    {
        let processor = Arc::clone(&self.processor);
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("processor-{operation}"))
            .spawn(move || {
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(call(processor.as_ref()));
            })
            .map_err(|e| ProcessorError::Network(format!("cannot dispatch {operation}: {e}")))?;

        let timeout_ms = self.config.processor_timeout_ms;
        match rx.recv_timeout(self.config.processor_timeout()) {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(operation, error = %e, "processor call failed");
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(operation, timeout_ms, "processor call timed out");
                Err(ProcessorError::Timeout(timeout_ms))
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!(operation, "processor worker exited without answering");
                Err(ProcessorError::Timeout(timeout_ms))
            }
        }
    }

    fn retrieve(&self, intent: &IntentRef) -> Result<IntentState, SettlementError> {
        let call_intent = intent.clone();
        match self.call("retrieve", move |p| p.retrieve(&call_intent)) {
            Ok(state) => Ok(state),
            Err(e) if e.is_ambiguous() => Err(SettlementError::OutcomeUnknown {
                intent: intent.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Post-operation bookkeeping shared by every booking operation.
    fn finish(
        &self,
        booking_id: BookingId,
        operation: &'static str,
        result: Result<SettlementResult, SettlementError>,
    ) -> Result<SettlementResult, SettlementError> {
        if let Err(e) = self.ensure_snapshot_consistency(booking_id) {
            warn!(booking_id = %booking_id, error = %e, "snapshot repair failed");
        }
        match &result {
            Ok(outcome) => debug!(
                booking_id = %booking_id,
                operation,
                status = %outcome.booking_status,
                payment_status = %outcome.payment_status,
                "settlement operation completed"
            ),
            Err(e) => Self::log_failure(operation, booking_id, e),
        }
        result
    }

    fn log_failure(operation: &'static str, booking_id: BookingId, error: &SettlementError) {
        match error {
            SettlementError::InvariantViolation(message) => {
                error!(
                    booking_id = %booking_id,
                    operation,
                    message = %message,
                    "invariant violated"
                );
            }
            e => warn!(
                booking_id = %booking_id,
                operation,
                error = %e,
                "settlement operation failed"
            ),
        }
    }

    fn ensure_not_awaiting(booking: &Booking) -> Result<(), ValidationError> {
        if booking.awaiting_reconciliation {
            return Err(ValidationError::AwaitingReconciliation(booking.id));
        }
        Ok(())
    }

    fn find_entry(&self, intent: &IntentRef) -> Result<LedgerEntry, SettlementError> {
        self.ledger
            .get(intent)
            .ok_or_else(|| ValidationError::LedgerEntryNotFound(intent.clone()).into())
    }

    fn find_extension(&self, id: ExtensionId) -> Result<Extension, SettlementError> {
        self.extensions
            .get(id)
            .ok_or_else(|| ValidationError::ExtensionNotFound(id).into())
    }

    /// The extension, if it is authorized and its booking is settled.
    fn authorized_extension(
        &self,
        claim: &BookingClaim<'_>,
        id: ExtensionId,
        action: &'static str,
    ) -> Result<Extension, SettlementError> {
        let booking = claim.booking();
        if !booking.payment_status.is_settled() {
            return Err(booking.invalid_transition(action).into());
        }
        let extension = self.find_extension(id)?;
        if extension.status != ExtensionStatus::Pending
            || extension.payment_status != PaymentStatus::Authorized
        {
            return Err(ValidationError::ExtensionNotPending(id).into());
        }
        Ok(extension)
    }

    /// Looks up `ids`, all of which must belong to `booking`.
    fn select_items(
        &self,
        booking: &Booking,
        ids: &[LineItemId],
    ) -> Result<Vec<LineItem>, SettlementError> {
        let mut seen = BTreeSet::new();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let item = self
                .line_items
                .get(*id)
                .ok_or(ValidationError::LineItemNotFound(*id))?;
            if item.booking_id != booking.id {
                return Err(ValidationError::ForeignLineItem {
                    item: *id,
                    booking: booking.id,
                }
                .into());
            }
            if seen.insert(*id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Checks an approval decision and returns the rejected set.
    fn validate_decision(
        &self,
        booking: &Booking,
        approved: &[LineItemId],
        rejected: &[LineItemId],
    ) -> Result<BTreeSet<LineItemId>, SettlementError> {
        let approved: BTreeSet<LineItemId> = self
            .select_items(booking, approved)?
            .into_iter()
            .map(|item| item.id)
            .collect();
        let mut rejected_set = BTreeSet::new();
        for item in self.select_items(booking, rejected)? {
            if approved.contains(&item.id) {
                return Err(ValidationError::ConflictingDecision(item.id).into());
            }
            if !item.is_active() {
                return Err(ValidationError::LineItemNotSettleable(item.id).into());
            }
            rejected_set.insert(item.id);
        }
        Ok(rejected_set)
    }

    fn active_items(&self, booking_id: BookingId) -> Vec<LineItem> {
        self.line_items
            .for_booking(booking_id)
            .into_iter()
            .filter(LineItem::is_active)
            .collect()
    }

    /// Cancels every active line item of an uncaptured booking.
    fn fail_active_items(&self, booking_id: BookingId) -> Result<Vec<LineItemId>, SettlementError> {
        let ids: Vec<LineItemId> = self
            .line_items
            .for_booking(booking_id)
            .into_iter()
            .filter(LineItem::is_active)
            .map(|item| item.id)
            .collect();
        self.line_items.transition(
            &ids,
            &[PaymentStatus::Pending, PaymentStatus::Authorized],
            BookingStatus::Cancelled,
            PaymentStatus::Failed,
        )?;
        Ok(ids)
    }
}

fn mark_rejected(snapshot: &mut [SnapshotEntry], ids: &[LineItemId]) {
    for entry in snapshot.iter_mut().filter(|e| ids.contains(&e.line_item_id)) {
        entry.rejected = true;
    }
}
