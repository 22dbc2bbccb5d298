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

//! Settlement engine lifecycle integration tests.

use booking_settlement::ledger::{CaptureSource, PendingOperation, RefundReason};
use booking_settlement::simulator::{Fault, Operation};
use booking_settlement::{
    ApprovalDecision, BookingDraft, BookingId, BookingStatus, ChargeKind, ExtensionDraft,
    ExtensionId, ExtensionStatus, IntentRef, LedgerStatus, LedgerStore, LineItem, LineItemId,
    LineItemKind, MemoryLedgerStore, Money, PayerRef, PaymentStatus, ProcessorError, ProcessorEvent,
    ReconciliationListener, SettlementConfig, SettlementEngine, SettlementError,
    SimulatedProcessor, TaxRate, ValidationError,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BOOKING: BookingId = BookingId(1);
const STORAGE: LineItemId = LineItemId(10);

/// Engine whose processor notifications reach the ledger before each call returns.
fn setup_with(config: SettlementConfig) -> (SettlementEngine, Arc<SimulatedProcessor>) {
    let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
    let listener = ReconciliationListener::new(Arc::clone(&ledger));
    let processor = Arc::new(SimulatedProcessor::new().with_event_hook(Box::new(
        move |event: &ProcessorEvent| {
            listener.apply(event).unwrap();
        },
    )));
    let engine = SettlementEngine::new(config, ledger, processor.clone());
    (engine, processor)
}

fn setup() -> (SettlementEngine, Arc<SimulatedProcessor>) {
    setup_with(SettlementConfig::default())
}

/// 4h at 25.00 plus a 20.00 storage unit, 15% tax: 138.00 authorized.
fn create_booking(engine: &SettlementEngine) {
    engine
        .create_booking(BookingDraft {
            id: BOOKING,
            hourly_rate: Money::from_cents(2_500),
            duration_hours: 4,
            tax_rate: TaxRate::new(dec!(15)).unwrap(),
            line_items: vec![LineItem::new(
                STORAGE,
                BOOKING,
                LineItemKind::Storage,
                Money::from_cents(2_000),
            )],
        })
        .unwrap();
}

fn authorized(engine: &SettlementEngine) -> IntentRef {
    create_booking(engine);
    engine
        .authorize_booking(BOOKING, &PayerRef::new("cus_1"))
        .unwrap();
    engine.booking(BOOKING).unwrap().payment_intent.unwrap()
}

fn reject_storage() -> ApprovalDecision {
    ApprovalDecision::Approve {
        approved: vec![],
        rejected: vec![STORAGE],
    }
}

// =============================================================================
// Approval
// =============================================================================

#[test]
fn full_approval_captures_authorized_amount() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);

    let result = engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert!(result.refund.is_none());

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.status, LedgerStatus::Succeeded);
    assert_eq!(entry.gross_amount, Money::from_cents(13_800));
    assert_eq!(entry.platform_fee, Money::from_cents(690));
    // 2.9% of 138.00 + 0.30
    assert_eq!(entry.processor_fee, Some(Money::from_cents(430)));
    assert_eq!(entry.manager_revenue, Some(Money::from_cents(12_680)));
    assert_eq!(entry.metadata.capture_source, Some(CaptureSource::Full));
    assert!(!entry.metadata.partial_capture);
    assert_eq!(processor.captured(&intent), Money::from_cents(13_800));

    let items = engine.line_items(BOOKING);
    assert_eq!(items[0].status, BookingStatus::Confirmed);
    assert_eq!(items[0].payment_status, PaymentStatus::Paid);
}

#[test]
fn partial_approval_recomputes_platform_fee() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    assert_eq!(processor.application_fee(&intent), Money::from_cents(690));

    let result = engine.decide_approval(BOOKING, &reject_storage()).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(result.payment_status, PaymentStatus::Paid);

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.authorized_amount, Money::from_cents(13_800));
    assert_eq!(entry.gross_amount, Money::from_cents(11_500));
    assert_eq!(entry.platform_fee, Money::from_cents(575));
    assert_eq!(entry.base_amount, Money::from_cents(10_925));
    assert_eq!(entry.processor_fee, Some(Money::from_cents(364)));
    assert_eq!(entry.manager_revenue, Some(Money::from_cents(10_561)));
    assert!(entry.metadata.partial_capture);
    assert_eq!(entry.metadata.approved_subtotal, Some(Money::from_cents(10_000)));
    assert_eq!(entry.metadata.approved_tax, Some(Money::from_cents(1_500)));

    assert_eq!(processor.captured(&intent), Money::from_cents(11_500));
    assert_eq!(processor.application_fee(&intent), Money::from_cents(575));

    let booking = engine.booking(BOOKING).unwrap();
    assert!(booking.snapshot[0].rejected);
    assert_eq!(booking.snapshot[0].payment_status, PaymentStatus::Failed);
    let items = engine.line_items(BOOKING);
    assert_eq!(items[0].status, BookingStatus::Cancelled);
}

#[test]
fn approving_twice_is_an_invalid_transition() {
    let (engine, processor) = setup();
    authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();

    let second = engine.decide_approval(BOOKING, &ApprovalDecision::approve_all());
    assert_eq!(
        second,
        Err(ValidationError::InvalidTransition {
            action: "approve",
            status: BookingStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
        }
        .into())
    );
    assert_eq!(processor.calls(Operation::Capture), 1);
}

#[test]
fn booking_whose_total_overflows_is_rejected() {
    let (engine, processor) = setup();
    let result = engine.create_booking(BookingDraft {
        id: BOOKING,
        hourly_rate: Money::from_cents(2_500),
        duration_hours: 4,
        tax_rate: TaxRate::ZERO,
        line_items: vec![LineItem::new(
            STORAGE,
            BOOKING,
            LineItemKind::Storage,
            Money::from_cents(i64::MAX),
        )],
    });
    assert!(matches!(
        result,
        Err(SettlementError::Validation(ValidationError::AmountOverflow))
    ));
    assert!(engine.booking(BOOKING).is_none());
    assert_eq!(processor.calls(Operation::Authorize), 0);
}

#[test]
fn rejecting_unknown_or_foreign_items_fails_validation() {
    let (engine, processor) = setup();
    authorized(&engine);
    engine
        .create_booking(BookingDraft {
            id: BookingId(2),
            hourly_rate: Money::from_cents(1_000),
            duration_hours: 1,
            tax_rate: TaxRate::ZERO,
            line_items: vec![LineItem::new(
                LineItemId(20),
                BookingId(2),
                LineItemKind::Equipment,
                Money::from_cents(500),
            )],
        })
        .unwrap();

    let foreign = ApprovalDecision::Approve {
        approved: vec![],
        rejected: vec![LineItemId(20)],
    };
    assert_eq!(
        engine.decide_approval(BOOKING, &foreign),
        Err(ValidationError::ForeignLineItem {
            item: LineItemId(20),
            booking: BOOKING,
        }
        .into())
    );

    let unknown = ApprovalDecision::Approve {
        approved: vec![LineItemId(99)],
        rejected: vec![],
    };
    assert_eq!(
        engine.decide_approval(BOOKING, &unknown),
        Err(ValidationError::LineItemNotFound(LineItemId(99)).into())
    );
    assert_eq!(processor.calls(Operation::Capture), 0);
}

#[test]
fn reject_before_capture_releases_hold() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);

    let result = engine
        .decide_approval(BOOKING, &ApprovalDecision::Reject)
        .unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Failed);

    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Canceled);
    assert_eq!(processor.calls(Operation::CancelAuthorization), 1);
    assert_eq!(processor.calls(Operation::Capture), 0);
    assert!(engine.booking(BOOKING).unwrap().snapshot[0].rejected);
}

#[test]
fn cancelling_an_unpaid_booking_needs_no_processor() {
    let (engine, processor) = setup();
    create_booking(&engine);

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Failed);
    assert_eq!(processor.calls(Operation::CancelAuthorization), 0);
}

#[test]
fn declined_authorization_fails_the_payment() {
    let (engine, processor) = setup();
    create_booking(&engine);
    processor.inject(
        Operation::Authorize,
        Fault::Fail(ProcessorError::Declined("card declined".into())),
    );

    let result = engine.authorize_booking(BOOKING, &PayerRef::new("cus_1"));
    assert!(matches!(
        result,
        Err(SettlementError::Processor(ProcessorError::Declined(_)))
    ));
    let booking = engine.booking(BOOKING).unwrap();
    assert_eq!(booking.payment_status, PaymentStatus::Failed);
    assert!(booking.payment_intent.is_none());

    let result = engine.decide_cancellation(BOOKING, false).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
}

#[test]
fn expired_authorization_cannot_be_captured() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    processor.expire(&intent);

    let result = engine.decide_approval(BOOKING, &ApprovalDecision::approve_all());
    assert_eq!(
        result,
        Err(SettlementError::Processor(ProcessorError::AuthorizationExpired))
    );
    let booking = engine.booking(BOOKING).unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.payment_status, PaymentStatus::Failed);
    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Canceled);
}

#[test]
fn network_failure_on_capture_is_retryable() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    processor.inject(
        Operation::Capture,
        Fault::Fail(ProcessorError::Network("connection reset".into())),
    );

    let err = engine
        .decide_approval(BOOKING, &reject_storage())
        .unwrap_err();
    assert!(err.to_string().starts_with("payment could not be settled, please retry"));
    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.status, LedgerStatus::Pending);
    assert_eq!(entry.platform_fee, Money::from_cents(690));
    assert!(!entry.metadata.partial_capture);

    let result = engine.decide_approval(BOOKING, &reject_storage()).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(processor.captured(&intent), Money::from_cents(11_500));
}

// =============================================================================
// Cancellation and refunds
// =============================================================================

#[test]
fn cancel_after_partial_capture_refunds_manager_balance() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    engine.decide_approval(BOOKING, &reject_storage()).unwrap();

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Refunded);
    assert!(!result.requires_manual_refund);

    // 115.00 gross less 3.64 processor fee is 111.36, capped at 105.61.
    let receipt = result.refund.unwrap();
    assert_eq!(receipt.amount, Money::from_cents(10_561));
    assert_eq!(processor.refunded(&intent), Money::from_cents(10_561));
    assert_eq!(processor.reversed(&intent), Money::from_cents(10_561));

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.refunded, Money::from_cents(10_561));
    assert_eq!(entry.manager_revenue, Some(entry.refunded));
    assert_eq!(entry.status, LedgerStatus::Refunded);
    assert_eq!(entry.refunds.len(), 1);
    assert_eq!(entry.refunds[0].reversal.as_ref(), Some(&receipt.reversal));
}

#[test]
fn item_rejection_then_cancellation_never_exceeds_revenue() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();

    let result = engine.cancel_line_items(BOOKING, &[STORAGE], true).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(result.payment_status, PaymentStatus::PartiallyRefunded);
    // 23.00 less 4.30 * 23 / 138 = 0.72
    assert_eq!(result.refund.unwrap().amount, Money::from_cents(2_228));
    assert_eq!(
        engine.ledger_entry(&intent).unwrap().status,
        LedgerStatus::PartiallyRefunded
    );

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.payment_status, PaymentStatus::Refunded);
    assert_eq!(result.refund.unwrap().amount, Money::from_cents(10_452));

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.refunded, Money::from_cents(12_680));
    assert_eq!(entry.remaining_balance(), Some(Money::ZERO));
    assert_eq!(processor.refunded(&intent), processor.reversed(&intent));
}

#[test]
fn cancel_without_refund_flags_manual_refund() {
    let (engine, processor) = setup();
    authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();

    let result = engine.decide_cancellation(BOOKING, false).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert!(result.requires_manual_refund);
    assert_eq!(processor.calls(Operation::Refund), 0);
}

#[test]
fn cancel_line_items_without_refund_keeps_booking_confirmed() {
    let (engine, _) = setup();
    authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();

    let result = engine.cancel_line_items(BOOKING, &[STORAGE], false).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert!(result.requires_manual_refund);
    assert_eq!(engine.line_items(BOOKING)[0].status, BookingStatus::Cancelled);
    assert!(engine.booking(BOOKING).unwrap().snapshot[0].rejected);

    assert_eq!(
        engine.cancel_line_items(BOOKING, &[], true),
        Err(ValidationError::EmptySelection.into())
    );
    assert_eq!(
        engine.cancel_line_items(BOOKING, &[STORAGE], true),
        Err(ValidationError::LineItemNotSettleable(STORAGE).into())
    );
}

#[test]
fn requested_cancellation_is_decided_later() {
    let (engine, _) = setup();
    authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();

    let result = engine.request_cancellation(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::CancellationRequested);
    assert_eq!(result.payment_status, PaymentStatus::Paid);

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Refunded);
}

#[test]
fn failed_refund_still_cancels_and_flags_manual_refund() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    engine.decide_approval(BOOKING, &reject_storage()).unwrap();
    processor.inject(
        Operation::Refund,
        Fault::Fail(ProcessorError::Network("connection reset".into())),
    );

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert!(result.requires_manual_refund);
    assert!(result.refund.is_none());
    assert_eq!(engine.ledger_entry(&intent).unwrap().refunded, Money::ZERO);
}

#[test]
fn refund_waits_for_settlement_by_requerying_processor() {
    // No listener: the capture notification never reaches the ledger.
    let processor = Arc::new(SimulatedProcessor::new());
    let engine = SettlementEngine::new(
        SettlementConfig::default(),
        Arc::new(MemoryLedgerStore::new()),
        processor.clone(),
    );
    let intent = authorized(&engine);
    engine.decide_approval(BOOKING, &reject_storage()).unwrap();
    assert_eq!(engine.ledger_entry(&intent).unwrap().processor_fee, None);

    let result = engine.decide_cancellation(BOOKING, true).unwrap();
    assert_eq!(result.refund.unwrap().amount, Money::from_cents(10_561));
    assert_eq!(processor.calls(Operation::Retrieve), 1);
    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.gross_amount, Money::from_cents(11_500));
    assert_eq!(entry.manager_revenue, Some(Money::from_cents(10_561)));
}

// =============================================================================
// Ambiguous outcomes
// =============================================================================

#[test]
fn capture_applied_then_timed_out_is_resolved_by_requery() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    processor.inject(Operation::Capture, Fault::ApplyThenTimeout);

    let result = engine.decide_approval(BOOKING, &reject_storage());
    assert_eq!(
        result,
        Err(SettlementError::OutcomeUnknown {
            intent: intent.clone()
        })
    );
    let booking = engine.booking(BOOKING).unwrap();
    assert!(booking.awaiting_reconciliation);
    assert_eq!(booking.payment_status, PaymentStatus::Authorized);
    assert_eq!(
        engine.ledger_entry(&intent).unwrap().metadata.pending_operation,
        Some(PendingOperation::Capture {
            rejected: vec![STORAGE]
        })
    );
    assert_eq!(
        engine.decide_cancellation(BOOKING, true),
        Err(ValidationError::AwaitingReconciliation(BOOKING).into())
    );

    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert_eq!(processor.calls(Operation::Capture), 1);

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.gross_amount, Money::from_cents(11_500));
    assert_eq!(entry.manager_revenue, Some(Money::from_cents(10_561)));
    assert!(entry.metadata.pending_operation.is_none());
    assert!(!engine.booking(BOOKING).unwrap().awaiting_reconciliation);
    assert_eq!(engine.line_items(BOOKING)[0].status, BookingStatus::Cancelled);
}

#[test]
fn capture_that_never_applied_can_be_retried_after_resolution() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    processor.inject(Operation::Capture, Fault::Fail(ProcessorError::Timeout(5)));

    assert!(matches!(
        engine.decide_approval(BOOKING, &ApprovalDecision::approve_all()),
        Err(SettlementError::OutcomeUnknown { .. })
    ));
    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Processing);

    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Pending);
    assert_eq!(result.payment_status, PaymentStatus::Authorized);
    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Pending);

    let result = engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
}

#[test]
fn slow_processor_call_times_out() {
    let config = SettlementConfig {
        processor_timeout_ms: 50,
        ..SettlementConfig::default()
    };
    let (engine, processor) = setup_with(config);
    let intent = authorized(&engine);

    processor.set_latency(Duration::from_millis(300));
    assert_eq!(
        engine.decide_approval(BOOKING, &ApprovalDecision::approve_all()),
        Err(SettlementError::OutcomeUnknown {
            intent: intent.clone()
        })
    );

    // The late capture still lands at the processor.
    thread::sleep(Duration::from_millis(600));
    processor.set_latency(Duration::ZERO);
    assert_eq!(processor.captured(&intent), Money::from_cents(13_800));

    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Confirmed);
    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Succeeded);
}

#[test]
fn ambiguous_release_is_resolved() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    processor.inject(Operation::CancelAuthorization, Fault::ApplyThenTimeout);

    assert!(matches!(
        engine.decide_approval(BOOKING, &ApprovalDecision::Reject),
        Err(SettlementError::OutcomeUnknown { .. })
    ));
    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Failed);
    assert_eq!(engine.ledger_entry(&intent).unwrap().status, LedgerStatus::Canceled);
}

#[test]
fn refund_applied_then_timed_out_is_confirmed_by_requery() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();
    processor.inject(Operation::Refund, Fault::ApplyThenTimeout);

    assert_eq!(
        engine.decide_cancellation(BOOKING, true),
        Err(SettlementError::OutcomeUnknown {
            intent: intent.clone()
        })
    );
    let booking = engine.booking(BOOKING).unwrap();
    assert!(booking.awaiting_reconciliation);
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert!(!booking.requires_manual_refund);
    assert!(matches!(
        engine.ledger_entry(&intent).unwrap().metadata.pending_operation,
        Some(PendingOperation::Refund {
            whole_booking: true,
            ..
        })
    ));
    assert_eq!(
        engine.decide_cancellation(BOOKING, true),
        Err(ValidationError::AwaitingReconciliation(BOOKING).into())
    );

    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Refunded);
    assert!(!result.requires_manual_refund);
    assert_eq!(result.refund.unwrap().amount, Money::from_cents(12_680));
    assert_eq!(processor.calls(Operation::Refund), 1);

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.refunded, Money::from_cents(12_680));
    assert_eq!(entry.refunded, processor.refunded(&intent));
    assert_eq!(entry.status, LedgerStatus::Refunded);
    assert_eq!(entry.refunds.len(), 1);
    assert_eq!(entry.refunds[0].reason, RefundReason::BookingCancelled);
    assert!(entry.metadata.pending_operation.is_none());
    assert!(!engine.booking(BOOKING).unwrap().awaiting_reconciliation);
    assert_eq!(engine.line_items(BOOKING)[0].payment_status, PaymentStatus::Refunded);
}

#[test]
fn refund_that_never_applied_is_flagged_for_manual_refund() {
    let (engine, processor) = setup();
    let intent = authorized(&engine);
    engine.decide_approval(BOOKING, &reject_storage()).unwrap();
    processor.inject(Operation::Refund, Fault::Fail(ProcessorError::Timeout(5)));

    assert!(matches!(
        engine.decide_cancellation(BOOKING, true),
        Err(SettlementError::OutcomeUnknown { .. })
    ));
    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Cancelled);
    assert_eq!(result.payment_status, PaymentStatus::Paid);
    assert!(result.requires_manual_refund);
    assert!(result.refund.is_none());

    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.refunded, Money::ZERO);
    assert!(entry.metadata.pending_operation.is_none());
    assert_eq!(processor.refunded(&intent), Money::ZERO);
    assert!(!engine.booking(BOOKING).unwrap().awaiting_reconciliation);
}

#[test]
fn authorization_timeout_blocks_a_second_hold() {
    let (engine, processor) = setup();
    create_booking(&engine);
    let payer = PayerRef::new("cus_1");
    processor.inject(Operation::Authorize, Fault::ApplyThenTimeout);

    assert!(matches!(
        engine.authorize_booking(BOOKING, &payer),
        Err(SettlementError::Processor(ProcessorError::Timeout(_)))
    ));
    let booking = engine.booking(BOOKING).unwrap();
    assert!(booking.awaiting_reconciliation);
    assert_eq!(booking.payment_status, PaymentStatus::Pending);
    assert_eq!(
        engine.authorize_booking(BOOKING, &payer),
        Err(ValidationError::AwaitingReconciliation(BOOKING).into())
    );
    assert_eq!(processor.calls(Operation::Authorize), 1);

    // Resolution adopts the hold the timed-out call placed.
    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.booking_status, BookingStatus::Pending);
    assert_eq!(result.payment_status, PaymentStatus::Authorized);
    let booking = engine.booking(BOOKING).unwrap();
    assert!(!booking.awaiting_reconciliation);
    let intent = booking.payment_intent.unwrap();
    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.authorized_amount, Money::from_cents(13_800));
    assert_eq!(entry.platform_fee, Money::from_cents(690));
    assert_eq!(engine.line_items(BOOKING)[0].payment_status, PaymentStatus::Authorized);

    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();
    assert_eq!(processor.captured(&intent), Money::from_cents(13_800));
    assert_eq!(processor.calls(Operation::Authorize), 1);
}

#[test]
fn authorization_that_never_applied_can_be_retried_after_resolution() {
    let (engine, processor) = setup();
    create_booking(&engine);
    let payer = PayerRef::new("cus_1");
    processor.inject(Operation::Authorize, Fault::Fail(ProcessorError::Timeout(5)));

    assert!(engine.authorize_booking(BOOKING, &payer).is_err());
    assert!(engine.booking(BOOKING).unwrap().awaiting_reconciliation);

    let result = engine.resolve_pending(BOOKING).unwrap();
    assert_eq!(result.payment_status, PaymentStatus::Pending);
    let booking = engine.booking(BOOKING).unwrap();
    assert!(!booking.awaiting_reconciliation);
    assert!(booking.payment_intent.is_none());
    assert!(engine.ledger_entries(BOOKING).is_empty());

    let result = engine.authorize_booking(BOOKING, &payer).unwrap();
    assert_eq!(result.payment_status, PaymentStatus::Authorized);
    assert_eq!(processor.calls(Operation::Authorize), 2);
    assert_eq!(processor.calls(Operation::FindAuthorization), 1);
}

#[test]
fn resolve_without_pending_operation_is_rejected() {
    let (engine, _) = setup();
    authorized(&engine);
    assert!(matches!(
        engine.resolve_pending(BOOKING),
        Err(SettlementError::Validation(ValidationError::InvalidTransition { .. }))
    ));
}

// =============================================================================
// Extensions and penalties
// =============================================================================

fn confirmed_with_extension(engine: &SettlementEngine, kind: ChargeKind) -> ExtensionId {
    let id = ExtensionId(1);
    authorized(engine);
    engine
        .decide_approval(BOOKING, &ApprovalDecision::approve_all())
        .unwrap();
    engine
        .create_extension(ExtensionDraft {
            id,
            booking_id: BOOKING,
            kind,
            subtotal: Money::from_cents(5_000),
            tax_rate: TaxRate::new(dec!(15)).unwrap(),
        })
        .unwrap();
    engine
        .authorize_extension(id, &PayerRef::new("cus_1"))
        .unwrap();
    id
}

#[test]
fn extension_settles_on_its_own_intent() {
    let (engine, processor) = setup();
    let id = confirmed_with_extension(&engine, ChargeKind::Extension);
    let booking_intent = engine.booking(BOOKING).unwrap().payment_intent.unwrap();

    let extension = engine.approve_extension(id).unwrap();
    assert_eq!(extension.status, ExtensionStatus::Approved);
    assert_eq!(extension.payment_status, PaymentStatus::Paid);

    let intent = extension.payment_intent.unwrap();
    assert_ne!(intent, booking_intent);
    let entry = engine.ledger_entry(&intent).unwrap();
    assert_eq!(entry.metadata.kind, ChargeKind::Extension);
    assert_eq!(entry.gross_amount, Money::from_cents(5_750));
    assert_eq!(entry.platform_fee, Money::from_cents(288));
    assert_eq!(entry.status, LedgerStatus::Succeeded);
    assert_eq!(processor.captured(&intent), Money::from_cents(5_750));

    // The booking's own entry is untouched.
    let booking_entry = engine.ledger_entry(&booking_intent).unwrap();
    assert_eq!(booking_entry.gross_amount, Money::from_cents(13_800));
    assert_eq!(engine.ledger_entries(BOOKING).len(), 2);
}

#[test]
fn declined_penalty_releases_its_hold() {
    let (engine, processor) = setup();
    let id = confirmed_with_extension(&engine, ChargeKind::Penalty);

    let extension = engine.decline_extension(id).unwrap();
    assert_eq!(extension.status, ExtensionStatus::Declined);
    assert_eq!(extension.payment_status, PaymentStatus::Failed);
    let entry = engine
        .ledger_entry(extension.payment_intent.as_ref().unwrap())
        .unwrap();
    assert_eq!(entry.status, LedgerStatus::Canceled);
    assert_eq!(entry.metadata.kind, ChargeKind::Penalty);
    assert_eq!(processor.calls(Operation::CancelAuthorization), 1);

    assert_eq!(
        engine.approve_extension(id),
        Err(ValidationError::ExtensionNotPending(id).into())
    );
}

#[test]
fn ambiguous_extension_capture_is_resolved() {
    let (engine, processor) = setup();
    let id = confirmed_with_extension(&engine, ChargeKind::Extension);
    processor.inject(Operation::Capture, Fault::ApplyThenTimeout);

    assert!(matches!(
        engine.approve_extension(id),
        Err(SettlementError::OutcomeUnknown { .. })
    ));
    let extension = engine.resolve_extension(id).unwrap();
    assert_eq!(extension.status, ExtensionStatus::Approved);
    assert_eq!(extension.payment_status, PaymentStatus::Paid);
}

#[test]
fn extension_requires_confirmed_booking() {
    let (engine, _) = setup();
    authorized(&engine);
    engine
        .create_extension(ExtensionDraft {
            id: ExtensionId(1),
            booking_id: BOOKING,
            kind: ChargeKind::Extension,
            subtotal: Money::from_cents(1_000),
            tax_rate: TaxRate::ZERO,
        })
        .unwrap();
    assert!(matches!(
        engine.authorize_extension(ExtensionId(1), &PayerRef::new("cus_1")),
        Err(SettlementError::Validation(ValidationError::InvalidTransition { .. }))
    ));
}
