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

//! In-memory payment processor.
//!
//! Behaves like a hold-then-capture processor with connected payee
//! accounts: partial captures release the rest of the hold, refunds are
//! funded by reversals, and every successful capture or refund emits a
//! [`ProcessorEvent`]. Events are emitted *before* the call returns, and can
//! be delivered twice, so callers see the same races as with a real
//! processor. Faults and latency can be injected per operation.

use crate::base::{BookingId, IntentRef, RefundRef, ReversalRef};
use crate::error::ProcessorError;
use crate::ledger::ChargeKind;
use crate::money::{FeeSchedule, Money};
use crate::processor::{
    AuthorizeRequest, CaptureResponse, IntentState, IntentStatus, ProcessorAdapter,
    ProcessorEvent, RefundResponse, RefundState,
};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Authorize,
    Capture,
    CancelAuthorization,
    Refund,
    Retrieve,
    FindAuthorization,
}

/// Injected misbehaviour for the next call of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail without applying anything.
    Fail(ProcessorError),
    /// Apply the call, then report a timeout.
    ApplyThenTimeout,
}

pub type EventHook = Box<dyn Fn(&ProcessorEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct SimIntent {
    booking_id: BookingId,
    kind: ChargeKind,
    /// Creation order.
    seq: u64,
    authorized: Money,
    application_fee: Money,
    captured: Money,
    status: IntentStatus,
    expired: bool,
    processor_fee: Option<Money>,
    refunded: Money,
    reversed: Money,
    refunds: Vec<RefundState>,
}

impl SimIntent {
    fn state(&self, intent: &IntentRef) -> IntentState {
        IntentState {
            intent: intent.clone(),
            status: self.status,
            authorized_amount: self.authorized,
            captured_amount: self.captured,
            processor_fee: self.processor_fee,
            net_amount: self
                .processor_fee
                .map(|fee| self.captured - self.application_fee - fee),
            refunds: self.refunds.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    intents: HashMap<IntentRef, SimIntent>,
    next_seq: u64,
    faults: HashMap<Operation, VecDeque<Fault>>,
    calls: HashMap<Operation, usize>,
    latency: Duration,
}

pub struct SimulatedProcessor {
    fees: FeeSchedule,
    state: Mutex<SimState>,
    events: Option<Sender<ProcessorEvent>>,
    hook: Option<EventHook>,
    duplicate_delivery: bool,
}

impl SimulatedProcessor {
    /// A processor charging 2.9% + 30 cents per capture.
    pub fn new() -> Self {
        Self {
            fees: FeeSchedule::new(dec!(2.9), Money::from_cents(30)),
            state: Mutex::new(SimState::default()),
            events: None,
            hook: None,
            duplicate_delivery: false,
        }
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    /// Delivers events on a channel.
    pub fn with_event_sender(mut self, sender: Sender<ProcessorEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Delivers events synchronously, inside the call that caused them.
    pub fn with_event_hook(mut self, hook: EventHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Delivers every event twice.
    pub fn with_duplicate_delivery(mut self, duplicate: bool) -> Self {
        self.duplicate_delivery = duplicate;
        self
    }

    pub fn inject(&self, operation: Operation, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Lets the hold lapse, as the processor does after its time box.
    pub fn expire(&self, intent: &IntentRef) {
        if let Some(sim) = self.state.lock().intents.get_mut(intent) {
            sim.status = IntentStatus::Canceled;
            sim.expired = true;
        }
    }

    pub fn calls(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn captured(&self, intent: &IntentRef) -> Money {
        self.with_intent(intent, |sim| sim.captured)
    }

    /// Total credited to the payer.
    pub fn refunded(&self, intent: &IntentRef) -> Money {
        self.with_intent(intent, |sim| sim.refunded)
    }

    /// Total debited from the manager's balance.
    pub fn reversed(&self, intent: &IntentRef) -> Money {
        self.with_intent(intent, |sim| sim.reversed)
    }

    /// Platform fee currently attached to the intent.
    pub fn application_fee(&self, intent: &IntentRef) -> Money {
        self.with_intent(intent, |sim| sim.application_fee)
    }

    fn with_intent(&self, intent: &IntentRef, read: impl FnOnce(&SimIntent) -> Money) -> Money {
        self.state
            .lock()
            .intents
            .get(intent)
            .map(read)
            .unwrap_or(Money::ZERO)
    }

    /// Counts the call, sleeps for the configured latency and pops a fault.
    fn begin(&self, operation: Operation) -> Option<Fault> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(operation).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        self.state
            .lock()
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
    }

    fn emit(&self, event: ProcessorEvent) {
        let deliveries = if self.duplicate_delivery { 2 } else { 1 };
        for _ in 0..deliveries {
            debug!(intent = %event.intent_ref, kind = ?event.kind, "emitting processor event");
            if let Some(hook) = &self.hook {
                hook(&event);
            }
            if let Some(sender) = &self.events {
                // A closed channel means nobody listens any more.
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Resolves a fault into an early error, or whether to time out after applying.
    fn check_fault(fault: Option<Fault>) -> Result<bool, ProcessorError> {
        match fault {
            Some(Fault::Fail(error)) => Err(error),
            Some(Fault::ApplyThenTimeout) => Ok(true),
            None => Ok(false),
        }
    }

    fn finish<T>(timeout_after: bool, value: T) -> Result<T, ProcessorError> {
        if timeout_after {
            Err(ProcessorError::Timeout(0))
        } else {
            Ok(value)
        }
    }
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorAdapter for SimulatedProcessor {
    fn authorize(&self, request: AuthorizeRequest) -> Result<IntentRef, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::Authorize))?;
        if !request.amount.is_positive() {
            return Err(ProcessorError::Declined("amount must be positive".into()));
        }
        let intent = IntentRef::new(format!("pi_{}", Uuid::new_v4().simple()));
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.intents.insert(
            intent.clone(),
            SimIntent {
                booking_id: request.booking_id,
                kind: request.kind,
                seq,
                authorized: request.amount,
                application_fee: request.application_fee,
                captured: Money::ZERO,
                status: IntentStatus::RequiresCapture,
                expired: false,
                processor_fee: None,
                refunded: Money::ZERO,
                reversed: Money::ZERO,
                refunds: Vec::new(),
            },
        );
        drop(state);
        Self::finish(timeout_after, intent)
    }

    fn capture(
        &self,
        intent: &IntentRef,
        amount: Option<Money>,
        application_fee: Option<Money>,
    ) -> Result<CaptureResponse, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::Capture))?;
        let event = {
            let mut state = self.state.lock();
            let sim = state
                .intents
                .get_mut(intent)
                .ok_or_else(|| ProcessorError::UnknownIntent(intent.clone()))?;
            if sim.expired {
                return Err(ProcessorError::AuthorizationExpired);
            }
            if sim.status != IntentStatus::RequiresCapture {
                return Err(ProcessorError::Declined(format!(
                    "intent is {:?}, not capturable",
                    sim.status
                )));
            }
            let amount = amount.unwrap_or(sim.authorized);
            if amount.is_negative() || amount > sim.authorized {
                return Err(ProcessorError::Declined(
                    "capture exceeds authorized amount".into(),
                ));
            }
            if let Some(fee) = application_fee {
                sim.application_fee = fee;
            }
            let processor_fee = self.fees.fee_for(amount);
            sim.captured = amount;
            sim.processor_fee = Some(processor_fee);
            sim.status = IntentStatus::Succeeded;
            ProcessorEvent::capture_succeeded(
                intent.clone(),
                amount,
                processor_fee,
                amount - sim.application_fee - processor_fee,
            )
        };

        let captured_amount = event.amount;
        self.emit(event);
        Self::finish(
            timeout_after,
            CaptureResponse {
                captured_amount,
                status: IntentStatus::Succeeded,
            },
        )
    }

    fn cancel_authorization(&self, intent: &IntentRef) -> Result<IntentStatus, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::CancelAuthorization))?;
        {
            let mut state = self.state.lock();
            let sim = state
                .intents
                .get_mut(intent)
                .ok_or_else(|| ProcessorError::UnknownIntent(intent.clone()))?;
            match sim.status {
                IntentStatus::RequiresCapture | IntentStatus::Canceled => {
                    sim.status = IntentStatus::Canceled;
                }
                status => {
                    return Err(ProcessorError::Declined(format!(
                        "cannot cancel intent in status {status:?}"
                    )));
                }
            }
        }
        Self::finish(timeout_after, IntentStatus::Canceled)
    }

    fn refund_with_reversal(
        &self,
        intent: &IntentRef,
        amount: Money,
        reason: &str,
        reversal_amount: Money,
    ) -> Result<RefundResponse, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::Refund))?;
        let response = {
            let mut state = self.state.lock();
            let sim = state
                .intents
                .get_mut(intent)
                .ok_or_else(|| ProcessorError::UnknownIntent(intent.clone()))?;
            if sim.status != IntentStatus::Succeeded {
                return Err(ProcessorError::Declined("nothing captured to refund".into()));
            }
            if !amount.is_positive() || sim.refunded + amount > sim.captured {
                return Err(ProcessorError::Declined(format!(
                    "refund of {amount} not possible ({reason})"
                )));
            }
            let response = RefundResponse {
                refund: RefundRef::new(format!("re_{}", Uuid::new_v4().simple())),
                reversal: ReversalRef::new(format!("trr_{}", Uuid::new_v4().simple())),
            };
            sim.refunded += amount;
            sim.reversed += reversal_amount;
            sim.refunds.push(RefundState {
                refund: response.refund.clone(),
                reversal: Some(response.reversal.clone()),
                amount,
            });
            response
        };

        self.emit(ProcessorEvent::refund_succeeded(
            intent.clone(),
            response.refund.clone(),
            amount,
        ));
        Self::finish(timeout_after, response)
    }

    fn retrieve(&self, intent: &IntentRef) -> Result<IntentState, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::Retrieve))?;
        let state = {
            let state = self.state.lock();
            state
                .intents
                .get(intent)
                .ok_or_else(|| ProcessorError::UnknownIntent(intent.clone()))?
                .state(intent)
        };
        Self::finish(timeout_after, state)
    }

    fn find_authorization(
        &self,
        booking_id: BookingId,
        kind: ChargeKind,
    ) -> Result<Option<IntentState>, ProcessorError> {
        let timeout_after = Self::check_fault(self.begin(Operation::FindAuthorization))?;
        let found = {
            let state = self.state.lock();
            state
                .intents
                .iter()
                .filter(|(_, sim)| sim.booking_id == booking_id && sim.kind == kind)
                .max_by_key(|(_, sim)| sim.seq)
                .map(|(intent, sim)| sim.state(intent))
        };
        Self::finish(timeout_after, found)
    }
}
