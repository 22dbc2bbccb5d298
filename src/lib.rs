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

//! # Booking Settlement
//!
//! Settles multi-line-item bookings against a hold-then-capture payment
//! processor: approval with partial rejection, cancellation with unified
//! refunds, extension and penalty charges, and reconciliation of the
//! processor's asynchronous notifications.
//!
//! ## Core Components
//!
//! - [`SettlementEngine`]: applies booking decisions and moves money
//! - [`LedgerStore`]: authoritative totals per payment intent
//! - [`ProcessorAdapter`]: the external processor; [`SimulatedProcessor`] in memory
//! - [`ReconciliationListener`]: applies processor notifications to the ledger
//! - [`SettlementError`]: everything an operation can fail with
//!
//! ## Example
//!
//! ```
//! use booking_settlement::{
//!     ApprovalDecision, BookingDraft, BookingId, BookingStatus, LineItem, LineItemId,
//!     LineItemKind, MemoryLedgerStore, Money, PayerRef, PaymentStatus, SettlementConfig,
//!     SettlementEngine, SimulatedProcessor, TaxRate,
//! };
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! let engine = SettlementEngine::new(
//!     SettlementConfig::default(),
//!     Arc::new(MemoryLedgerStore::new()),
//!     Arc::new(SimulatedProcessor::new()),
//! );
//! let id = BookingId(1);
//! engine
//!     .create_booking(BookingDraft {
//!         id,
//!         hourly_rate: Money::from_cents(2_500),
//!         duration_hours: 4,
//!         tax_rate: TaxRate::new(dec!(15)).unwrap(),
//!         line_items: vec![LineItem::new(
//!             LineItemId(1),
//!             id,
//!             LineItemKind::Storage,
//!             Money::from_cents(2_000),
//!         )],
//!     })
//!     .unwrap();
//! engine.authorize_booking(id, &PayerRef::new("cus_1")).unwrap();
//!
//! // Approve the booking, reject the storage add-on.
//! let decision = ApprovalDecision::Approve {
//!     approved: vec![],
//!     rejected: vec![LineItemId(1)],
//! };
//! let result = engine.decide_approval(id, &decision).unwrap();
//! assert_eq!(result.booking_status, BookingStatus::Confirmed);
//! assert_eq!(result.payment_status, PaymentStatus::Paid);
//! ```
//!
//! ## Thread Safety
//!
//! The engine is `Sync`. Operations on different bookings run in parallel;
//! concurrent operations on one booking are serialized by an optimistic
//! per-booking claim, the loser getting [`SettlementError::Conflict`].

mod base;
mod booking;
pub mod config;
mod engine;
pub mod error;
mod extension;
pub mod ledger;
mod line_item;
mod money;
pub mod processor;
pub mod reconciliation;
pub mod settlement;
pub mod simulator;

pub use base::{BookingId, ExtensionId, IntentRef, LineItemId, PayerRef, RefundRef, ReversalRef};
pub use booking::{Booking, BookingDraft, BookingStatus, PaymentStatus, SnapshotEntry};
pub use config::SettlementConfig;
pub use engine::{ApprovalDecision, RefundReceipt, SettlementEngine, SettlementResult};
pub use error::{ConfigError, ProcessorError, SettlementError, ValidationError};
pub use extension::{Extension, ExtensionDraft, ExtensionStatus};
pub use ledger::{ChargeKind, LedgerEntry, LedgerStatus, LedgerStore, MemoryLedgerStore};
pub use line_item::{LineItem, LineItemKind};
pub use money::{FeeSchedule, Money, TaxRate};
pub use processor::{ProcessorAdapter, ProcessorEvent};
pub use reconciliation::{ReconcileOutcome, ReconciliationListener};
pub use simulator::SimulatedProcessor;
