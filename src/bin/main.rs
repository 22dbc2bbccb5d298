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

use booking_settlement::{
    ApprovalDecision, BookingDraft, BookingId, ChargeKind, ExtensionDraft, ExtensionId,
    LedgerStore, LineItem, LineItemId, LineItemKind, MemoryLedgerStore, Money, PayerRef,
    ProcessorEvent, ReconciliationListener, SettlementConfig, SettlementEngine, SettlementError,
    SimulatedProcessor, TaxRate, ValidationError,
};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Booking Settlement - Replay booking payment scenarios
///
/// Reads booking actions from a CSV file, settles them against an in-memory
/// payment processor and writes the final booking states to stdout.
#[derive(Parser, Debug)]
#[command(name = "booking-settlement")]
#[command(about = "Settles booking payment scenarios from CSV", long_about = None)]
struct Args {
    /// Settlement configuration (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to CSV file with booking actions
    ///
    /// Expected format: action,booking,target,amount,tax,refund
    /// Example: cargo run -- scenario.csv > bookings.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match SettlementConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => SettlementConfig::default(),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %args.input.display(), error = %e, "cannot open scenario");
            process::exit(1);
        }
    };

    let engine = match process_scenario(BufReader::new(file), config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "cannot read scenario");
            process::exit(1);
        }
    };

    if let Err(e) = write_bookings(&engine, std::io::stdout()) {
        error!(error = %e, "cannot write output");
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `action, booking, target, amount, tax, refund`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    action: String,
    booking: u64,
    #[serde(default)]
    target: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    tax: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    refund: Option<bool>,
}

/// One scenario step.
#[derive(Debug)]
enum Action {
    Booking { hours: u32, hourly_rate: Money, tax_rate: TaxRate },
    LineItem { id: LineItemId, kind: LineItemKind, price: Money },
    Authorize { payer: PayerRef },
    Approve { rejected: Vec<LineItemId> },
    Reject,
    RequestCancel,
    Cancel { refund: bool },
    CancelItems { items: Vec<LineItemId>, refund: bool },
    Extension { id: ExtensionId, kind: ChargeKind, subtotal: Money, tax_rate: TaxRate },
    AuthorizeExtension { id: ExtensionId, payer: PayerRef },
    ApproveExtension(ExtensionId),
    DeclineExtension(ExtensionId),
    ResolveExtension(ExtensionId),
    Resolve,
}

impl CsvRecord {
    /// Converts a CSV record to an [`Action`].
    ///
    /// Returns `None` for unknown actions or missing required fields.
    fn into_action(self) -> Option<Action> {
        let booking = self.booking;
        let payer = || {
            if self.target.is_empty() {
                PayerRef::new(format!("cus_{booking}"))
            } else {
                PayerRef::new(self.target.clone())
            }
        };
        let money = |value: Option<Decimal>| value.and_then(Money::from_major);
        let tax_rate = || TaxRate::new(self.tax.unwrap_or_default()).ok();
        let refund = self.refund.unwrap_or(true);

        let action = match self.action.to_lowercase().as_str() {
            "booking" => Action::Booking {
                hours: self.target.parse().ok()?,
                hourly_rate: money(self.amount)?,
                tax_rate: tax_rate()?,
            },
            kind @ ("storage" | "equipment") => Action::LineItem {
                id: LineItemId(self.target.parse().ok()?),
                kind: if kind == "storage" {
                    LineItemKind::Storage
                } else {
                    LineItemKind::Equipment
                },
                price: money(self.amount)?,
            },
            "authorize" => Action::Authorize { payer: payer() },
            "approve" => Action::Approve {
                rejected: parse_ids(&self.target)?,
            },
            "reject" => Action::Reject,
            "request_cancel" => Action::RequestCancel,
            "cancel" => Action::Cancel { refund },
            "cancel_items" => Action::CancelItems {
                items: parse_ids(&self.target)?,
                refund,
            },
            kind @ ("extension" | "penalty") => Action::Extension {
                id: ExtensionId(self.target.parse().ok()?),
                kind: if kind == "extension" {
                    ChargeKind::Extension
                } else {
                    ChargeKind::Penalty
                },
                subtotal: money(self.amount)?,
                tax_rate: tax_rate()?,
            },
            "authorize_extension" => Action::AuthorizeExtension {
                id: ExtensionId(self.target.parse().ok()?),
                payer: PayerRef::new(format!("cus_{booking}")),
            },
            "approve_extension" => Action::ApproveExtension(ExtensionId(self.target.parse().ok()?)),
            "decline_extension" => Action::DeclineExtension(ExtensionId(self.target.parse().ok()?)),
            "resolve_extension" => Action::ResolveExtension(ExtensionId(self.target.parse().ok()?)),
            "resolve" => Action::Resolve,
            _ => return None,
        };
        Some(action)
    }
}

/// Space-separated line item IDs; empty means none.
fn parse_ids(target: &str) -> Option<Vec<LineItemId>> {
    target
        .split_whitespace()
        .map(|id| id.parse().ok().map(LineItemId))
        .collect()
}

/// Builds an engine over a simulated processor whose notifications are
/// applied inline, before the processor call returns.
pub fn simulated_engine(config: SettlementConfig) -> SettlementEngine {
    let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
    let listener = ReconciliationListener::new(Arc::clone(&ledger));
    let processor = SimulatedProcessor::new().with_event_hook(Box::new(
        move |event: &ProcessorEvent| {
            if let Err(e) = listener.apply(event) {
                error!(intent = %event.intent_ref, error = %e, "failed to apply notification");
            }
        },
    ));
    SettlementEngine::new(config, ledger, Arc::new(processor))
}

/// Replays a scenario from a CSV reader.
///
/// `booking` rows open a draft and `storage` / `equipment` rows add line
/// items to it; the booking is created on its first other action.
/// Malformed rows and failed actions are logged and skipped.
///
/// # CSV Format
///
/// Expected columns: `action, booking, target, amount, tax, refund`
///
/// # Example
///
/// ```csv
/// action,booking,target,amount,tax,refund
/// booking,1,4,25.00,15,
/// storage,1,10,20.00,,
/// authorize,1,cus_1,,,
/// approve,1,10,,,
/// cancel,1,,,,true
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn process_scenario<R: Read>(
    reader: R,
    config: SettlementConfig,
) -> Result<SettlementEngine, csv::Error> {
    let engine = simulated_engine(config);
    let mut drafts: BTreeMap<BookingId, BookingDraft> = BTreeMap::new();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (row, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(row, error = %e, "skipping malformed row");
                continue;
            }
        };
        let booking_id = BookingId(record.booking);
        let Some(action) = record.into_action() else {
            warn!(row, "skipping invalid action");
            continue;
        };

        if let Err(e) = apply(&engine, &mut drafts, booking_id, action) {
            warn!(row, booking_id = %booking_id, error = %e, "action failed");
        }
    }

    for (_, draft) in std::mem::take(&mut drafts) {
        if let Err(e) = engine.create_booking(draft) {
            warn!(error = %e, "cannot create booking");
        }
    }
    Ok(engine)
}

fn apply(
    engine: &SettlementEngine,
    drafts: &mut BTreeMap<BookingId, BookingDraft>,
    booking_id: BookingId,
    action: Action,
) -> Result<(), SettlementError> {
    match action {
        Action::Booking {
            hours,
            hourly_rate,
            tax_rate,
        } => {
            if drafts.contains_key(&booking_id) || engine.booking(booking_id).is_some() {
                return Err(ValidationError::Duplicate(format!("booking {booking_id}")).into());
            }
            drafts.insert(
                booking_id,
                BookingDraft {
                    id: booking_id,
                    hourly_rate,
                    duration_hours: hours,
                    tax_rate,
                    line_items: Vec::new(),
                },
            );
            return Ok(());
        }
        Action::LineItem { id, kind, price } => {
            let draft = drafts
                .get_mut(&booking_id)
                .ok_or(ValidationError::BookingNotFound(booking_id))?;
            draft
                .line_items
                .push(LineItem::new(id, booking_id, kind, price));
            return Ok(());
        }
        _ => {}
    }

    if let Some(draft) = drafts.remove(&booking_id) {
        engine.create_booking(draft)?;
    }

    match action {
        Action::Authorize { payer } => engine.authorize_booking(booking_id, &payer).map(drop),
        Action::Approve { rejected } => engine
            .decide_approval(
                booking_id,
                &ApprovalDecision::Approve {
                    approved: Vec::new(),
                    rejected,
                },
            )
            .map(drop),
        Action::Reject => engine
            .decide_approval(booking_id, &ApprovalDecision::Reject)
            .map(drop),
        Action::RequestCancel => engine.request_cancellation(booking_id).map(drop),
        Action::Cancel { refund } => engine.decide_cancellation(booking_id, refund).map(drop),
        Action::CancelItems { items, refund } => engine
            .cancel_line_items(booking_id, &items, refund)
            .map(drop),
        Action::Extension {
            id,
            kind,
            subtotal,
            tax_rate,
        } => engine
            .create_extension(ExtensionDraft {
                id,
                booking_id,
                kind,
                subtotal,
                tax_rate,
            })
            .map(drop),
        Action::AuthorizeExtension { id, payer } => {
            engine.authorize_extension(id, &payer).map(drop)
        }
        Action::ApproveExtension(id) => engine.approve_extension(id).map(drop),
        Action::DeclineExtension(id) => engine.decline_extension(id).map(drop),
        Action::ResolveExtension(id) => engine.resolve_extension(id).map(drop),
        Action::Resolve => engine.resolve_pending(booking_id).map(drop),
        Action::Booking { .. } | Action::LineItem { .. } => Ok(()),
    }
}

/// Output row per booking.
#[derive(Debug, Serialize)]
struct BookingRow {
    booking: BookingId,
    status: String,
    payment_status: String,
    captured: String,
    refunded: String,
    manual_refund: bool,
}

/// Writes final booking states to a CSV writer.
///
/// `captured` and `refunded` total every ledger entry of the booking,
/// extensions and penalties included.
///
/// # CSV Format
///
/// Columns: `booking, status, payment_status, captured, refunded, manual_refund`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_bookings<W: Write>(engine: &SettlementEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for booking in engine.bookings() {
        let entries = engine.ledger_entries(booking.id);
        let captured: Money = entries
            .iter()
            .filter(|entry| entry.status.is_captured())
            .map(|entry| entry.gross_amount)
            .sum();
        let refunded: Money = entries.iter().map(|entry| entry.refunded).sum();
        wtr.serialize(BookingRow {
            booking: booking.id,
            status: booking.status.to_string(),
            payment_status: booking.payment_status.to_string(),
            captured: captured.to_string(),
            refunded: refunded.to_string(),
            manual_refund: booking.requires_manual_refund,
        })?;
    }

    wtr.flush()?;
    Ok(())
}
