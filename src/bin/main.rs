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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use pix_ledger_rs::{
    Currency, FeeConfig, FeeSchedule, LedgerStore, PaymentEvent, SettlementEngine,
    TreasuryResolver, UserDirectory, UserId, UserRecord,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// PIX Ledger - Settle provider event CSV files
///
/// Reads payment events from a CSV file and outputs wallet states to stdout.
/// Supports deposits and withdrawals; users are registered on first sight.
#[derive(Parser, Debug)]
#[command(name = "pix-ledger-rs")]
#[command(about = "A settlement engine that processes PIX event CSVs", long_about = None)]
struct Args {
    /// Path to CSV file with payment events
    ///
    /// Expected format: type,user,amount,external_id,fee
    /// Example: cargo run -- events.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// User id collecting fees (the house wallet owner)
    #[arg(long, value_name = "ID", default_value_t = 1)]
    house_user: u64,

    /// Percent fee applied to every user, both directions
    #[arg(long, value_name = "PCT", default_value = "0")]
    fee_percent: Decimal,

    /// Currency code for all wallets
    #[arg(long, default_value = "BRL")]
    currency: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = match process_events(BufReader::new(file), &args).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error processing events: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_wallets(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `type, user, amount, external_id, fee`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    event_type: String,
    user: u64,
    #[serde(deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    external_id: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    fee: Option<Decimal>,
}

impl CsvRecord {
    fn into_event(self, currency: &Currency) -> Option<(String, PaymentEvent)> {
        let amount = self.amount?;
        let mut event = PaymentEvent::new(
            UserId(self.user),
            amount,
            currency.clone(),
            self.external_id,
        );
        event.fee = self.fee;
        Some((self.event_type.to_lowercase(), event))
    }
}

/// Settles events from a CSV reader, one at a time in file order.
///
/// Users are registered on first sight, the house user up front.
/// Malformed rows and failed settlements are skipped; failures are
/// reported on stderr in debug builds only.
///
/// # CSV Format
///
/// Expected columns: `type, user, amount, external_id, fee`
/// - `type`: Event type (deposit, withdrawal)
/// - `user`: User ID (u64)
/// - `amount`: Gross decimal amount
/// - `external_id`: Idempotency key for the resulting entry
/// - `fee`: Gateway-computed fee (optional; empty means compute locally)
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub async fn process_events<R: Read>(reader: R, args: &Args) -> Result<SettlementEngine, csv::Error> {
    let currency = Currency::new(&args.currency);

    let directory = Arc::new(UserDirectory::new());
    directory.upsert(UserRecord::new(UserId(args.house_user), "house").treasury());

    let fees = Arc::new(FeeSchedule::new());

    let engine = SettlementEngine::new(
        Arc::new(LedgerStore::new()),
        Arc::clone(&fees),
        Arc::clone(&directory),
        Arc::new(TreasuryResolver::new(None)),
    );

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true) // Allow missing fee field
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                let Some((event_type, event)) = record.into_event(&currency) else {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping event record without amount");
                    continue;
                };

                if !directory.contains(event.user_id) {
                    directory.upsert(UserRecord::new(
                        event.user_id,
                        format!("user-{}", event.user_id),
                    ));
                    if args.fee_percent > Decimal::ZERO {
                        fees.upsert(
                            event.user_id,
                            FeeConfig::percent(args.fee_percent, args.fee_percent),
                        );
                    }
                }

                let outcome = match event_type.as_str() {
                    "deposit" => engine.apply_deposit(&event).await,
                    "withdrawal" | "withdraw" => engine.apply_withdrawal(&event).await,
                    _ => {
                        #[cfg(debug_assertions)]
                        eprintln!("Skipping unknown event type '{}'", event_type);
                        continue;
                    }
                };

                if let Err(_e) = outcome {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping event {}: {}", event.external_id, _e);
                }
            }
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", _e);
                continue;
            }
        }
    }

    Ok(engine)
}

/// Writes all wallet states in CSV format with 2 decimal precision.
///
/// # CSV Format
///
/// Columns: `id, owner, kind, currency, balance`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_wallets<W: Write>(engine: &SettlementEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for wallet in engine.ledger().wallets() {
        wtr.serialize(wallet.value().as_ref())?;
    }

    wtr.flush()?;
    Ok(())
}
