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

//! # PIX Ledger
//!
//! This library provides a multi-tenant wallet and settlement engine for
//! PIX-style instant payments: an append-only ledger with idempotent
//! postings, per-user fee schedules, treasury fee routing, payout
//! dispatch and merchant webhook notification.
//!
//! ## Core Components
//!
//! - [`SettlementEngine`]: Orchestrates deposit and withdrawal flows
//! - [`LedgerStore`]: Concurrent wallet registry and append-only entry log
//! - [`FeeSchedule`]: Per-user, per-direction fee configuration
//! - [`TreasuryResolver`]: Locates the house wallet collecting fees
//! - [`WebhookDispatcher`]: Merchant notifications with a persisted delivery log
//! - [`SettlementError`]: Errors surfaced by the settlement flows
//!
//! ## Example
//!
//! ```
//! use pix_ledger_rs::{
//!     Currency, FeeConfig, FeeSchedule, LedgerStore, PaymentEvent, SettlementEngine,
//!     SettlementStatus, TreasuryResolver, UserDirectory, UserId, UserRecord,
//! };
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let directory = Arc::new(UserDirectory::new());
//! directory.upsert(UserRecord::new(UserId(1), "merchant"));
//! directory.upsert(UserRecord::new(UserId(2), "house").treasury());
//!
//! let fees = Arc::new(FeeSchedule::new());
//! fees.upsert(UserId(1), FeeConfig::percent(dec!(2), dec!(2)));
//!
//! let engine = SettlementEngine::new(
//!     Arc::new(LedgerStore::new()),
//!     fees,
//!     directory,
//!     Arc::new(TreasuryResolver::new(None)),
//! );
//!
//! // Settle a confirmed deposit: user is credited net of the 2% fee.
//! let event = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "order-1");
//! let receipt = engine.apply_deposit(&event).await.unwrap();
//! assert_eq!(receipt.status, SettlementStatus::Applied);
//! assert_eq!(receipt.balance, dec!(98.00));
//!
//! // Redelivered notifications are no-ops.
//! let replay = engine.apply_deposit(&event).await.unwrap();
//! assert_eq!(replay.status, SettlementStatus::AlreadyProcessed);
//! # });
//! ```
//!
//! ## Thread Safety
//!
//! Wallets are independently locked, so settlements for different users
//! proceed in parallel; postings against one wallet serialize on its lock
//! and can never overdraw it.

mod base;
pub mod directory;
pub mod entry;
pub mod error;
pub mod fees;
mod ledger;
pub mod settlement;
mod treasury;
pub mod wallet;
pub mod webhook;

pub use base::{Currency, Direction, EntryId, TransferSide, UserId, WalletId, WalletKind};
pub use directory::{UserDirectory, UserRecord};
pub use entry::{CorrelationKeys, EntryMeta, LedgerEntry, LedgerFilter, TransactionTag};
pub use error::{GatewayError, LedgerError, SettlementError};
pub use fees::{FeeConfig, FeeKind, FeeSchedule, compute_fee, round_to_cents};
pub use ledger::LedgerStore;
pub use settlement::{
    PayoutGateway, PayoutReceipt, PayoutRequest, PaymentEvent, SettlementEngine,
    SettlementReceipt, SettlementStatus,
};
pub use treasury::TreasuryResolver;
pub use wallet::{Wallet, WalletSummary};
pub use webhook::{
    DeliveryLog, DeliveryOutcome, DeliveryQuery, DeliveryRecord, DeliveryStatus, ResendReport,
    WebhookConfig, WebhookDispatcher, WebhookPayload,
};
