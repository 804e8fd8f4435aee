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

//! Error types for ledger and settlement processing.
//!
//! `DuplicateEntry` deserves a note: at the store level it is an error
//! (the unique constraint fired), but the settlement engine treats a
//! replayed event as a success-no-op, so it rarely reaches callers.

use crate::base::{UserId, WalletId, WalletKind};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the ledger store, the only component allowed
/// to mutate wallet balances.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Ledger entries require a caller-supplied idempotency key
    #[error("missing external id for ledger entry")]
    MissingExternalId,

    /// The (wallet, external id) pair already has an entry
    #[error("duplicate ledger entry for external id")]
    DuplicateEntry,

    /// Debit would overdraw a USER wallet
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        balance: Decimal,
        requested: Decimal,
    },

    /// Referenced wallet does not exist
    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    /// Referenced entry does not exist (metadata enrichment)
    #[error("ledger entry not found for external id '{0}'")]
    EntryNotFound(String),
}

/// Errors raised while dispatching a payout to the payment provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Provider did not answer within the configured timeout
    #[error("payment gateway timed out")]
    Timeout,

    /// Provider rejected the payout
    #[error("payment gateway rejected the request: {code}: {message}")]
    Rejected { code: String, message: String },

    /// Transport-level failure reaching the provider
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
}

/// Settlement-level errors surfaced to the caller of a flow.
///
/// Errors in the user leg abort the whole operation before any state is
/// committed; errors in the fee-to-treasury leg are logged and isolated
/// and never appear here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Malformed input, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Event references a user unknown to the directory
    #[error("user {0} not found")]
    UserNotFound(UserId),

    /// Withdrawal would exceed the balance once the fee is added
    #[error(
        "insufficient balance: have {balance}, withdrawal {requested} + fee {fee} requires {required}"
    )]
    InsufficientBalance {
        balance: Decimal,
        requested: Decimal,
        fee: Decimal,
        required: Decimal,
    },

    /// No treasury user is flagged and no fallback is configured
    #[error("no treasury (house) user configured")]
    HouseUserNotConfigured,

    /// The resolved treasury wallet is not of kind HOUSE
    #[error("wallet {wallet} resolved for the treasury has kind {kind}, expected HOUSE")]
    InvalidHouseWalletType { wallet: WalletId, kind: WalletKind },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SettlementError {
    /// Stable error kind string for the `{ok:false, error:<kind>}` response
    /// body convention.
    pub fn kind(&self) -> &'static str {
        match self {
            SettlementError::Validation(_) => "ValidationError",
            SettlementError::UserNotFound(_) => "NotFound",
            SettlementError::InsufficientBalance { .. } => "InsufficientBalance",
            SettlementError::HouseUserNotConfigured => "HouseUserNotConfigured",
            SettlementError::InvalidHouseWalletType { .. } => "InvalidHouseWalletType",
            SettlementError::Ledger(LedgerError::DuplicateEntry) => "DuplicateEntry",
            SettlementError::Ledger(LedgerError::InsufficientFunds { .. }) => "InsufficientFunds",
            SettlementError::Ledger(_) => "LedgerError",
            SettlementError::Gateway(GatewayError::Timeout) => "GatewayTimeout",
            SettlementError::Gateway(_) => "GatewayError",
        }
    }
}
