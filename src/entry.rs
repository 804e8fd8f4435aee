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

//! Ledger entry records and their structured metadata.
//!
//! Entries are immutable: the only permitted post-hoc change is
//! merge-only enrichment of the metadata extension map. Corrections to a
//! posted entry are always new, reversing entries referencing the
//! original through [`EntryMeta::related_external_id`].

use crate::base::{Direction, EntryId, UserId, WalletId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classifies what a ledger entry settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionTag {
    /// Net credit of a confirmed deposit.
    PixDeposit,
    /// Net debit of a confirmed withdrawal.
    PixWithdraw,
    /// Fee collected on a deposit (treasury credit).
    PixInFee,
    /// Fee charged on a withdrawal (user debit and treasury credit).
    PixOutFee,
    /// Compensating credit after a failed payout dispatch.
    Rollback,
    /// Manual administrative adjustment.
    Adjustment,
}

/// Structured metadata attached to a ledger entry.
///
/// Known correlation keys and the fee breakdown are first-class typed
/// fields; provider-specific oddities go into the open `extra` map.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EntryMeta {
    /// Merchant-side order reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mer_order_no: Option<String>,
    /// Provider-side order reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_order_no: Option<String>,
    /// Provider trade / end-to-end reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_no: Option<String>,
    /// Upstream provider name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionTag>,
    /// Gross amount of the originating transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gross_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<Decimal>,
    /// Balance snapshot before this entry was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_balance: Option<Decimal>,
    /// Balance snapshot after this entry was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<Decimal>,
    /// Originating user, recorded on treasury fee entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_user: Option<UserId>,
    /// External id of the entry this one corrects or complements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_external_id: Option<String>,
    /// Open extension map for provider-specific fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EntryMeta {
    /// Merges `other` into the extension map. Merge-only: existing keys
    /// are overwritten by the incoming value, nothing is removed, and the
    /// typed fields are untouched.
    pub fn merge_extra(&mut self, other: BTreeMap<String, serde_json::Value>) {
        self.extra.extend(other);
    }
}

/// One immutable balance movement against a wallet.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub wallet_id: WalletId,
    pub direction: Direction,
    /// Always positive; the direction carries the sign.
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub meta: EntryMeta,
    /// Caller-supplied idempotency key, unique per wallet.
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// Correlation keys used to probe whether a provider event was already
/// applied. Providers commonly redeliver the same notification; any
/// matching key short-circuits settlement into a no-op success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationKeys {
    pub external_id: Option<String>,
    pub mer_order_no: Option<String>,
    pub provider_order_no: Option<String>,
    pub trade_no: Option<String>,
}

impl CorrelationKeys {
    pub fn is_empty(&self) -> bool {
        self.external_id.is_none()
            && self.mer_order_no.is_none()
            && self.provider_order_no.is_none()
            && self.trade_no.is_none()
    }
}

/// Filter for ledger reads. Results are newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Clamped to [`LedgerFilter::MAX_LIMIT`].
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub const MAX_LIMIT: usize = 1000;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::MAX_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(from) = self.from
            && entry.created_at < from
        {
            return false;
        }
        if let Some(to) = self.to
            && entry.created_at > to
        {
            return false;
        }
        true
    }
}
