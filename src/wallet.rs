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

//! Wallet state and the atomic posting primitive.
//!
//! Each wallet guards its balance, entry log, and idempotency index with
//! one mutex. A posting is a single critical section: the duplicate
//! check, the overdraft check, the entry insert, and the balance update
//! all happen under the same lock, so no entry can exist without the
//! balance reflecting it and two concurrent debits cannot both pass a
//! stale balance check. Operations on different wallets share no lock.

use crate::base::{Direction, EntryId, UserId, WalletId};
use crate::base::{Currency, WalletKind};
use crate::entry::{CorrelationKeys, EntryMeta, LedgerEntry, LedgerFilter};
use crate::error::LedgerError;
use crate::fees::MONEY_DP;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct WalletData {
    balance: Decimal,
    /// Append-only entry log, insertion order.
    entries: Vec<LedgerEntry>,
    /// External id -> position in `entries`, the per-wallet unique constraint.
    external_ids: HashMap<String, usize>,
    /// Correlation keys (merchant/provider/trade refs) of applied entries.
    correlations: HashSet<String>,
}

impl WalletData {
    fn new() -> Self {
        Self {
            balance: Decimal::ZERO,
            entries: Vec::new(),
            external_ids: HashMap::new(),
            correlations: HashSet::new(),
        }
    }

    fn index_correlations(&mut self, meta: &EntryMeta) {
        for key in [&meta.mer_order_no, &meta.provider_order_no, &meta.trade_no]
            .into_iter()
            .flatten()
        {
            self.correlations.insert(key.clone());
        }
    }
}

/// A balance-bearing wallet for one (owner, currency) pair, or the
/// singular HOUSE wallet of a currency.
#[derive(Debug)]
pub struct Wallet {
    id: WalletId,
    owner: UserId,
    kind: WalletKind,
    currency: Currency,
    inner: Mutex<WalletData>,
}

/// Arguments for one posting. The external id is the caller-supplied
/// idempotency key and is mandatory.
#[derive(Debug, Clone)]
pub struct Posting {
    pub direction: Direction,
    pub amount: Decimal,
    pub description: Option<String>,
    pub meta: EntryMeta,
    pub external_id: String,
}

impl Wallet {
    pub(crate) fn new(id: WalletId, owner: UserId, kind: WalletKind, currency: Currency) -> Self {
        Self {
            id,
            owner,
            kind,
            currency,
            inner: Mutex::new(WalletData::new()),
        }
    }

    pub fn id(&self) -> WalletId {
        self.id
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn kind(&self) -> WalletKind {
        self.kind
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().balance
    }

    /// Applies one posting atomically.
    ///
    /// `next_id` is invoked while the wallet lock is held, after all
    /// checks passed, so allocated entry ids are dense per wallet.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - amount is zero or negative.
    /// - [`LedgerError::MissingExternalId`] - empty idempotency key.
    /// - [`LedgerError::DuplicateEntry`] - external id already posted here.
    /// - [`LedgerError::InsufficientFunds`] - USER debit over the balance
    ///   (HOUSE wallets are exempt).
    pub(crate) fn post(
        &self,
        posting: Posting,
        next_id: impl FnOnce() -> EntryId,
    ) -> Result<LedgerEntry, LedgerError> {
        if posting.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if posting.external_id.is_empty() {
            return Err(LedgerError::MissingExternalId);
        }

        let mut data = self.inner.lock();

        if data.external_ids.contains_key(&posting.external_id) {
            return Err(LedgerError::DuplicateEntry);
        }

        if posting.direction == Direction::Debit
            && self.kind == WalletKind::User
            && posting.amount > data.balance
        {
            return Err(LedgerError::InsufficientFunds {
                balance: data.balance,
                requested: posting.amount,
            });
        }

        let previous = data.balance;
        let new_balance = match posting.direction {
            Direction::Credit => previous + posting.amount,
            Direction::Debit => previous - posting.amount,
        };

        let mut meta = posting.meta;
        meta.previous_balance = Some(previous);
        meta.new_balance = Some(new_balance);

        let entry = LedgerEntry {
            id: next_id(),
            wallet_id: self.id,
            direction: posting.direction,
            amount: posting.amount,
            description: posting.description,
            meta,
            external_id: posting.external_id,
            created_at: Utc::now(),
        };

        data.balance = new_balance;
        data.index_correlations(&entry.meta);
        let position = data.entries.len();
        data.external_ids
            .insert(entry.external_id.clone(), position);
        data.entries.push(entry.clone());

        self.assert_invariants(&data);
        Ok(entry)
    }

    /// Read-only idempotency probe over external id and correlation keys.
    pub fn is_processed(&self, keys: &CorrelationKeys) -> bool {
        if keys.is_empty() {
            return false;
        }

        let data = self.inner.lock();

        if let Some(external_id) = &keys.external_id
            && data.external_ids.contains_key(external_id)
        {
            return true;
        }

        [&keys.mer_order_no, &keys.provider_order_no, &keys.trade_no]
            .into_iter()
            .flatten()
            .any(|key| data.correlations.contains(key))
    }

    /// Merge-only metadata enrichment of an existing entry.
    pub fn merge_meta(
        &self,
        external_id: &str,
        extra: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let mut data = self.inner.lock();
        let position = *data
            .external_ids
            .get(external_id)
            .ok_or_else(|| LedgerError::EntryNotFound(external_id.to_string()))?;
        data.entries[position].meta.merge_extra(extra);
        Ok(())
    }

    /// Entries newest first, filtered by timestamp window and limit.
    pub fn entries(&self, filter: &LedgerFilter) -> Vec<LedgerEntry> {
        let data = self.inner.lock();
        data.entries
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(filter.effective_limit())
            .cloned()
            .collect()
    }

    pub fn entry_by_external_id(&self, external_id: &str) -> Option<LedgerEntry> {
        let data = self.inner.lock();
        data.external_ids
            .get(external_id)
            .map(|&position| data.entries[position].clone())
    }

    /// Sum of credits and sum of debits over the whole log.
    pub fn summary(&self) -> WalletSummary {
        let data = self.inner.lock();
        let mut summary = WalletSummary::default();
        for entry in &data.entries {
            match entry.direction {
                Direction::Credit => summary.total_credit += entry.amount,
                Direction::Debit => summary.total_debit += entry.amount,
            }
        }
        summary
    }

    fn assert_invariants(&self, data: &WalletData) {
        debug_assert!(
            self.kind == WalletKind::House || data.balance >= Decimal::ZERO,
            "Invariant violated: USER wallet {} balance went negative: {}",
            self.id,
            data.balance
        );
        debug_assert_eq!(
            data.entries.len(),
            data.external_ids.len(),
            "Invariant violated: entry log and idempotency index diverged"
        );
    }
}

/// Aggregated credit/debit totals of one wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletSummary {
    pub total_credit: Decimal,
    pub total_debit: Decimal,
}

impl Serialize for Wallet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Wallet", 5)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("owner", &self.owner)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("currency", &self.currency)?;
        state.serialize_field("balance", &data.balance.round_dp(MONEY_DP))?;
        state.end()
    }
}
