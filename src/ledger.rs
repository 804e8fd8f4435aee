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

//! The ledger store: wallet registry plus posting façade.
//!
//! This is the only component permitted to mutate a wallet balance.
//! Wallets are created lazily on first reference to an
//! (owner, currency, kind) triple; concurrent first access converges on
//! one wallet through the index map's entry API.

use crate::base::{Currency, Direction, EntryId, UserId, WalletId, WalletKind};
use crate::entry::{CorrelationKeys, EntryMeta, LedgerEntry, LedgerFilter};
use crate::error::LedgerError;
use crate::wallet::{Posting, Wallet, WalletSummary};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent wallet and ledger-entry store.
///
/// # Invariants
///
/// - At most one wallet per (owner, currency, kind) triple.
/// - An external id appears at most once per wallet.
/// - A wallet's balance always equals credits minus debits of its log.
#[derive(Debug, Default)]
pub struct LedgerStore {
    wallets: DashMap<WalletId, Arc<Wallet>>,
    index: DashMap<(UserId, Currency, WalletKind), WalletId>,
    next_wallet_id: AtomicU64,
    next_entry_id: AtomicU64,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wallet for the triple, creating it with a zero balance
    /// on first reference. The index entry API serializes racing creators.
    pub fn get_or_create_wallet(
        &self,
        owner: UserId,
        currency: Currency,
        kind: WalletKind,
    ) -> Arc<Wallet> {
        let key = (owner, currency.clone(), kind);
        match self.index.entry(key) {
            Entry::Occupied(slot) => self
                .wallets
                .get(slot.get())
                .map(|w| Arc::clone(&w))
                .expect("indexed wallet must exist"),
            Entry::Vacant(slot) => {
                let id = WalletId(self.next_wallet_id.fetch_add(1, Ordering::Relaxed) + 1);
                let wallet = Arc::new(Wallet::new(id, owner, kind, currency));
                self.wallets.insert(id, Arc::clone(&wallet));
                slot.insert(id);
                wallet
            }
        }
    }

    pub fn wallet(&self, id: WalletId) -> Option<Arc<Wallet>> {
        self.wallets.get(&id).map(|w| Arc::clone(&w))
    }

    /// Existing wallet for the triple, without creating one.
    pub fn find_wallet(
        &self,
        owner: UserId,
        currency: &Currency,
        kind: WalletKind,
    ) -> Option<Arc<Wallet>> {
        self.index
            .get(&(owner, currency.clone(), kind))
            .and_then(|id| self.wallet(*id))
    }

    /// Iterates over all wallets (reporting).
    pub fn wallets(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, WalletId, Arc<Wallet>>> {
        self.wallets.iter()
    }

    /// Writes one CREDIT entry and raises the balance, atomically.
    pub fn credit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        description: Option<String>,
        meta: EntryMeta,
        external_id: String,
    ) -> Result<LedgerEntry, LedgerError> {
        self.post(wallet_id, Direction::Credit, amount, description, meta, external_id)
    }

    /// Writes one DEBIT entry and lowers the balance, atomically.
    /// Refuses to overdraw USER wallets.
    pub fn debit(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        description: Option<String>,
        meta: EntryMeta,
        external_id: String,
    ) -> Result<LedgerEntry, LedgerError> {
        self.post(wallet_id, Direction::Debit, amount, description, meta, external_id)
    }

    fn post(
        &self,
        wallet_id: WalletId,
        direction: Direction,
        amount: Decimal,
        description: Option<String>,
        meta: EntryMeta,
        external_id: String,
    ) -> Result<LedgerEntry, LedgerError> {
        let wallet = self
            .wallet(wallet_id)
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;

        wallet.post(
            Posting {
                direction,
                amount,
                description,
                meta,
                external_id,
            },
            || EntryId(self.next_entry_id.fetch_add(1, Ordering::Relaxed) + 1),
        )
    }

    /// Read-only idempotency probe; see [`Wallet::is_processed`].
    pub fn is_processed(
        &self,
        wallet_id: WalletId,
        keys: &CorrelationKeys,
    ) -> Result<bool, LedgerError> {
        let wallet = self
            .wallet(wallet_id)
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;
        Ok(wallet.is_processed(keys))
    }

    pub fn entries(
        &self,
        wallet_id: WalletId,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let wallet = self
            .wallet(wallet_id)
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;
        Ok(wallet.entries(filter))
    }

    /// Merge-only metadata enrichment; see [`Wallet::merge_meta`].
    pub fn merge_meta(
        &self,
        wallet_id: WalletId,
        external_id: &str,
        extra: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let wallet = self
            .wallet(wallet_id)
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;
        wallet.merge_meta(external_id, extra)
    }

    pub fn summary(&self, wallet_id: WalletId) -> Result<WalletSummary, LedgerError> {
        let wallet = self
            .wallet(wallet_id)
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;
        Ok(wallet.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn lazy_creation_converges_on_one_wallet() {
        let store = LedgerStore::new();
        let a = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::User);
        let b = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::User);
        assert_eq!(a.id(), b.id());
        assert_eq!(store.wallets().count(), 1);
    }

    #[test]
    fn kinds_and_currencies_are_distinct_wallets() {
        let store = LedgerStore::new();
        let user = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::User);
        let house = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::House);
        let usd = store.get_or_create_wallet(UserId(1), Currency::new("USD"), WalletKind::User);
        assert_ne!(user.id(), house.id());
        assert_ne!(user.id(), usd.id());
    }

    #[test]
    fn credit_then_debit_round_trip() {
        let store = LedgerStore::new();
        let wallet = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::User);

        store
            .credit(
                wallet.id(),
                dec!(100.00),
                Some("deposit".to_string()),
                EntryMeta::default(),
                "dep-1".to_string(),
            )
            .unwrap();
        store
            .debit(
                wallet.id(),
                dec!(40.00),
                Some("withdraw".to_string()),
                EntryMeta::default(),
                "wd-1".to_string(),
            )
            .unwrap();

        assert_eq!(wallet.balance(), dec!(60.00));
        let summary = store.summary(wallet.id()).unwrap();
        assert_eq!(summary.total_credit, dec!(100.00));
        assert_eq!(summary.total_debit, dec!(40.00));
    }

    #[test]
    fn unknown_wallet_is_an_error() {
        let store = LedgerStore::new();
        let result = store.credit(
            WalletId(99),
            dec!(1.00),
            None,
            EntryMeta::default(),
            "x".to_string(),
        );
        assert_eq!(result.unwrap_err(), LedgerError::WalletNotFound(WalletId(99)));
    }

    #[test]
    fn entry_ids_are_globally_unique() {
        let store = LedgerStore::new();
        let w1 = store.get_or_create_wallet(UserId(1), Currency::brl(), WalletKind::User);
        let w2 = store.get_or_create_wallet(UserId(2), Currency::brl(), WalletKind::User);

        let a = store
            .credit(w1.id(), dec!(1.00), None, EntryMeta::default(), "a".to_string())
            .unwrap();
        let b = store
            .credit(w2.id(), dec!(1.00), None, EntryMeta::default(), "b".to_string())
            .unwrap();
        assert_ne!(a.id, b.id);
    }
}
