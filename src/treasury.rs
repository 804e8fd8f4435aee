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

//! Treasury (house) wallet resolution.
//!
//! Resolution priority: a user flagged as the treasury account (lowest
//! id wins when more than one is flagged) before the statically
//! configured fallback user. The resolved wallet id is cached per
//! currency; the wallet kind is re-checked on every cache hit so a
//! corrupted mapping fails loudly instead of mixing user funds into the
//! treasury.

use crate::base::{Currency, UserId, WalletId, WalletKind};
use crate::directory::UserDirectory;
use crate::error::SettlementError;
use crate::ledger::LedgerStore;
use crate::wallet::Wallet;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Locates or creates the singular HOUSE wallet of a currency.
#[derive(Debug, Default)]
pub struct TreasuryResolver {
    /// Fallback owner when no user carries the treasury flag.
    fallback_user: Option<UserId>,
    cache: DashMap<Currency, WalletId>,
}

impl TreasuryResolver {
    pub fn new(fallback_user: Option<UserId>) -> Self {
        Self {
            fallback_user,
            cache: DashMap::new(),
        }
    }

    /// Resolves the house wallet for `currency`.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::HouseUserNotConfigured`] - neither a flagged
    ///   treasury user nor a valid fallback resolves to a known user.
    /// - [`SettlementError::InvalidHouseWalletType`] - the resolved
    ///   wallet is not of kind HOUSE.
    pub fn resolve(
        &self,
        directory: &UserDirectory,
        ledger: &LedgerStore,
        currency: &Currency,
    ) -> Result<Arc<Wallet>, SettlementError> {
        if let Some(id) = self.cache.get(currency) {
            if let Some(wallet) = ledger.wallet(*id) {
                return Self::checked(wallet);
            }
        }

        let owner = self.house_user(directory)?;
        debug!(user = %owner, currency = %currency, "resolved treasury user");

        let wallet = ledger.get_or_create_wallet(owner, currency.clone(), WalletKind::House);
        let wallet = Self::checked(wallet)?;
        self.cache.insert(currency.clone(), wallet.id());
        Ok(wallet)
    }

    fn house_user(&self, directory: &UserDirectory) -> Result<UserId, SettlementError> {
        if let Some(user) = directory.treasury_user() {
            return Ok(user.id);
        }

        match self.fallback_user {
            Some(id) if directory.contains(id) => Ok(id),
            _ => Err(SettlementError::HouseUserNotConfigured),
        }
    }

    fn checked(wallet: Arc<Wallet>) -> Result<Arc<Wallet>, SettlementError> {
        if wallet.kind() != WalletKind::House {
            return Err(SettlementError::InvalidHouseWalletType {
                wallet: wallet.id(),
                kind: wallet.kind(),
            });
        }
        Ok(wallet)
    }
}
