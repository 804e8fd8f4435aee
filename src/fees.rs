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

//! Transaction fee computation and per-user fee configuration.
//!
//! [`compute_fee`] is a pure function: same (amount, kind, value) always
//! yields the same fee, PERCENT mode scales linearly with the amount,
//! FIXED mode is amount-invariant. It never fails; invalid inputs
//! produce a zero fee.
//!
//! A [`FeeConfig`] carries independent settings for the inbound (PIX IN)
//! and outbound (PIX OUT) directions, plus a legacy percent-only pair
//! kept for backward compatibility. The combined fee for a direction is
//! the fixed component (when configured) plus the legacy percent
//! component, each rounded into a 2-decimal total.

use crate::base::{TransferSide, UserId};
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Money precision: two decimal places, centavos.
pub const MONEY_DP: u32 = 2;

/// Rounds an amount to 2 decimal places, half away from zero.
pub fn round_to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// How a fee value is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeKind {
    /// Value is a percentage of the transaction amount.
    #[default]
    Percent,
    /// Value is a flat amount per transaction.
    Fixed,
}

/// Computes the fee owed for one transaction.
///
/// Returns zero for a non-positive amount or fee value; otherwise
/// `value` itself for [`FeeKind::Fixed`], or `amount * value / 100` for
/// [`FeeKind::Percent`], rounded to 2 decimal places.
pub fn compute_fee(amount: Decimal, kind: FeeKind, value: Decimal) -> Decimal {
    if amount <= Decimal::ZERO || value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let fee = match kind {
        FeeKind::Fixed => value,
        FeeKind::Percent => amount * value / Decimal::ONE_HUNDRED,
    };

    round_to_cents(fee)
}

/// Per-user fee configuration, one independent setting per direction.
///
/// The typed value is charged only in FIXED mode; the percent component
/// always comes from the legacy `pix_in_percent` / `pix_out_percent`
/// fields, and the two add up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FeeConfig {
    pub pix_in_fee_type: FeeKind,
    pub pix_in_fee_value: Decimal,
    pub pix_out_fee_type: FeeKind,
    pub pix_out_fee_value: Decimal,
    pub pix_in_percent: Decimal,
    pub pix_out_percent: Decimal,
}

impl FeeConfig {
    /// Flat percent configuration for both directions.
    pub fn percent(pix_in: Decimal, pix_out: Decimal) -> Self {
        FeeConfig {
            pix_in_percent: pix_in,
            pix_out_percent: pix_out,
            ..FeeConfig::default()
        }
    }

    /// Flat fixed configuration for both directions.
    pub fn fixed(pix_in: Decimal, pix_out: Decimal) -> Self {
        FeeConfig {
            pix_in_fee_type: FeeKind::Fixed,
            pix_in_fee_value: pix_in,
            pix_out_fee_type: FeeKind::Fixed,
            pix_out_fee_value: pix_out,
            ..FeeConfig::default()
        }
    }

    /// Combined fee for a deposit: fixed component (when the inbound type
    /// is FIXED) plus the legacy percent component.
    pub fn pix_in_fee(&self, amount: Decimal) -> Decimal {
        self.combined_fee(
            amount,
            self.pix_in_fee_type,
            self.pix_in_fee_value,
            self.pix_in_percent,
        )
    }

    /// Combined fee for a withdrawal.
    pub fn pix_out_fee(&self, amount: Decimal) -> Decimal {
        self.combined_fee(
            amount,
            self.pix_out_fee_type,
            self.pix_out_fee_value,
            self.pix_out_percent,
        )
    }

    /// Fee for the given transfer direction.
    pub fn fee_for(&self, side: TransferSide, amount: Decimal) -> Decimal {
        match side {
            TransferSide::PixIn => self.pix_in_fee(amount),
            TransferSide::PixOut => self.pix_out_fee(amount),
        }
    }

    fn combined_fee(
        &self,
        amount: Decimal,
        kind: FeeKind,
        value: Decimal,
        legacy_percent: Decimal,
    ) -> Decimal {
        if amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut total = Decimal::ZERO;
        if kind == FeeKind::Fixed && value > Decimal::ZERO {
            total += value;
        }
        if legacy_percent > Decimal::ZERO {
            total += amount * legacy_percent / Decimal::ONE_HUNDRED;
        }

        round_to_cents(total)
    }
}

/// In-memory store of per-user fee configurations.
///
/// Upserted by administrators, read on every settlement. A user with no
/// record pays no fee.
#[derive(Debug, Default)]
pub struct FeeSchedule {
    configs: DashMap<UserId, FeeConfig>,
}

impl FeeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: UserId) -> Option<FeeConfig> {
        self.configs.get(&user).map(|c| c.clone())
    }

    pub fn upsert(&self, user: UserId, config: FeeConfig) {
        self.configs.insert(user, config);
    }

    /// Fee for one transaction of `user`; zero when no config exists.
    pub fn fee_for(&self, user: UserId, side: TransferSide, amount: Decimal) -> Decimal {
        self.configs
            .get(&user)
            .map(|c| c.fee_for(side, amount))
            .unwrap_or(Decimal::ZERO)
    }
}
