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

//! User directory: the engine-facing slice of the identity layer.
//!
//! Authentication is out of scope; the directory only answers the
//! questions settlement asks about an already-resolved user id: does the
//! user exist, is it flagged as the treasury account, and where do its
//! webhook notifications go.

use crate::base::{TransferSide, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One registered user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    /// At most one user should carry this flag; resolution tie-breaks by
    /// ascending id if more are flagged.
    pub is_treasury: bool,
    /// Generic fallback webhook URL.
    pub webhook_url: Option<String>,
    /// Deposit-specific webhook URL, takes priority over the generic one.
    pub webhook_url_pix_in: Option<String>,
    /// Withdrawal-specific webhook URL, takes priority over the generic one.
    pub webhook_url_pix_out: Option<String>,
}

impl UserRecord {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_treasury: false,
            webhook_url: None,
            webhook_url_pix_in: None,
            webhook_url_pix_out: None,
        }
    }

    pub fn treasury(mut self) -> Self {
        self.is_treasury = true;
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_webhook_url_pix_in(mut self, url: impl Into<String>) -> Self {
        self.webhook_url_pix_in = Some(url.into());
        self
    }

    pub fn with_webhook_url_pix_out(mut self, url: impl Into<String>) -> Self {
        self.webhook_url_pix_out = Some(url.into());
        self
    }

    /// Webhook target for a transfer direction: the direction-specific
    /// URL when configured, else the generic fallback.
    pub fn webhook_target(&self, side: TransferSide) -> Option<&str> {
        let specific = match side {
            TransferSide::PixIn => self.webhook_url_pix_in.as_deref(),
            TransferSide::PixOut => self.webhook_url_pix_out.as_deref(),
        };
        specific.or(self.webhook_url.as_deref())
    }
}

/// In-memory registry of user records.
#[derive(Debug, Default)]
pub struct UserDirectory {
    users: DashMap<UserId, UserRecord>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: UserRecord) {
        self.users.insert(record.id, record);
    }

    pub fn get(&self, id: UserId) -> Option<UserRecord> {
        self.users.get(&id).map(|u| u.clone())
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    /// The flagged treasury user with the lowest id, if any.
    pub fn treasury_user(&self) -> Option<UserRecord> {
        self.users
            .iter()
            .filter(|u| u.is_treasury)
            .min_by_key(|u| u.id)
            .map(|u| u.clone())
    }
}
