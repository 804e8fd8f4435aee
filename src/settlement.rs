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

//! The settlement engine: deposit and withdrawal flows over the ledger.
//!
//! The engine owns the orchestration, never the balances: every balance
//! change goes through [`LedgerStore`] postings. A settlement has one
//! mandatory user leg and one best-effort fee leg; a failed fee leg is
//! logged and isolated, a failed user leg aborts the whole operation.
//! Outbound webhooks are fire-and-forget and never affect the outcome.

use crate::base::{Currency, Direction, TransferSide, UserId, WalletId};
use crate::directory::{UserDirectory, UserRecord};
use crate::entry::{CorrelationKeys, EntryMeta, LedgerEntry, LedgerFilter, TransactionTag};
use crate::error::{GatewayError, LedgerError, SettlementError};
use crate::fees::{FeeSchedule, round_to_cents};
use crate::ledger::LedgerStore;
use crate::treasury::TreasuryResolver;
use crate::webhook::{WebhookDispatcher, WebhookPayload};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A confirmed payment notification from the upstream provider, or an
/// operator-initiated withdrawal order. Amounts are always gross.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaymentEvent {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    /// Provider status verbatim; only `SUCCESS` / `PAID` settle deposits.
    pub status: String,
    /// Idempotency key for the resulting ledger entry.
    pub external_id: String,
    pub mer_order_no: Option<String>,
    pub provider_order_no: Option<String>,
    pub trade_no: Option<String>,
    pub provider: Option<String>,
    /// Gateway-computed fee. `Some` is authoritative and overrides the
    /// user's fee schedule; `None` means compute locally.
    pub fee: Option<Decimal>,
}

impl PaymentEvent {
    pub fn new(
        user_id: UserId,
        amount: Decimal,
        currency: Currency,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            amount,
            currency,
            status: "SUCCESS".to_string(),
            external_id: external_id.into(),
            mer_order_no: None,
            provider_order_no: None,
            trade_no: None,
            provider: None,
            fee: None,
        }
    }

    /// True when the provider reports the payment as completed.
    pub fn is_settleable(&self) -> bool {
        self.status.eq_ignore_ascii_case("SUCCESS") || self.status.eq_ignore_ascii_case("PAID")
    }

    pub fn correlation_keys(&self) -> CorrelationKeys {
        CorrelationKeys {
            external_id: (!self.external_id.is_empty()).then(|| self.external_id.clone()),
            mer_order_no: self.mer_order_no.clone(),
            provider_order_no: self.provider_order_no.clone(),
            trade_no: self.trade_no.clone(),
        }
    }

    fn base_meta(&self, tag: TransactionTag) -> EntryMeta {
        EntryMeta {
            mer_order_no: self.mer_order_no.clone(),
            provider_order_no: self.provider_order_no.clone(),
            trade_no: self.trade_no.clone(),
            provider: self.provider.clone(),
            transaction_type: Some(tag),
            ..EntryMeta::default()
        }
    }
}

/// How a settlement request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    /// Ledger entries were written.
    Applied,
    /// The event was seen before; nothing changed.
    AlreadyProcessed,
    /// The provider status does not settle; nothing changed.
    Ignored,
}

/// Outcome of a settlement flow, complete enough that callers reconcile
/// without a follow-up balance read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReceipt {
    pub status: SettlementStatus,
    pub wallet_id: WalletId,
    pub balance: Decimal,
    pub gross: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
    /// Id of the primary user-leg entry, absent on no-op outcomes.
    pub entry_id: Option<crate::base::EntryId>,
}

/// Payout order handed to the payment provider on withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub external_id: String,
    pub mer_order_no: Option<String>,
}

/// Provider references returned by a successful payout dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PayoutReceipt {
    pub provider_order_no: Option<String>,
    pub trade_no: Option<String>,
}

/// Outbound payout rail. Implementations talk to the actual PIX
/// provider; tests substitute scripted doubles.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn dispatch(&self, request: &PayoutRequest) -> Result<PayoutReceipt, GatewayError>;
}

/// Orchestrates deposits, withdrawals and the supporting legs.
pub struct SettlementEngine {
    ledger: Arc<LedgerStore>,
    fees: Arc<FeeSchedule>,
    directory: Arc<UserDirectory>,
    treasury: Arc<TreasuryResolver>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    gateway: Option<Arc<dyn PayoutGateway>>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<LedgerStore>,
        fees: Arc<FeeSchedule>,
        directory: Arc<UserDirectory>,
        treasury: Arc<TreasuryResolver>,
    ) -> Self {
        Self {
            ledger,
            fees,
            directory,
            treasury,
            webhooks: None,
            gateway: None,
        }
    }

    /// Enables merchant webhook notifications.
    pub fn with_webhooks(mut self, dispatcher: Arc<WebhookDispatcher>) -> Self {
        self.webhooks = Some(dispatcher);
        self
    }

    /// Enables real payout dispatch on withdrawals. Without a gateway the
    /// withdrawal flow settles the ledger legs only.
    pub fn with_gateway(mut self, gateway: Arc<dyn PayoutGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.directory
    }

    pub fn fees(&self) -> &Arc<FeeSchedule> {
        &self.fees
    }

    /// Settles a confirmed inbound payment: credits the user the net
    /// amount and routes the fee to the treasury.
    ///
    /// Replayed events are detected through the correlation keys and
    /// return [`SettlementStatus::AlreadyProcessed`] without writing.
    pub async fn apply_deposit(
        &self,
        event: &PaymentEvent,
    ) -> Result<SettlementReceipt, SettlementError> {
        let (user, gross) = self.validate(event)?;
        let wallet =
            self.ledger
                .get_or_create_wallet(event.user_id, event.currency.clone(), crate::base::WalletKind::User);

        if !event.is_settleable() {
            info!(
                user = %event.user_id,
                external_id = %event.external_id,
                status = %event.status,
                "deposit status does not settle, ignoring"
            );
            return Ok(self.receipt(SettlementStatus::Ignored, &wallet, gross, Decimal::ZERO, gross, None));
        }

        if wallet.is_processed(&event.correlation_keys()) {
            return Ok(self.receipt(
                SettlementStatus::AlreadyProcessed,
                &wallet,
                gross,
                Decimal::ZERO,
                gross,
                None,
            ));
        }

        let fee = self.fee_for(event, TransferSide::PixIn, gross)?;
        if fee >= gross {
            return Err(SettlementError::Validation(format!(
                "fee {fee} consumes the whole deposit of {gross}"
            )));
        }
        let net = gross - fee;

        let mut meta = event.base_meta(TransactionTag::PixDeposit);
        meta.gross_amount = Some(gross);
        meta.fee_amount = Some(fee);
        meta.net_amount = Some(net);

        let entry = match self.ledger.credit(
            wallet.id(),
            net,
            Some("PIX deposit".to_string()),
            meta,
            event.external_id.clone(),
        ) {
            Ok(entry) => entry,
            // Lost a race with a concurrent replay of the same event.
            Err(LedgerError::DuplicateEntry) => {
                return Ok(self.receipt(
                    SettlementStatus::AlreadyProcessed,
                    &wallet,
                    gross,
                    Decimal::ZERO,
                    gross,
                    None,
                ));
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            user = %event.user_id,
            wallet = %wallet.id(),
            external_id = %event.external_id,
            %gross, %fee, %net,
            "deposit settled"
        );

        if fee > Decimal::ZERO {
            self.route_fee_to_treasury(
                event,
                fee,
                format!("{}-fee-deposit", event.external_id),
                TransactionTag::PixInFee,
            );
        }

        self.notify(&user, TransferSide::PixIn, event, "SUCCESS", gross, fee, net);

        Ok(self.receipt(SettlementStatus::Applied, &wallet, gross, fee, net, Some(entry.id)))
    }

    /// Settles an outbound payment: debits the gross amount plus the fee,
    /// routes the fee to the treasury and dispatches the payout.
    ///
    /// A failed payout dispatch restores the balance with a compensating
    /// `-rollback` credit, then surfaces the gateway error.
    pub async fn apply_withdrawal(
        &self,
        event: &PaymentEvent,
    ) -> Result<SettlementReceipt, SettlementError> {
        let (user, gross) = self.validate(event)?;
        let wallet =
            self.ledger
                .get_or_create_wallet(event.user_id, event.currency.clone(), crate::base::WalletKind::User);

        if wallet.is_processed(&event.correlation_keys()) {
            return Ok(self.receipt(
                SettlementStatus::AlreadyProcessed,
                &wallet,
                gross,
                Decimal::ZERO,
                gross,
                None,
            ));
        }

        let fee = self.fee_for(event, TransferSide::PixOut, gross)?;
        let required = round_to_cents(gross + fee);
        let balance = wallet.balance();
        if balance < required {
            return Err(SettlementError::InsufficientBalance {
                balance,
                requested: gross,
                fee,
                required,
            });
        }

        let mut meta = event.base_meta(TransactionTag::PixWithdraw);
        meta.gross_amount = Some(gross);
        meta.fee_amount = Some(fee);
        meta.net_amount = Some(gross);

        let entry = match self.ledger.debit(
            wallet.id(),
            gross,
            Some("PIX withdrawal".to_string()),
            meta,
            event.external_id.clone(),
        ) {
            Ok(entry) => entry,
            Err(LedgerError::DuplicateEntry) => {
                return Ok(self.receipt(
                    SettlementStatus::AlreadyProcessed,
                    &wallet,
                    gross,
                    Decimal::ZERO,
                    gross,
                    None,
                ));
            }
            Err(LedgerError::InsufficientFunds { balance, requested }) => {
                return Err(SettlementError::InsufficientBalance {
                    balance,
                    requested,
                    fee,
                    required,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if fee > Decimal::ZERO {
            let mut fee_meta = event.base_meta(TransactionTag::PixOutFee);
            fee_meta.fee_amount = Some(fee);
            fee_meta.related_external_id = Some(event.external_id.clone());

            if let Err(err) = self.ledger.debit(
                wallet.id(),
                fee,
                Some("PIX withdrawal fee".to_string()),
                fee_meta,
                format!("{}-fee", event.external_id),
            ) {
                // Undo the already-committed gross debit before failing.
                self.rollback(&wallet.id(), gross, event);
                return Err(err.into());
            }

            self.route_fee_to_treasury(
                event,
                fee,
                format!("{}-fee-withdraw", event.external_id),
                TransactionTag::PixOutFee,
            );
        }

        if let Some(gateway) = &self.gateway {
            let request = PayoutRequest {
                user_id: event.user_id,
                amount: gross,
                currency: event.currency.clone(),
                external_id: event.external_id.clone(),
                mer_order_no: event.mer_order_no.clone(),
            };

            match gateway.dispatch(&request).await {
                Ok(receipt) => {
                    let mut extra = BTreeMap::new();
                    if let Some(order_no) = receipt.provider_order_no {
                        extra.insert("provider_order_no".to_string(), serde_json::json!(order_no));
                    }
                    if let Some(trade_no) = receipt.trade_no {
                        extra.insert("trade_no".to_string(), serde_json::json!(trade_no));
                    }
                    if !extra.is_empty()
                        && let Err(err) =
                            self.ledger.merge_meta(wallet.id(), &event.external_id, extra)
                    {
                        warn!(external_id = %event.external_id, error = %err, "payout refs not recorded");
                    }
                }
                Err(gateway_err) => {
                    warn!(
                        user = %event.user_id,
                        external_id = %event.external_id,
                        error = %gateway_err,
                        "payout dispatch failed, rolling back"
                    );
                    self.rollback(&wallet.id(), required, event);
                    self.notify(&user, TransferSide::PixOut, event, "FAILED", gross, fee, gross);
                    return Err(gateway_err.into());
                }
            }
        }

        info!(
            user = %event.user_id,
            wallet = %wallet.id(),
            external_id = %event.external_id,
            %gross, %fee,
            "withdrawal settled"
        );

        self.notify(&user, TransferSide::PixOut, event, "SUCCESS", gross, fee, gross);

        Ok(self.receipt(SettlementStatus::Applied, &wallet, gross, fee, gross, Some(entry.id)))
    }

    /// Manual administrative credit or debit against a user wallet.
    pub fn adjust_balance(
        &self,
        user_id: UserId,
        currency: Currency,
        direction: Direction,
        amount: Decimal,
        description: Option<String>,
        external_id: String,
    ) -> Result<LedgerEntry, SettlementError> {
        if !self.directory.contains(user_id) {
            return Err(SettlementError::UserNotFound(user_id));
        }
        let wallet =
            self.ledger
                .get_or_create_wallet(user_id, currency, crate::base::WalletKind::User);

        let meta = EntryMeta {
            transaction_type: Some(TransactionTag::Adjustment),
            ..EntryMeta::default()
        };

        let entry = match direction {
            Direction::Credit => {
                self.ledger
                    .credit(wallet.id(), amount, description, meta, external_id)?
            }
            Direction::Debit => {
                self.ledger
                    .debit(wallet.id(), amount, description, meta, external_id)?
            }
        };

        info!(
            user = %user_id,
            wallet = %wallet.id(),
            direction = %entry.direction,
            amount = %entry.amount,
            "balance adjusted"
        );
        Ok(entry)
    }

    /// Current balance of the user's wallet, creating it on first read.
    pub fn get_balance(&self, user_id: UserId, currency: Currency) -> Decimal {
        self.ledger
            .get_or_create_wallet(user_id, currency, crate::base::WalletKind::User)
            .balance()
    }

    /// Ledger entries of the user's wallet, newest first.
    pub fn get_ledger(
        &self,
        user_id: UserId,
        currency: Currency,
        filter: &LedgerFilter,
    ) -> Vec<LedgerEntry> {
        self.ledger
            .get_or_create_wallet(user_id, currency, crate::base::WalletKind::User)
            .entries(filter)
    }

    fn validate(&self, event: &PaymentEvent) -> Result<(UserRecord, Decimal), SettlementError> {
        let gross = round_to_cents(event.amount);
        if gross <= Decimal::ZERO {
            return Err(SettlementError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        if event.external_id.is_empty() {
            return Err(SettlementError::Validation(
                "missing external id".to_string(),
            ));
        }
        let user = self
            .directory
            .get(event.user_id)
            .ok_or(SettlementError::UserNotFound(event.user_id))?;
        Ok((user, gross))
    }

    fn fee_for(
        &self,
        event: &PaymentEvent,
        side: TransferSide,
        gross: Decimal,
    ) -> Result<Decimal, SettlementError> {
        let fee = match event.fee {
            Some(fee) => round_to_cents(fee),
            None => self.fees.fee_for(event.user_id, side, gross),
        };
        if fee < Decimal::ZERO {
            return Err(SettlementError::Validation(format!(
                "negative fee {fee}"
            )));
        }
        Ok(fee)
    }

    /// Credits the collected fee to the house wallet. Best-effort: a
    /// failure here never unwinds the already-settled user leg.
    fn route_fee_to_treasury(
        &self,
        event: &PaymentEvent,
        fee: Decimal,
        external_id: String,
        tag: TransactionTag,
    ) {
        let result = self
            .treasury
            .resolve(&self.directory, &self.ledger, &event.currency)
            .and_then(|house| {
                let mut meta = event.base_meta(tag);
                meta.fee_amount = Some(fee);
                meta.source_user = Some(event.user_id);
                meta.related_external_id = Some(event.external_id.clone());

                self.ledger
                    .credit(
                        house.id(),
                        fee,
                        Some("collected fee".to_string()),
                        meta,
                        external_id,
                    )
                    .map_err(SettlementError::from)
            });

        match result {
            Ok(entry) => info!(
                wallet = %entry.wallet_id,
                %fee,
                source_user = %event.user_id,
                "fee routed to treasury"
            ),
            // Already-routed fees are fine on replays of the fee leg.
            Err(SettlementError::Ledger(LedgerError::DuplicateEntry)) => {}
            Err(err) => warn!(
                source_user = %event.user_id,
                external_id = %event.external_id,
                error = %err,
                "fee leg failed, user leg kept"
            ),
        }
    }

    /// Compensating credit restoring `amount` after a partial failure.
    fn rollback(&self, wallet_id: &WalletId, amount: Decimal, event: &PaymentEvent) {
        let mut meta = event.base_meta(TransactionTag::Rollback);
        meta.related_external_id = Some(event.external_id.clone());

        if let Err(err) = self.ledger.credit(
            *wallet_id,
            amount,
            Some("withdrawal rollback".to_string()),
            meta,
            format!("{}-rollback", event.external_id),
        ) {
            warn!(
                wallet = %wallet_id,
                external_id = %event.external_id,
                error = %err,
                "rollback credit failed, wallet needs manual review"
            );
        }
    }

    /// Spawns the merchant notification; never blocks or fails the flow.
    fn notify(
        &self,
        user: &UserRecord,
        side: TransferSide,
        event: &PaymentEvent,
        status: &str,
        gross: Decimal,
        fee: Decimal,
        net: Decimal,
    ) {
        let Some(dispatcher) = &self.webhooks else {
            return;
        };

        // Deposits charge the fee inside the gross amount, withdrawals on top.
        let total = match side {
            TransferSide::PixIn => gross,
            TransferSide::PixOut => round_to_cents(gross + fee),
        };
        let payload = WebhookPayload {
            mer_order_no: event.mer_order_no.clone(),
            order_no: event.provider_order_no.clone(),
            trade_no: event.trade_no.clone(),
            net_amount: Some(net),
            fee_amount: Some(fee),
            total_amount: Some(total),
            external_id: Some(event.external_id.clone()),
            ..WebhookPayload::new(side, event.user_id, status, gross)
        };

        let dispatcher = Arc::clone(dispatcher);
        let user = user.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&user, side, &payload).await;
        });
    }

    fn receipt(
        &self,
        status: SettlementStatus,
        wallet: &crate::wallet::Wallet,
        gross: Decimal,
        fee: Decimal,
        net: Decimal,
        entry_id: Option<crate::base::EntryId>,
    ) -> SettlementReceipt {
        SettlementReceipt {
            status,
            wallet_id: wallet.id(),
            balance: wallet.balance(),
            gross,
            fee,
            net,
            entry_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeConfig;
    use rust_decimal_macros::dec;

    fn engine() -> SettlementEngine {
        let directory = Arc::new(UserDirectory::new());
        directory.upsert(UserRecord::new(UserId(1), "merchant"));
        directory.upsert(UserRecord::new(UserId(100), "house").treasury());

        SettlementEngine::new(
            Arc::new(LedgerStore::new()),
            Arc::new(FeeSchedule::new()),
            directory,
            Arc::new(TreasuryResolver::new(None)),
        )
    }

    #[tokio::test]
    async fn deposit_credits_net_and_routes_fee() {
        let engine = engine();
        engine
            .fees()
            .upsert(UserId(1), FeeConfig::percent(dec!(2), dec!(2)));

        let event = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
        let receipt = engine.apply_deposit(&event).await.unwrap();

        assert_eq!(receipt.status, SettlementStatus::Applied);
        assert_eq!(receipt.fee, dec!(2.00));
        assert_eq!(receipt.net, dec!(98.00));
        assert_eq!(receipt.balance, dec!(98.00));

        let house = engine
            .ledger()
            .find_wallet(UserId(100), &Currency::brl(), crate::base::WalletKind::House)
            .unwrap();
        assert_eq!(house.balance(), dec!(2.00));
    }

    #[tokio::test]
    async fn deposit_replay_is_a_no_op() {
        let engine = engine();
        let event = PaymentEvent::new(UserId(1), dec!(50.00), Currency::brl(), "dep-1");

        let first = engine.apply_deposit(&event).await.unwrap();
        let second = engine.apply_deposit(&event).await.unwrap();

        assert_eq!(first.status, SettlementStatus::Applied);
        assert_eq!(second.status, SettlementStatus::AlreadyProcessed);
        assert_eq!(second.balance, dec!(50.00));
    }

    #[tokio::test]
    async fn pending_status_is_ignored() {
        let engine = engine();
        let mut event = PaymentEvent::new(UserId(1), dec!(50.00), Currency::brl(), "dep-1");
        event.status = "PENDING".to_string();

        let receipt = engine.apply_deposit(&event).await.unwrap();
        assert_eq!(receipt.status, SettlementStatus::Ignored);
        assert_eq!(receipt.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn explicit_event_fee_overrides_schedule() {
        let engine = engine();
        engine
            .fees()
            .upsert(UserId(1), FeeConfig::percent(dec!(2), dec!(2)));

        let mut event = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
        event.fee = Some(dec!(5.00));

        let receipt = engine.apply_deposit(&event).await.unwrap();
        assert_eq!(receipt.fee, dec!(5.00));
        assert_eq!(receipt.net, dec!(95.00));
    }

    #[tokio::test]
    async fn withdrawal_needs_amount_plus_fee() {
        let engine = engine();
        engine
            .fees()
            .upsert(UserId(1), FeeConfig::fixed(dec!(0), dec!(3.00)));

        let deposit = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
        engine.apply_deposit(&deposit).await.unwrap();

        let withdrawal = PaymentEvent::new(UserId(1), dec!(99.00), Currency::brl(), "wd-1");
        let err = engine.apply_withdrawal(&withdrawal).await.unwrap_err();
        assert_eq!(
            err,
            SettlementError::InsufficientBalance {
                balance: dec!(100.00),
                requested: dec!(99.00),
                fee: dec!(3.00),
                required: dec!(102.00),
            }
        );
    }

    #[tokio::test]
    async fn withdrawal_writes_separate_fee_entry() {
        let engine = engine();
        engine
            .fees()
            .upsert(UserId(1), FeeConfig::fixed(dec!(0), dec!(3.00)));

        let deposit = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
        engine.apply_deposit(&deposit).await.unwrap();

        let withdrawal = PaymentEvent::new(UserId(1), dec!(40.00), Currency::brl(), "wd-1");
        let receipt = engine.apply_withdrawal(&withdrawal).await.unwrap();
        assert_eq!(receipt.balance, dec!(57.00));

        let entries = engine.get_ledger(UserId(1), Currency::brl(), &LedgerFilter::default());
        let fee_entry = entries.iter().find(|e| e.external_id == "wd-1-fee").unwrap();
        assert_eq!(fee_entry.amount, dec!(3.00));
        assert_eq!(fee_entry.direction, Direction::Debit);
        assert_eq!(
            fee_entry.meta.transaction_type,
            Some(TransactionTag::PixOutFee)
        );
    }

    struct RejectingGateway;

    #[async_trait]
    impl PayoutGateway for RejectingGateway {
        async fn dispatch(&self, _request: &PayoutRequest) -> Result<PayoutReceipt, GatewayError> {
            Err(GatewayError::Rejected {
                code: "E42".to_string(),
                message: "account blocked".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn failed_payout_restores_the_balance() {
        let engine = engine().with_gateway(Arc::new(RejectingGateway));

        let deposit = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
        engine.apply_deposit(&deposit).await.unwrap();

        let withdrawal = PaymentEvent::new(UserId(1), dec!(40.00), Currency::brl(), "wd-1");
        let err = engine.apply_withdrawal(&withdrawal).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Gateway(GatewayError::Rejected { .. })
        ));

        assert_eq!(engine.get_balance(UserId(1), Currency::brl()), dec!(100.00));

        let entries = engine.get_ledger(UserId(1), Currency::brl(), &LedgerFilter::default());
        let rollback = entries
            .iter()
            .find(|e| e.external_id == "wd-1-rollback")
            .unwrap();
        assert_eq!(rollback.direction, Direction::Credit);
        assert_eq!(
            rollback.meta.related_external_id.as_deref(),
            Some("wd-1")
        );
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let engine = engine();
        let event = PaymentEvent::new(UserId(99), dec!(10.00), Currency::brl(), "dep-1");
        assert_eq!(
            engine.apply_deposit(&event).await.unwrap_err(),
            SettlementError::UserNotFound(UserId(99))
        );
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let engine = engine();
        let event = PaymentEvent::new(UserId(1), dec!(0), Currency::brl(), "dep-1");
        assert!(matches!(
            engine.apply_deposit(&event).await.unwrap_err(),
            SettlementError::Validation(_)
        ));
    }

    #[test]
    fn adjustment_moves_the_balance() {
        let engine = engine();
        engine
            .adjust_balance(
                UserId(1),
                Currency::brl(),
                Direction::Credit,
                dec!(25.00),
                Some("signup bonus".to_string()),
                "adj-1".to_string(),
            )
            .unwrap();
        assert_eq!(engine.get_balance(UserId(1), Currency::brl()), dec!(25.00));
    }

    #[test]
    fn correlation_probe_covers_provider_refs() {
        let engine = engine();
        let mut event = PaymentEvent::new(UserId(1), dec!(10.00), Currency::brl(), "dep-1");
        event.trade_no = Some("e2e-abc".to_string());

        let keys = event.correlation_keys();
        assert_eq!(keys.external_id.as_deref(), Some("dep-1"));
        assert_eq!(keys.trade_no.as_deref(), Some("e2e-abc"));
    }
}
