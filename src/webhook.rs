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

//! Outbound webhook delivery with a persisted, re-triggerable log.
//!
//! Delivery is a side effect of settlement, never a precondition: a
//! failed or skipped notification never propagates to the settlement
//! caller. Each HTTP attempt (initial or retry) is recorded in the
//! [`DeliveryLog`] before the dispatcher returns, so the delivery
//! history is complete even if the surrounding request dies. Retries are
//! linked rows referencing the first attempt of the same logical event.

use crate::base::{TransferSide, UserId};
use crate::directory::UserRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identifier of a delivery-log row.
pub type DeliveryId = u64;

/// Outcome state of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// The notification body sent to merchants.
///
/// Field names follow the wire contract merchants already integrate
/// against, hence the camelCase renames.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub mer_order_no: Option<String>,
    pub order_no: Option<String>,
    pub trade_no: Option<String>,
    pub status: String,
    pub amount: Decimal,
    pub user_id: UserId,
    /// `DEPOSIT` or `WITHDRAW`.
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub net_amount: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl WebhookPayload {
    pub fn new(side: TransferSide, user_id: UserId, status: impl Into<String>, amount: Decimal) -> Self {
        Self {
            mer_order_no: None,
            order_no: None,
            trade_no: None,
            status: status.into(),
            amount,
            user_id,
            kind: match side {
                TransferSide::PixIn => "DEPOSIT".to_string(),
                TransferSide::PixOut => "WITHDRAW".to_string(),
            },
            timestamp: Utc::now(),
            net_amount: None,
            fee_amount: None,
            total_amount: None,
            external_id: None,
        }
    }

    /// Best transaction reference for the delivery log: provider order,
    /// then trade, then merchant order.
    fn transaction_ref(&self) -> Option<String> {
        self.order_no
            .clone()
            .or_else(|| self.trade_no.clone())
            .or_else(|| self.mer_order_no.clone())
    }
}

/// One row of the delivery log: a single HTTP attempt.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    /// First attempt of the same logical event, set on retry rows.
    pub parent_id: Option<DeliveryId>,
    pub event_type: String,
    pub transaction_ref: Option<String>,
    pub target_url: String,
    pub status: DeliveryStatus,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub payload: serde_json::Value,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Operator-facing search filter over the delivery log.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub status: Option<DeliveryStatus>,
    /// Substring match on the target URL.
    pub url: Option<String>,
    pub transaction_ref: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DeliveryQuery {
    const DEFAULT_LIMIT: usize = 10;
    const MAX_LIMIT: usize = 100;

    fn matches(&self, record: &DeliveryRecord) -> bool {
        if let Some(from) = self.from
            && record.created_at < from
        {
            return false;
        }
        if let Some(to) = self.to
            && record.created_at > to
        {
            return false;
        }
        if let Some(event_type) = &self.event_type
            && &record.event_type != event_type
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(url) = &self.url
            && !record.target_url.contains(url.as_str())
        {
            return false;
        }
        if let Some(transaction_ref) = &self.transaction_ref
            && record.transaction_ref.as_ref() != Some(transaction_ref)
        {
            return false;
        }
        true
    }
}

/// Search result page plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPage {
    pub rows: Vec<DeliveryRecord>,
    pub total: usize,
}

/// Append-only log of delivery attempts.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    rows: RwLock<Vec<DeliveryRecord>>,
    next_id: AtomicU64,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, mut record: DeliveryRecord) -> DeliveryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        record.id = id;
        self.rows.write().push(record);
        id
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn find_by_ids(&self, ids: &[DeliveryId]) -> Vec<DeliveryRecord> {
        let rows = self.rows.read();
        rows.iter().filter(|r| ids.contains(&r.id)).cloned().collect()
    }

    /// Newest first, filtered and paginated.
    pub fn search(&self, query: &DeliveryQuery) -> DeliveryPage {
        let rows = self.rows.read();
        let matches: Vec<&DeliveryRecord> =
            rows.iter().rev().filter(|r| query.matches(r)).collect();
        let total = matches.len();

        let offset = query.offset.unwrap_or(0);
        let limit = query
            .limit
            .unwrap_or(DeliveryQuery::DEFAULT_LIMIT)
            .min(DeliveryQuery::MAX_LIMIT);

        DeliveryPage {
            rows: matches.into_iter().skip(offset).take(limit).cloned().collect(),
            total,
        }
    }
}

/// Result of one delivery request (after retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The merchant has no webhook URL configured; nothing attempted.
    Skipped,
    Delivered {
        http_status: u16,
        latency_ms: u64,
    },
    /// All attempts exhausted.
    Failed { attempts: u32, error: String },
}

/// Outcome summary of an operator-initiated resend batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResendReport {
    pub requeued: usize,
    pub delivered: usize,
}

/// Delivery tuning knobs.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Delivers outcome notifications to merchant-configured endpoints.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    log: std::sync::Arc<DeliveryLog>,
    config: WebhookConfig,
}

struct AttemptResult {
    status: DeliveryStatus,
    http_status: Option<u16>,
    latency_ms: u64,
    response_body: Option<String>,
    error: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(log: std::sync::Arc<DeliveryLog>, config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pix-ledger-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, log, config })
    }

    pub fn log(&self) -> &std::sync::Arc<DeliveryLog> {
        &self.log
    }

    fn event_type(side: TransferSide) -> &'static str {
        match side {
            TransferSide::PixIn => "PIX_DEPOSIT_WEBHOOK",
            TransferSide::PixOut => "PIX_WITHDRAW_WEBHOOK",
        }
    }

    /// Delivers `payload` to the merchant's configured endpoint for the
    /// transfer direction. One attempt plus up to `max_retries` retries
    /// with a fixed delay; every attempt is logged before return.
    pub async fn deliver(
        &self,
        merchant: &UserRecord,
        side: TransferSide,
        payload: &WebhookPayload,
    ) -> DeliveryOutcome {
        let Some(target_url) = merchant.webhook_target(side) else {
            debug!(user = %merchant.id, "no webhook URL configured, skipping notification");
            return DeliveryOutcome::Skipped;
        };
        let target_url = target_url.to_string();

        let event_type = Self::event_type(side).to_string();
        let transaction_ref = payload.transaction_ref();
        let body = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(user = %merchant.id, error = %err, "webhook payload failed to serialize");
                return DeliveryOutcome::Failed {
                    attempts: 0,
                    error: err.to_string(),
                };
            }
        };

        let mut parent_id = None;
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let result = self.attempt(&target_url, &body).await;
            let row_id = self.log.insert(DeliveryRecord {
                id: 0,
                parent_id,
                event_type: event_type.clone(),
                transaction_ref: transaction_ref.clone(),
                target_url: target_url.clone(),
                status: result.status,
                http_status: result.http_status,
                latency_ms: Some(result.latency_ms),
                payload: body.clone(),
                response_body: result.response_body.clone(),
                error: result.error.clone(),
                created_at: Utc::now(),
            });
            parent_id.get_or_insert(row_id);

            match result.status {
                DeliveryStatus::Delivered => {
                    debug!(
                        user = %merchant.id,
                        url = %target_url,
                        http_status = result.http_status,
                        latency_ms = result.latency_ms,
                        "webhook delivered"
                    );
                    return DeliveryOutcome::Delivered {
                        http_status: result.http_status.unwrap_or_default(),
                        latency_ms: result.latency_ms,
                    };
                }
                _ => {
                    last_error = result
                        .error
                        .or(result.http_status.map(|s| format!("HTTP {s}")))
                        .unwrap_or_else(|| "request failed".to_string());
                    warn!(
                        user = %merchant.id,
                        url = %target_url,
                        attempt,
                        error = %last_error,
                        "webhook attempt failed"
                    );
                }
            }
        }

        DeliveryOutcome::Failed {
            attempts: self.config.max_retries + 1,
            error: last_error,
        }
    }

    /// Re-issues the original payload of each referenced log row to its
    /// original target, appending one linked row per resend.
    pub async fn resend(&self, ids: &[DeliveryId]) -> ResendReport {
        let rows = self.log.find_by_ids(ids);
        let requeued = rows.len();
        let mut delivered = 0;

        for row in rows {
            let result = self.attempt(&row.target_url, &row.payload).await;
            if result.status == DeliveryStatus::Delivered {
                delivered += 1;
            }
            self.log.insert(DeliveryRecord {
                id: 0,
                parent_id: Some(row.parent_id.unwrap_or(row.id)),
                event_type: row.event_type.clone(),
                transaction_ref: row.transaction_ref.clone(),
                target_url: row.target_url.clone(),
                status: result.status,
                http_status: result.http_status,
                latency_ms: Some(result.latency_ms),
                payload: row.payload.clone(),
                response_body: result.response_body,
                error: result.error,
                created_at: Utc::now(),
            });
        }

        ResendReport { requeued, delivered }
    }

    async fn attempt(&self, url: &str, body: &serde_json::Value) -> AttemptResult {
        let start = Instant::now();
        match self.client.post(url).json(body).send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let http_status = response.status().as_u16();
                let success = response.status().is_success();
                let response_body = response.text().await.ok();
                AttemptResult {
                    status: if success {
                        DeliveryStatus::Delivered
                    } else {
                        DeliveryStatus::Failed
                    },
                    http_status: Some(http_status),
                    latency_ms,
                    response_body,
                    error: if success {
                        None
                    } else {
                        Some(format!("non-success status {http_status}"))
                    },
                }
            }
            Err(err) => AttemptResult {
                status: DeliveryStatus::Failed,
                http_status: err.status().map(|s| s.as_u16()),
                latency_ms: start.elapsed().as_millis() as u64,
                response_body: None,
                error: Some(if err.is_timeout() {
                    format!("timeout after {:?}", self.config.timeout)
                } else {
                    err.to_string()
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id_hint: &str, status: DeliveryStatus, event_type: &str) -> DeliveryRecord {
        DeliveryRecord {
            id: 0,
            parent_id: None,
            event_type: event_type.to_string(),
            transaction_ref: Some(id_hint.to_string()),
            target_url: format!("https://merchant.test/{id_hint}"),
            status,
            http_status: None,
            latency_ms: None,
            payload: serde_json::json!({}),
            response_body: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn log_ids_are_sequential() {
        let log = DeliveryLog::new();
        let first = log.insert(record("a", DeliveryStatus::Pending, "PIX_DEPOSIT_WEBHOOK"));
        let second = log.insert(record("b", DeliveryStatus::Pending, "PIX_DEPOSIT_WEBHOOK"));
        assert_eq!(second, first + 1);
    }

    #[test]
    fn search_filters_by_status_and_event_type() {
        let log = DeliveryLog::new();
        log.insert(record("a", DeliveryStatus::Delivered, "PIX_DEPOSIT_WEBHOOK"));
        log.insert(record("b", DeliveryStatus::Failed, "PIX_DEPOSIT_WEBHOOK"));
        log.insert(record("c", DeliveryStatus::Failed, "PIX_WITHDRAW_WEBHOOK"));

        let page = log.search(&DeliveryQuery {
            status: Some(DeliveryStatus::Failed),
            event_type: Some("PIX_DEPOSIT_WEBHOOK".to_string()),
            ..DeliveryQuery::default()
        });
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].transaction_ref.as_deref(), Some("b"));
    }

    #[test]
    fn search_is_newest_first_and_paginated() {
        let log = DeliveryLog::new();
        for i in 0..5 {
            log.insert(record(&format!("t{i}"), DeliveryStatus::Delivered, "E"));
        }

        let page = log.search(&DeliveryQuery {
            limit: Some(2),
            offset: Some(1),
            ..DeliveryQuery::default()
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].transaction_ref.as_deref(), Some("t3"));
        assert_eq!(page.rows[1].transaction_ref.as_deref(), Some("t2"));
    }

    #[test]
    fn search_matches_url_substring() {
        let log = DeliveryLog::new();
        log.insert(record("a", DeliveryStatus::Delivered, "E"));
        let page = log.search(&DeliveryQuery {
            url: Some("merchant.test/a".to_string()),
            ..DeliveryQuery::default()
        });
        assert_eq!(page.total, 1);
    }

    #[test]
    fn payload_serializes_with_wire_names() {
        let payload = WebhookPayload {
            mer_order_no: Some("m-1".to_string()),
            external_id: Some("x-1".to_string()),
            ..WebhookPayload::new(
                TransferSide::PixIn,
                UserId(7),
                "SUCCESS",
                rust_decimal_macros::dec!(100.00),
            )
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["merOrderNo"], "m-1");
        assert_eq!(json["type"], "DEPOSIT");
        assert_eq!(json["userId"], 7);
        assert_eq!(json["externalId"], "x-1");
    }

    #[test]
    fn event_type_follows_transfer_side() {
        assert_eq!(
            WebhookDispatcher::event_type(TransferSide::PixIn),
            "PIX_DEPOSIT_WEBHOOK"
        );
        assert_eq!(
            WebhookDispatcher::event_type(TransferSide::PixOut),
            "PIX_WITHDRAW_WEBHOOK"
        );
    }
}
