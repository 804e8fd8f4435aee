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

//! Integration tests for webhook delivery against real HTTP endpoints.
//!
//! A small axum server stands in for the merchant; the tests verify the
//! retry schedule, the persisted delivery log, resend linkage and the
//! fire-and-forget coupling with the settlement engine.

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use pix_ledger_rs::{
    Currency, DeliveryOutcome, DeliveryQuery, DeliveryStatus, FeeSchedule, LedgerStore,
    PaymentEvent, SettlementEngine, SettlementStatus, TransferSide, TreasuryResolver,
    UserDirectory, UserId,
    UserRecord, WebhookConfig, WebhookDispatcher, WebhookPayload,
};
use pix_ledger_rs::webhook::DeliveryLog;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

// === Merchant stand-in server ===

#[derive(Clone)]
struct MerchantState {
    hits: Arc<AtomicU32>,
    /// Number of requests to reject before accepting.
    fail_first: u32,
    last_body: Arc<parking_lot::Mutex<Option<serde_json::Value>>>,
}

async fn receive(
    State(state): State<MerchantState>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_body.lock() = Some(body);
    if hit < state.fail_first {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// Spawns a merchant endpoint; returns its URL and shared state.
async fn spawn_merchant(fail_first: u32) -> (String, MerchantState) {
    let state = MerchantState {
        hits: Arc::new(AtomicU32::new(0)),
        fail_first,
        last_body: Arc::new(parking_lot::Mutex::new(None)),
    };

    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/hook"), state)
}

fn dispatcher() -> WebhookDispatcher {
    WebhookDispatcher::new(
        Arc::new(DeliveryLog::new()),
        WebhookConfig {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        },
    )
    .unwrap()
}

fn payload() -> WebhookPayload {
    WebhookPayload {
        mer_order_no: Some("order-1".to_string()),
        ..WebhookPayload::new(TransferSide::PixIn, UserId(1), "SUCCESS", dec!(100.00))
    }
}

// === Delivery ===

#[tokio::test]
async fn first_attempt_success_logs_one_row() {
    let (url, state) = spawn_merchant(0).await;
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme").with_webhook_url(&url);

    let outcome = dispatcher
        .deliver(&merchant, TransferSide::PixIn, &payload())
        .await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Delivered { http_status: 200, .. }
    ));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.log().len(), 1);

    let page = dispatcher.log().search(&DeliveryQuery::default());
    let row = &page.rows[0];
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.http_status, Some(200));
    assert_eq!(row.event_type, "PIX_DEPOSIT_WEBHOOK");
    assert_eq!(row.transaction_ref.as_deref(), Some("order-1"));
    assert!(row.parent_id.is_none());
    assert!(row.latency_ms.is_some());
}

#[tokio::test]
async fn retries_until_the_merchant_accepts() {
    // Fail twice, succeed on the third attempt.
    let (url, state) = spawn_merchant(2).await;
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme").with_webhook_url(&url);

    let outcome = dispatcher
        .deliver(&merchant, TransferSide::PixIn, &payload())
        .await;

    assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);

    // Three rows: the failed initial attempt plus two linked retries.
    let rows = dispatcher.log().search(&DeliveryQuery::default()).rows;
    assert_eq!(rows.len(), 3);
    let first_id = rows.iter().map(|r| r.id).min().unwrap();
    for row in &rows {
        if row.id == first_id {
            assert!(row.parent_id.is_none());
            assert_eq!(row.status, DeliveryStatus::Failed);
        } else {
            assert_eq!(row.parent_id, Some(first_id));
        }
    }
    assert_eq!(
        rows.iter()
            .filter(|r| r.status == DeliveryStatus::Delivered)
            .count(),
        1
    );
}

#[tokio::test]
async fn exhausted_retries_report_failure() {
    let (url, state) = spawn_merchant(u32::MAX).await;
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme").with_webhook_url(&url);

    let outcome = dispatcher
        .deliver(&merchant, TransferSide::PixIn, &payload())
        .await;

    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    match outcome {
        DeliveryOutcome::Failed { attempts, error } => {
            assert_eq!(attempts, 3);
            assert!(error.contains("500"), "error was: {error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Every attempt is on record.
    let failed = dispatcher.log().search(&DeliveryQuery {
        status: Some(DeliveryStatus::Failed),
        ..DeliveryQuery::default()
    });
    assert_eq!(failed.total, 3);
}

#[tokio::test]
async fn no_configured_url_means_skipped() {
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme");

    let outcome = dispatcher
        .deliver(&merchant, TransferSide::PixIn, &payload())
        .await;

    assert_eq!(outcome, DeliveryOutcome::Skipped);
    assert!(dispatcher.log().is_empty());
}

#[tokio::test]
async fn direction_specific_url_wins() {
    let (generic_url, generic) = spawn_merchant(0).await;
    let (pix_out_url, pix_out) = spawn_merchant(0).await;
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme")
        .with_webhook_url(&generic_url)
        .with_webhook_url_pix_out(&pix_out_url);

    let payload = WebhookPayload::new(TransferSide::PixOut, UserId(1), "SUCCESS", dec!(10.00));
    dispatcher
        .deliver(&merchant, TransferSide::PixOut, &payload)
        .await;

    assert_eq!(pix_out.hits.load(Ordering::SeqCst), 1);
    assert_eq!(generic.hits.load(Ordering::SeqCst), 0);

    let rows = dispatcher.log().search(&DeliveryQuery::default()).rows;
    assert_eq!(rows[0].event_type, "PIX_WITHDRAW_WEBHOOK");
}

// === Resend ===

#[tokio::test]
async fn resend_appends_linked_rows() {
    let (url, state) = spawn_merchant(u32::MAX).await;
    let dispatcher = dispatcher();
    let merchant = UserRecord::new(UserId(1), "acme").with_webhook_url(&url);

    dispatcher
        .deliver(&merchant, TransferSide::PixIn, &payload())
        .await;
    let before = dispatcher.log().len();
    let failed_ids: Vec<_> = dispatcher
        .log()
        .search(&DeliveryQuery::default())
        .rows
        .iter()
        .filter(|r| r.parent_id.is_none())
        .map(|r| r.id)
        .collect();

    // The merchant has recovered by the time the operator resends.
    state.hits.store(u32::MAX, Ordering::SeqCst);

    let report = dispatcher.resend(&failed_ids).await;
    assert_eq!(report.requeued, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(dispatcher.log().len(), before + 1);

    let rows = dispatcher.log().search(&DeliveryQuery::default()).rows;
    let resent = &rows[0];
    assert_eq!(resent.status, DeliveryStatus::Delivered);
    assert_eq!(resent.parent_id, Some(failed_ids[0]));
}

#[tokio::test]
async fn resend_of_unknown_ids_is_a_no_op() {
    let dispatcher = dispatcher();
    let report = dispatcher.resend(&[404, 405]).await;
    assert_eq!(report.requeued, 0);
    assert_eq!(report.delivered, 0);
    assert!(dispatcher.log().is_empty());
}

// === Engine coupling ===

#[tokio::test]
async fn settled_deposit_notifies_the_merchant() {
    let (url, state) = spawn_merchant(0).await;

    let directory = Arc::new(UserDirectory::new());
    directory.upsert(
        UserRecord::new(UserId(1), "acme").with_webhook_url_pix_in(&url),
    );
    directory.upsert(UserRecord::new(UserId(100), "house").treasury());

    let dispatcher = Arc::new(dispatcher());
    let engine = SettlementEngine::new(
        Arc::new(LedgerStore::new()),
        Arc::new(FeeSchedule::new()),
        directory,
        Arc::new(TreasuryResolver::new(None)),
    )
    .with_webhooks(Arc::clone(&dispatcher));

    let mut event = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-1");
    event.mer_order_no = Some("order-9".to_string());
    engine.apply_deposit(&event).await.unwrap();

    // Delivery is fire-and-forget; poll until the merchant saw it.
    for _ in 0..100 {
        if state.hits.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    let body = state.last_body.lock().clone().unwrap();
    assert_eq!(body["merOrderNo"], "order-9");
    assert_eq!(body["type"], "DEPOSIT");
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(body["userId"], 1);
    assert_eq!(body["externalId"], "dep-1");
    assert_eq!(body["netAmount"], "100.00");

    // And the attempt is in the log.
    assert_eq!(dispatcher.log().len(), 1);
}

#[tokio::test]
async fn unreachable_merchant_never_blocks_settlement() {
    // Bind and immediately drop a listener so the URL points at a dead port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hooks/pix", listener.local_addr().unwrap());
    drop(listener);

    let directory = Arc::new(UserDirectory::new());
    directory.upsert(UserRecord::new(UserId(1), "acme").with_webhook_url_pix_in(&url));
    directory.upsert(UserRecord::new(UserId(100), "house").treasury());

    let dispatcher = Arc::new(dispatcher());
    let engine = SettlementEngine::new(
        Arc::new(LedgerStore::new()),
        Arc::new(FeeSchedule::new()),
        directory,
        Arc::new(TreasuryResolver::new(None)),
    )
    .with_webhooks(Arc::clone(&dispatcher));

    let event = PaymentEvent::new(UserId(1), dec!(100.00), Currency::brl(), "dep-down-1");
    let receipt = engine.apply_deposit(&event).await.unwrap();

    // Settlement committed before any delivery attempt resolved.
    assert_eq!(receipt.status, SettlementStatus::Applied);
    assert_eq!(receipt.balance, dec!(100.00));
    assert_eq!(engine.get_balance(UserId(1), Currency::brl()), dec!(100.00));

    // All three attempts end up on record as failures.
    for _ in 0..100 {
        if dispatcher.log().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let page = dispatcher.log().search(&DeliveryQuery::default());
    assert_eq!(page.total, 3);
    let first_id = page.rows.iter().map(|row| row.id).min().unwrap();
    for row in &page.rows {
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert!(row.error.is_some());
        if row.id == first_id {
            assert!(row.parent_id.is_none());
        } else {
            assert_eq!(row.parent_id, Some(first_id));
        }
    }
}
