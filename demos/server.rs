//! Simple REST API facade for the settlement engine.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /deposits` - Settle a confirmed inbound payment
//! - `POST /withdrawals` - Settle an outbound payment
//! - `POST /adjustments` - Manual balance adjustment
//! - `GET /wallets/:user/balance` - Current balance for a user
//! - `GET /wallets/:user/ledger` - Ledger entries for a user, newest first
//! - `GET /webhooks/logs` - Search the webhook delivery log
//! - `POST /webhooks/resend` - Re-trigger logged deliveries by id
//!
//! ## Example Usage
//!
//! ```bash
//! # Deposit
//! curl -X POST http://localhost:3000/deposits \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": 1, "amount": "100.00", "currency": "BRL", "status": "SUCCESS", "external_id": "dep-1", "mer_order_no": null, "provider_order_no": null, "trade_no": null, "provider": null, "fee": null}'
//!
//! # Withdrawal
//! curl -X POST http://localhost:3000/withdrawals \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": 1, "amount": "25.00", "currency": "BRL", "status": "SUCCESS", "external_id": "wd-1", "mer_order_no": null, "provider_order_no": null, "trade_no": null, "provider": null, "fee": null}'
//!
//! # Balance
//! curl http://localhost:3000/wallets/1/balance
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use pix_ledger_rs::{
    Currency, Direction, FeeConfig, FeeSchedule, GatewayError, LedgerEntry, LedgerError,
    LedgerFilter, LedgerStore, PaymentEvent, SettlementEngine, SettlementError,
    SettlementReceipt, TreasuryResolver, UserDirectory, UserId, UserRecord,
    webhook::{DeliveryId, DeliveryLog, DeliveryPage, DeliveryQuery},
    ResendReport, WebhookConfig, WebhookDispatcher,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

/// Request body for a manual balance adjustment.
#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub user_id: u64,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub external_id: String,
}

/// Request body for re-triggering webhook deliveries.
#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    pub ids: Vec<DeliveryId>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: u64,
    pub currency: String,
    pub balance: Decimal,
}

/// Response body for errors: `{ok: false, error: <kind>, message}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub message: String,
}

// === Application State ===

/// Shared application state containing the settlement engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub webhooks: Arc<WebhookDispatcher>,
}

// === Error Handling ===

/// Wrapper converting `SettlementError` into HTTP responses.
pub struct AppError(SettlementError);

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
            SettlementError::UserNotFound(_) => StatusCode::NOT_FOUND,
            SettlementError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SettlementError::HouseUserNotConfigured
            | SettlementError::InvalidHouseWalletType { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SettlementError::Ledger(LedgerError::DuplicateEntry) => StatusCode::CONFLICT,
            SettlementError::Ledger(LedgerError::InsufficientFunds { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SettlementError::Ledger(LedgerError::WalletNotFound(_))
            | SettlementError::Ledger(LedgerError::EntryNotFound(_)) => StatusCode::NOT_FOUND,
            SettlementError::Ledger(_) => StatusCode::BAD_REQUEST,
            SettlementError::Gateway(GatewayError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            SettlementError::Gateway(_) => StatusCode::BAD_GATEWAY,
        };

        (
            status,
            Json(ErrorResponse {
                ok: false,
                error: self.0.kind().to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /deposits - Settle a confirmed inbound payment.
async fn create_deposit(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> Result<(StatusCode, Json<SettlementReceipt>), AppError> {
    let receipt = state.engine.apply_deposit(&event).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// POST /withdrawals - Settle an outbound payment.
async fn create_withdrawal(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> Result<(StatusCode, Json<SettlementReceipt>), AppError> {
    let receipt = state.engine.apply_withdrawal(&event).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// POST /adjustments - Manual administrative credit or debit.
async fn create_adjustment(
    State(state): State<AppState>,
    Json(request): Json<AdjustmentRequest>,
) -> Result<(StatusCode, Json<LedgerEntry>), AppError> {
    let entry = state.engine.adjust_balance(
        UserId(request.user_id),
        Currency::new(&request.currency),
        request.direction,
        request.amount,
        request.description,
        request.external_id,
    )?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct CurrencyParam {
    currency: Option<String>,
}

/// GET /wallets/:user/balance - Current balance for a user.
async fn get_balance(
    State(state): State<AppState>,
    Path(user): Path<u64>,
    Query(params): Query<CurrencyParam>,
) -> Json<BalanceResponse> {
    let currency = params
        .currency
        .map(|c| Currency::new(&c))
        .unwrap_or_else(Currency::brl);
    let balance = state.engine.get_balance(UserId(user), currency.clone());
    Json(BalanceResponse {
        user_id: user,
        currency: currency.as_str().to_string(),
        balance,
    })
}

#[derive(Debug, Deserialize)]
struct LedgerParams {
    currency: Option<String>,
    limit: Option<usize>,
}

/// GET /wallets/:user/ledger - Ledger entries, newest first.
async fn get_ledger(
    State(state): State<AppState>,
    Path(user): Path<u64>,
    Query(params): Query<LedgerParams>,
) -> Json<Vec<LedgerEntry>> {
    let currency = params
        .currency
        .map(|c| Currency::new(&c))
        .unwrap_or_else(Currency::brl);
    let filter = LedgerFilter {
        limit: params.limit,
        ..LedgerFilter::default()
    };
    Json(state.engine.get_ledger(UserId(user), currency, &filter))
}

/// GET /webhooks/logs - Search the delivery log.
async fn search_webhook_logs(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
) -> Json<DeliveryPage> {
    Json(state.webhooks.log().search(&query))
}

/// POST /webhooks/resend - Re-trigger logged deliveries.
async fn resend_webhooks(
    State(state): State<AppState>,
    Json(request): Json<ResendRequest>,
) -> Json<ResendReport> {
    Json(state.webhooks.resend(&request.ids).await)
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/deposits", post(create_deposit))
        .route("/withdrawals", post(create_withdrawal))
        .route("/adjustments", post(create_adjustment))
        .route("/wallets/{user}/balance", get(get_balance))
        .route("/wallets/{user}/ledger", get(get_ledger))
        .route("/webhooks/logs", get(search_webhook_logs))
        .route("/webhooks/resend", post(resend_webhooks))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Demo fixture: two merchants with a 2% fee and a treasury user.
    let directory = Arc::new(UserDirectory::new());
    directory.upsert(UserRecord::new(UserId(1), "alpha"));
    directory.upsert(UserRecord::new(UserId(2), "bravo"));
    directory.upsert(UserRecord::new(UserId(100), "treasury").treasury());

    let fees = Arc::new(FeeSchedule::new());
    fees.upsert(UserId(1), FeeConfig::percent(dec!(2), dec!(2)));
    fees.upsert(UserId(2), FeeConfig::percent(dec!(2), dec!(2)));

    let webhooks = Arc::new(
        WebhookDispatcher::new(Arc::new(DeliveryLog::new()), WebhookConfig::default())
            .expect("http client"),
    );

    let engine = SettlementEngine::new(
        Arc::new(LedgerStore::new()),
        fees,
        directory,
        Arc::new(TreasuryResolver::new(None)),
    )
    .with_webhooks(Arc::clone(&webhooks));

    let state = AppState {
        engine: Arc::new(engine),
        webhooks,
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("PIX ledger API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /deposits               - Settle an inbound payment");
    println!("  POST /withdrawals            - Settle an outbound payment");
    println!("  POST /adjustments            - Manual balance adjustment");
    println!("  GET  /wallets/:user/balance  - Wallet balance");
    println!("  GET  /wallets/:user/ledger   - Wallet ledger entries");
    println!("  GET  /webhooks/logs          - Webhook delivery log");
    println!("  POST /webhooks/resend        - Re-trigger deliveries");

    axum::serve(listener, app).await.unwrap();
}
