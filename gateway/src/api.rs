//! # REST API
//!
//! Builds the axum router exposing the settlement engine's operation
//! contracts. All handlers share state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                         | Description                      |
//! |--------|------------------------------|----------------------------------|
//! | GET    | `/health`                    | Liveness probe                   |
//! | GET    | `/status`                    | Gateway + engine status summary  |
//! | POST   | `/deposits`                  | Initiate a fiat deposit          |
//! | POST   | `/deposits/:id/confirm`      | Confirm a paid deposit           |
//! | POST   | `/withdrawals`               | Initiate a crypto withdrawal     |
//! | POST   | `/transfers`                 | Internal transfer                |
//! | POST   | `/staking`                   | Open a staking position          |
//! | POST   | `/staking/:id/unstake`       | Close a position                 |
//! | POST   | `/staking/:id/claim`         | Claim accrued rewards            |
//! | GET    | `/wallets/:user_id`          | Wallet balances                  |
//! | GET    | `/wallets/:user_id/history`  | Recent transactions              |
//! | GET    | `/transactions/:id`          | Transaction status               |
//! | POST   | `/admin/rates`               | Update fee/rate configuration    |
//! | POST   | `/admin/accounts`            | Add a receiving bank account     |
//! | PATCH  | `/admin/accounts/:id`        | Update account status/priority   |
//! | DELETE | `/admin/accounts/:id`        | Remove a receiving account       |
//! | POST   | `/admin/daily-reset`         | Zero daily deposit totals        |
//! | POST   | `/admin/sweep`               | Sweep stale pending transactions |
//!
//! The admin routes sit behind the trusted-caller boundary (deployment
//! network policy); the gateway itself does no authentication.
//!
//! ## Error Mapping
//!
//! Engine errors map onto HTTP statuses; `Internal` errors are logged
//! with full context and returned as an opaque body — storage details
//! never leave the process.

use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use keel_engine::config::{AccountStatus, RateUpdate};
use keel_engine::settlement::{EngineStatus, SettlementEngine};
use keel_engine::EngineError;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all request handlers. Cheap to clone — everything
/// behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The settlement engine.
    pub engine: Arc<SettlementEngine>,
    /// Prometheus metric handles.
    pub metrics: SharedMetrics,
    /// Reported version string.
    pub version: String,
    /// When the gateway started, for uptime reporting.
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wraps [`EngineError`] with its HTTP rendering.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

/// Error body returned on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            EngineError::InsufficientFunds { .. } => {
                (StatusCode::PAYMENT_REQUIRED, self.0.to_string())
            }
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            EngineError::Conflict(_) => (StatusCode::CONFLICT, self.0.to_string()),
            EngineError::CapacityExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string())
            }
            EngineError::RateLimited { retry_after_secs } => {
                let body = Json(ErrorResponse {
                    error: self.0.to_string(),
                });
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response();
            }
            EngineError::Internal(_) => {
                // Full context server-side, opaque message to the caller.
                tracing::error!(error = %self.0, "internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and
/// request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/deposits", post(initiate_deposit_handler))
        .route("/deposits/:id/confirm", post(confirm_deposit_handler))
        .route("/withdrawals", post(initiate_withdrawal_handler))
        .route("/transfers", post(transfer_handler))
        .route("/staking", post(stake_handler))
        .route("/staking/:id/unstake", post(unstake_handler))
        .route("/staking/:id/claim", post(claim_handler))
        .route("/wallets/:user_id", get(wallet_handler))
        .route("/wallets/:user_id/history", get(history_handler))
        .route("/transactions/:id", get(transaction_handler))
        .route("/admin/rates", post(admin_rates_handler))
        .route("/admin/accounts", post(admin_add_account_handler))
        .route(
            "/admin/accounts/:id",
            patch(admin_update_account_handler).delete(admin_remove_account_handler),
        )
        .route("/admin/daily-reset", post(daily_reset_handler))
        .route("/admin/sweep", post(sweep_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub user_id: String,
    /// Fiat amount, THB minor units.
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmDepositRequest {
    pub user_id: String,
    /// Fiat amount actually received, THB minor units.
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: String,
    /// KEL minor units.
    pub amount: u64,
    pub destination: String,
    /// Quick-withdraw path: adds the flat protocol fee.
    #[serde(default)]
    pub quick: bool,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_user: String,
    pub to_user: String,
    /// KEL minor units.
    pub amount: u64,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StakeRequest {
    pub user_id: String,
    /// KEL minor units.
    pub amount: u64,
    pub duration_days: u32,
}

#[derive(Debug, Deserialize)]
pub struct StakingActionRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    pub account_id: String,
    /// THB minor units per day.
    pub daily_limit: u64,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub status: AccountStatus,
    pub priority: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveAccountParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct SweepRequest {
    /// Pending transactions older than this are swept. Defaults to one
    /// hour.
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: i64,
    pub engine: EngineStatus,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — liveness probe for orchestrators. Intentionally does
/// not inspect subsystems; that belongs in `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` — gateway and engine counters.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        engine: state.engine.status_snapshot(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// `POST /deposits` — route a fiat deposit to a receiving account.
async fn initiate_deposit_handler(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<keel_engine::settlement::DepositInitiation> {
    let timer = state.metrics.operation_latency_seconds.start_timer();
    let result = state.engine.initiate_deposit(&req.user_id, req.amount);
    timer.observe_duration();
    match result {
        Ok(initiation) => {
            state.metrics.deposits_initiated_total.inc();
            Ok(Json(initiation))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /deposits/:id/confirm` — confirm a paid deposit. Idempotent.
async fn confirm_deposit_handler(
    State(state): State<AppState>,
    Path(deposit_id): Path<String>,
    Json(req): Json<ConfirmDepositRequest>,
) -> ApiResult<keel_engine::settlement::DepositReceipt> {
    match state
        .engine
        .confirm_deposit(&deposit_id, &req.user_id, req.amount)
    {
        Ok(receipt) => {
            state.metrics.deposits_confirmed_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /withdrawals` — reserve a crypto withdrawal.
async fn initiate_withdrawal_handler(
    State(state): State<AppState>,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<keel_engine::settlement::WithdrawalInitiation> {
    let timer = state.metrics.operation_latency_seconds.start_timer();
    let result =
        state
            .engine
            .initiate_withdrawal(&req.user_id, req.amount, &req.destination, req.quick);
    timer.observe_duration();
    match result {
        Ok(initiation) => {
            state.metrics.withdrawals_initiated_total.inc();
            Ok(Json(initiation))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /transfers` — reserve an internal transfer.
async fn transfer_handler(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<keel_engine::settlement::TransferReceipt> {
    match state
        .engine
        .transfer(&req.from_user, &req.to_user, req.amount, req.note)
    {
        Ok(receipt) => {
            state.metrics.transfers_initiated_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /staking` — open a staking position.
async fn stake_handler(
    State(state): State<AppState>,
    Json(req): Json<StakeRequest>,
) -> ApiResult<keel_engine::settlement::StakeReceipt> {
    match state
        .engine
        .stake(&req.user_id, req.amount, req.duration_days)
    {
        Ok(receipt) => {
            state.metrics.staking_operations_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /staking/:id/unstake` — close a position.
async fn unstake_handler(
    State(state): State<AppState>,
    Path(staking_id): Path<String>,
    Json(req): Json<StakingActionRequest>,
) -> ApiResult<keel_engine::settlement::UnstakeReceipt> {
    match state.engine.unstake(&req.user_id, &staking_id) {
        Ok(receipt) => {
            state.metrics.staking_operations_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `POST /staking/:id/claim` — claim accrued rewards.
async fn claim_handler(
    State(state): State<AppState>,
    Path(staking_id): Path<String>,
    Json(req): Json<StakingActionRequest>,
) -> ApiResult<keel_engine::settlement::ClaimReceipt> {
    match state.engine.claim_rewards(&req.user_id, &staking_id) {
        Ok(receipt) => {
            state.metrics.staking_operations_total.inc();
            Ok(Json(receipt))
        }
        Err(e) => Err(reject(&state, e)),
    }
}

/// `GET /wallets/:user_id` — wallet balances.
async fn wallet_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<keel_engine::settlement::WalletView> {
    state
        .engine
        .wallet_view(&user_id)
        .map(Json)
        .map_err(ApiError)
}

/// `GET /wallets/:user_id/history` — recent transactions, newest first.
async fn history_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<keel_engine::ledger::Transaction>> {
    let limit = params.limit.unwrap_or(50).min(500);
    state
        .engine
        .history(&user_id, limit)
        .map(Json)
        .map_err(ApiError)
}

/// `GET /transactions/:id` — transaction status lookup. Operators use
/// this to spot stuck pendings.
async fn transaction_handler(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<keel_engine::ledger::Transaction> {
    state
        .engine
        .transaction_status(&tx_id)
        .map(Json)
        .map_err(ApiError)
}

/// `POST /admin/rates` — partial rates update.
async fn admin_rates_handler(
    State(state): State<AppState>,
    Json(patch): Json<RateUpdate>,
) -> ApiResult<keel_engine::config::RateConfig> {
    state
        .engine
        .admin_update_rates(&patch)
        .map(Json)
        .map_err(ApiError)
}

/// `POST /admin/accounts` — add a receiving bank account.
async fn admin_add_account_handler(
    State(state): State<AppState>,
    Json(req): Json<AddAccountRequest>,
) -> ApiResult<AckResponse> {
    state
        .engine
        .admin_add_bank_account(&req.account_id, req.daily_limit, req.priority)
        .map(|_| Json(AckResponse { ok: true }))
        .map_err(ApiError)
}

/// `PATCH /admin/accounts/:id` — status / priority update.
async fn admin_update_account_handler(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(req): Json<UpdateAccountRequest>,
) -> ApiResult<AckResponse> {
    state
        .engine
        .admin_update_account_status(&account_id, req.status, req.priority)
        .map(|_| Json(AckResponse { ok: true }))
        .map_err(ApiError)
}

/// `DELETE /admin/accounts/:id?force=true` — remove an account.
async fn admin_remove_account_handler(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(params): Query<RemoveAccountParams>,
) -> ApiResult<AckResponse> {
    state
        .engine
        .admin_remove_bank_account(&account_id, params.force)
        .map(|_| Json(AckResponse { ok: true }))
        .map_err(ApiError)
}

/// `POST /admin/daily-reset` — scheduled capacity reset. Idempotent.
async fn daily_reset_handler(
    State(state): State<AppState>,
) -> ApiResult<keel_engine::settlement::ResetReport> {
    state.engine.daily_reset().map(Json).map_err(ApiError)
}

/// `POST /admin/sweep` — drive stale pendings to a terminal status.
async fn sweep_handler(
    State(state): State<AppState>,
    Json(req): Json<SweepRequest>,
) -> ApiResult<keel_engine::settlement::SweepReport> {
    let max_age = chrono::Duration::seconds(req.max_age_secs.unwrap_or(3_600) as i64);
    state.engine.sweep_stale(max_age).map(Json).map_err(ApiError)
}

/// Counts a client rejection before handing the error back.
fn reject(state: &AppState, e: EngineError) -> ApiError {
    if !matches!(e, EngineError::Internal(_)) {
        state.metrics.requests_rejected_total.inc();
    }
    ApiError(e)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use keel_engine::config::ConfigStore;
    use keel_engine::ledger::{Currency, LedgerStore, LedgerUpdate, WalletEffect, WalletRef};
    use keel_engine::settlement::DirectRail;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(LedgerStore::open_temporary().expect("temp store"));
        let config = Arc::new(ConfigStore::new(store.open_tree("config").expect("tree")));
        let (engine, _worker) = SettlementEngine::new(store, config, Arc::new(DirectRail));
        AppState {
            engine,
            metrics: Arc::new(crate::metrics::GatewayMetrics::new()),
            version: "0.1.0-test".into(),
            started_at: Utc::now(),
        }
    }

    fn fund(state: &AppState, user: &str, amount: u64) {
        state
            .engine
            .store()
            .ensure_wallet(user, Currency::Kel)
            .unwrap();
        state
            .engine
            .store()
            .apply(&LedgerUpdate::new().wallet(WalletRef::kel(user), WalletEffect::Credit { amount }))
            .unwrap();
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    // -- 1. Health probe -----------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    // -- 2. Full deposit flow over HTTP --------------------------------------

    #[tokio::test]
    async fn deposit_initiate_and_confirm() {
        let state = test_state();
        state
            .engine
            .admin_add_bank_account("bank-1", 1_000_000_00, 1)
            .unwrap();
        let router = create_router(state);

        let (status, body) = post_json(
            &router,
            "/deposits",
            serde_json::json!({ "user_id": "alice", "amount": 100_00 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let initiation: keel_engine::settlement::DepositInitiation =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(initiation.payment.account_id, "bank-1");

        let (status, body) = post_json(
            &router,
            &format!("/deposits/{}/confirm", initiation.deposit_id),
            serde_json::json!({ "user_id": "alice", "amount": 100_00 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let receipt: keel_engine::settlement::DepositReceipt =
            serde_json::from_slice(&body).unwrap();
        assert_eq!(receipt.credited, 990_00);
        assert_eq!(receipt.fee, 10_00);

        let (status, body) = get(&router, "/wallets/alice").await;
        assert_eq!(status, StatusCode::OK);
        let wallet: keel_engine::settlement::WalletView = serde_json::from_slice(&body).unwrap();
        assert_eq!(wallet.balance, 990_00);
        assert_eq!(wallet.available, 990_00);
    }

    // -- 3. Validation maps to 400 -------------------------------------------

    #[tokio::test]
    async fn zero_amount_deposit_is_bad_request() {
        let router = create_router(test_state());
        let (status, body) = post_json(
            &router,
            "/deposits",
            serde_json::json!({ "user_id": "alice", "amount": 0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("amount"));
    }

    // -- 4. Empty pool maps to 503 -------------------------------------------

    #[tokio::test]
    async fn deposit_without_capacity_is_service_unavailable() {
        let router = create_router(test_state());
        let (status, _) = post_json(
            &router,
            "/deposits",
            serde_json::json!({ "user_id": "alice", "amount": 100_00 }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    // -- 5. Insufficient funds maps to 402 -----------------------------------

    #[tokio::test]
    async fn withdrawal_without_funds_is_payment_required() {
        let state = test_state();
        fund(&state, "alice", 50_00);
        let router = create_router(state);

        let (status, _) = post_json(
            &router,
            "/withdrawals",
            serde_json::json!({
                "user_id": "alice",
                "amount": 500_00,
                "destination": "addr-1"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    // -- 6. Unknown wallet maps to 404 ---------------------------------------

    #[tokio::test]
    async fn unknown_wallet_is_not_found() {
        let router = create_router(test_state());
        let (status, _) = get(&router, "/wallets/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- 7. Unknown recipient maps to 404 ------------------------------------

    #[tokio::test]
    async fn transfer_to_unknown_recipient_is_not_found() {
        let state = test_state();
        fund(&state, "alice", 1_000_00);
        let router = create_router(state);

        let (status, _) = post_json(
            &router,
            "/transfers",
            serde_json::json!({
                "from_user": "alice",
                "to_user": "ghost",
                "amount": 100_00
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- 8. Rate limiting maps to 429 with Retry-After -----------------------

    #[tokio::test]
    async fn rate_limited_withdrawal_gets_retry_after() {
        let state = test_state();
        fund(&state, "alice", 100_000_00);
        let router = create_router(state);

        let body = serde_json::json!({
            "user_id": "alice",
            "amount": 100_00,
            "destination": "addr-1"
        });
        for _ in 0..5 {
            let (status, _) = post_json(&router, "/withdrawals", body.clone()).await;
            assert_eq!(status, StatusCode::OK);
        }

        let req = Request::builder()
            .method("POST")
            .uri("/withdrawals")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
    }

    // -- 9. Admin account lifecycle ------------------------------------------

    #[tokio::test]
    async fn admin_account_lifecycle() {
        let router = create_router(test_state());

        let (status, _) = post_json(
            &router,
            "/admin/accounts",
            serde_json::json!({ "account_id": "bank-1", "daily_limit": 100_000_00, "priority": 2 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Duplicate is a conflict.
        let (status, _) = post_json(
            &router,
            "/admin/accounts",
            serde_json::json!({ "account_id": "bank-1", "daily_limit": 100_000_00 }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Deactivate.
        let req = Request::builder()
            .method("PATCH")
            .uri("/admin/accounts/bank-1")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({ "status": "Inactive" })).unwrap(),
            ))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Remove.
        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/accounts/bank-1")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Gone now.
        let req = Request::builder()
            .method("DELETE")
            .uri("/admin/accounts/bank-1")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- 10. Rates update round-trips ----------------------------------------

    #[tokio::test]
    async fn admin_rates_update() {
        let router = create_router(test_state());
        let (status, body) = post_json(
            &router,
            "/admin/rates",
            serde_json::json!({ "deposit_commission_bps": 250 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cfg: keel_engine::config::RateConfig = serde_json::from_slice(&body).unwrap();
        assert_eq!(cfg.deposit_commission_bps, 250);
        assert_eq!(cfg.version, 1);
    }

    // -- 11. Daily reset is idempotent over HTTP -----------------------------

    #[tokio::test]
    async fn daily_reset_reports_accounts() {
        let state = test_state();
        state
            .engine
            .admin_add_bank_account("bank-1", 1_000_00, 1)
            .unwrap();
        state.engine.initiate_deposit("alice", 500_00).unwrap();
        let router = create_router(state);

        let (status, body) = post_json(&router, "/admin/daily-reset", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let report: keel_engine::settlement::ResetReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.accounts_reset, 1);

        let (_, body) = post_json(&router, "/admin/daily-reset", serde_json::json!({})).await;
        let report: keel_engine::settlement::ResetReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.accounts_reset, 0);
    }

    // -- 12. Status endpoint carries engine counters -------------------------

    #[tokio::test]
    async fn status_endpoint_reports_engine_counters() {
        let state = test_state();
        fund(&state, "alice", 1_000_00);
        let router = create_router(state);

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.version, "0.1.0-test");
        assert_eq!(resp.engine.wallets, 1);
    }

    // -- 13. Transaction lookup ----------------------------------------------

    #[tokio::test]
    async fn transaction_lookup_roundtrip() {
        let state = test_state();
        fund(&state, "alice", 1_000_00);
        let router = create_router(state.clone());

        let (_, body) = post_json(
            &router,
            "/withdrawals",
            serde_json::json!({ "user_id": "alice", "amount": 200_00, "destination": "addr" }),
        )
        .await;
        let initiation: keel_engine::settlement::WithdrawalInitiation =
            serde_json::from_slice(&body).unwrap();

        let (status, body) =
            get(&router, &format!("/transactions/{}", initiation.withdrawal_id)).await;
        assert_eq!(status, StatusCode::OK);
        let tx: keel_engine::ledger::Transaction = serde_json::from_slice(&body).unwrap();
        assert_eq!(tx.amount, 200_00);
        assert_eq!(tx.fee, 2_00);
    }
}
