//! HTTP surface
//!
//! Three routers merged by access level: public (health, gateway webhook),
//! caller (bearer token) and admin (bearer token with the admin role).

mod admin;
mod error;
mod player;

pub use error::ApiError;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    middleware,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::auth::{admin_middleware, auth_middleware, JwtHandler};
use crate::contest::ContestService;
use crate::deposit::{verify_signature, DepositService, DepositSettings, WebhookPayload, SIGNATURE_HEADER};
use crate::error::LedgerError;
use crate::gateway::PaymentGateway;
use crate::leaderboard::{LeaderboardService, LeaderboardSettings};
use crate::reconcile::Reconciler;
use crate::refund::RefundProcessor;
use crate::store::LedgerStore;
use crate::wallet::WalletLedger;
use crate::withdraw::WithdrawalService;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub deposits: DepositSettings,
    pub leaderboards: LeaderboardSettings,
    pub stale_after_ms: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            deposits: DepositSettings::default(),
            leaderboards: LeaderboardSettings::default(),
            stale_after_ms: 120_000,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub wallets: WalletLedger,
    pub deposits: DepositService,
    pub contests: ContestService,
    pub withdrawals: WithdrawalService,
    pub leaderboards: LeaderboardService,
    pub reconciler: Reconciler,
    pub jwt: Arc<JwtHandler>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        jwt: Arc<JwtHandler>,
        settings: ServiceSettings,
        webhook_secret: Option<String>,
    ) -> Self {
        let deposits = DepositService::new(store.clone(), gateway, settings.deposits);
        let withdrawals = WithdrawalService::new(store.clone());
        let leaderboards = LeaderboardService::new(store.clone(), settings.leaderboards);
        let refunds = RefundProcessor::new(store.clone(), settings.stale_after_ms);
        let contests = ContestService::new(store.clone(), refunds.clone(), leaderboards.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            deposits.clone(),
            withdrawals.clone(),
            contests.clone(),
            refunds,
            leaderboards.clone(),
            settings.stale_after_ms,
        );
        Self {
            wallets: WalletLedger::new(store),
            deposits,
            contests,
            withdrawals,
            leaderboards,
            reconciler,
            jwt,
            webhook_secret,
        }
    }
}

/// Create the API router
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/webhooks/deposit", post(deposit_webhook))
        .with_state(state.clone());

    let caller_routes = Router::new()
        .route("/api/wallet", get(player::get_wallet))
        .route("/api/deposits", post(player::create_deposit))
        .route("/api/deposits/verify", post(player::verify_deposit))
        .route("/api/contests/:id/join", post(player::join_contest))
        .route("/api/withdrawals", post(player::request_withdrawal))
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/api/admin/contests", post(admin::create_contest))
        .route("/api/admin/contests/:id/status", post(admin::set_contest_status))
        .route("/api/admin/contests/:id/results", post(admin::submit_results))
        .route("/api/admin/withdrawals/:id", post(admin::decide_withdrawal))
        .route("/api/admin/leaderboards/:board/rewards", put(admin::set_rewards))
        .route("/api/admin/leaderboards/:board/distribute", post(admin::distribute))
        .route("/api/admin/reconcile", post(admin::reconcile))
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            admin_middleware,
        ))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(caller_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Gateway callback. The signature covers the raw body, so parsing waits
/// until it checks out.
async fn deposit_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            warn!("Rejected deposit webhook with bad signature");
            return Err(ApiError::InvalidSignature);
        }
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| LedgerError::validation(format!("malformed webhook body: {e}")))?;
    let ack = state.deposits.handle_webhook(&payload).await?;
    Ok(Json(json!({ "orderId": payload.order_id, "status": ack })))
}
