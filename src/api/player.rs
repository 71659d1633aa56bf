//! Caller routes. The user id always comes from the token's `sub`.

use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::auth::Claims;
use crate::deposit::CreatedDeposit;
use crate::error::LedgerError;
use crate::money::Amount;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DepositRequest {
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    customer_mobile: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VerifyRequest {
    order_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct JoinRequest {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WithdrawRequest {
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    upi_id: String,
}

pub(super) async fn get_wallet(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let wallet = state.wallets.balance(&claims.sub).await?;
    Ok(Json(json!({
        "userId": claims.sub,
        "deposited": wallet.deposited,
        "winnings": wallet.winnings,
        "total": wallet.total(),
    })))
}

pub(super) async fn create_deposit(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<CreatedDeposit>, ApiError> {
    let amount = Amount::positive_from_json(&req.amount)?;
    let created = state
        .deposits
        .create_deposit(&claims.sub, amount, req.customer_mobile)
        .await?;
    Ok(Json(created))
}

pub(super) async fn verify_deposit(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = state.deposits.verify(&claims.sub, &req.order_id).await?;
    Ok(Json(json!({ "orderId": req.order_id, "status": status })))
}

pub(super) async fn join_contest(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(contest_id): Path<String>,
    body: Option<Json<JoinRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let display_name = req
        .display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| claims.sub.clone());
    let receipt = state
        .contests
        .join(&contest_id, &claims.sub, display_name.trim())
        .await?;
    Ok(Json(json!({ "status": "SUCCESS", "entry": receipt })))
}

pub(super) async fn request_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<Value>, ApiError> {
    let amount = Amount::positive_from_json(&req.amount)?;
    let withdrawal = state
        .withdrawals
        .request(&claims.sub, amount, &req.upi_id)
        .await
        .map_err(|e| match e {
            LedgerError::InsufficientFunds { needed, available } => {
                ApiError::InsufficientWinnings { needed, available }
            }
            other => ApiError::Ledger(other),
        })?;
    Ok(Json(json!({
        "status": withdrawal.status,
        "withdrawalId": withdrawal.id,
        "amount": withdrawal.amount,
    })))
}
