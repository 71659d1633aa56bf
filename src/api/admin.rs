//! Admin routes. Amounts in admin payloads are minor units.

use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

use super::{ApiError, AppState};
use crate::contest::{NewContest, ResultsReport, StatusChange};
use crate::error::LedgerError;
use crate::leaderboard::DistributionReport;
use crate::models::{now_ms, Board, Contest, ContestStatus, Leaderboard, PlayerResult};
use crate::money::Amount;
use crate::reconcile::SweepReport;
use crate::withdraw::Decided;

#[derive(Deserialize)]
pub(super) struct StatusRequest {
    status: String,
}

#[derive(Deserialize)]
pub(super) struct ResultsRequest {
    results: Vec<PlayerResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DecisionRequest {
    action: String,
    #[serde(default)]
    settlement_ref: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct RewardsRequest {
    rewards: BTreeMap<u32, Amount>,
}

fn board_of(raw: &str) -> Result<Board, ApiError> {
    Board::parse(raw).ok_or_else(|| LedgerError::NotFound(format!("leaderboard {raw}")).into())
}

pub(super) async fn create_contest(
    State(state): State<AppState>,
    Json(req): Json<NewContest>,
) -> Result<Json<Contest>, ApiError> {
    Ok(Json(state.contests.create_contest(req).await?))
}

pub(super) async fn set_contest_status(
    State(state): State<AppState>,
    Path(contest_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<StatusChange>, ApiError> {
    let next = ContestStatus::parse(&req.status)
        .ok_or_else(|| LedgerError::validation(format!("unknown contest status {:?}", req.status)))?;
    Ok(Json(state.contests.set_status(&contest_id, next).await?))
}

pub(super) async fn submit_results(
    State(state): State<AppState>,
    Path(contest_id): Path<String>,
    Json(req): Json<ResultsRequest>,
) -> Result<Json<ResultsReport>, ApiError> {
    Ok(Json(state.contests.submit_results(&contest_id, req.results).await?))
}

pub(super) async fn decide_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Value>, ApiError> {
    let (decided, withdrawal) = match req.action.trim().to_lowercase().as_str() {
        "approve" => (
            Decided::Approved,
            state.withdrawals.approve(&withdrawal_id, req.settlement_ref).await?,
        ),
        "reject" => (
            Decided::Rejected,
            state.withdrawals.reject(&withdrawal_id, req.reason).await?,
        ),
        other => {
            return Err(LedgerError::validation(format!("unknown action {other:?}")).into());
        }
    };
    Ok(Json(json!({ "status": decided, "withdrawal": withdrawal })))
}

pub(super) async fn set_rewards(
    State(state): State<AppState>,
    Path(board): Path<String>,
    Json(req): Json<RewardsRequest>,
) -> Result<Json<Leaderboard>, ApiError> {
    let board = board_of(&board)?;
    Ok(Json(state.leaderboards.set_rewards(board, req.rewards).await?))
}

pub(super) async fn distribute(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Json<DistributionReport>, ApiError> {
    let board = board_of(&board)?;
    Ok(Json(state.leaderboards.distribute(board, Utc::now()).await?))
}

pub(super) async fn reconcile(State(state): State<AppState>) -> Json<SweepReport> {
    let report = state.reconciler.sweep(now_ms()).await;
    info!(repairs = report.repairs(), errors = report.errors, "Manual reconciliation sweep finished");
    Json(report)
}
