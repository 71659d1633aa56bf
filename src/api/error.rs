use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::LedgerError;
use crate::money::Amount;

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    /// Withdrawals draw on winnings only and report it under their own status.
    InsufficientWinnings { needed: Amount, available: Amount },
    InvalidSignature,
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

fn status_of(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
        LedgerError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        LedgerError::AlreadyJoined(_)
        | LedgerError::ContestFull(_)
        | LedgerError::ContestClosed(_)
        | LedgerError::InvalidTransition(_)
        | LedgerError::Busy(_) => StatusCode::CONFLICT,
        LedgerError::Gateway(_) => StatusCode::BAD_GATEWAY,
        LedgerError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Ledger(err) => {
                let status = status_of(&err);
                match &err {
                    LedgerError::Store(e) => error!("Ledger store error: {}", e),
                    LedgerError::Gateway(e) => warn!("Gateway error: {}", e),
                    _ => {}
                }
                let mut body = json!({
                    "status": err.status_code(),
                    "message": err.to_string(),
                });
                if err.is_retryable() {
                    body["retry"] = json!(true);
                }
                if let LedgerError::InsufficientFunds { needed, available } = err {
                    body["needed"] = json!(needed);
                    body["available"] = json!(available);
                }
                (status, body)
            }
            ApiError::InsufficientWinnings { needed, available } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "status": "INSUFFICIENT_FUNDS",
                    "message": format!("withdrawable winnings are {available}"),
                    "needed": needed,
                    "available": available,
                }),
            ),
            ApiError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "status": "INVALID_SIGNATURE",
                    "message": "webhook signature mismatch",
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
