use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::campaign::estimator::EstimatorError;
use crate::campaign::ledger::LedgerError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => AppError::NotFound(format!("Campaign {id} not found")),
            other => AppError::Ledger(other),
        }
    }
}

impl From<EstimatorError> for AppError {
    fn from(e: EstimatorError) -> Self {
        match e {
            EstimatorError::InvalidArgument(msg) => AppError::Validation(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Ledger(e) if e.is_transient() => {
                tracing::error!("Ledger unavailable: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "LEDGER_UNAVAILABLE",
                    "Campaign storage is temporarily unavailable".to_string(),
                )
            }
            AppError::Ledger(e) => {
                tracing::error!("Ledger error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "LEDGER_ERROR",
                    "A campaign storage error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
