use crate::actor::ActorGone;
use aviator_execution::{EngineError, LedgerError, PaymentError, WithdrawalError};
use aviator_types::PhoneError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::error;

/// Anything a request handler can fail with.
#[derive(Debug, ThisError)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Withdrawal(#[from] WithdrawalError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    InvalidPhone(#[from] PhoneError),
    #[error("round engine is not running")]
    Unavailable,
    #[error("admin token missing or wrong")]
    Unauthorized,
    #[error("{0}")]
    Internal(String),
}

impl From<ActorGone> for ServiceError {
    fn from(_: ActorGone) -> Self {
        ServiceError::Unavailable
    }
}

impl ServiceError {
    /// Stable machine code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Engine(e) => e.code(),
            ServiceError::Ledger(e) => e.code(),
            ServiceError::Withdrawal(e) => e.code(),
            ServiceError::Payment(e) => e.code(),
            ServiceError::InvalidPhone(_) => "INVALID_PHONE",
            ServiceError::Unavailable => "UNAVAILABLE",
            ServiceError::Unauthorized => "UNAUTHORIZED",
            ServiceError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            "ACCOUNT_NOT_FOUND" | "WITHDRAWAL_NOT_FOUND" => StatusCode::NOT_FOUND,
            "ACCOUNT_EXISTS" | "STAKE_EXISTS" | "ALREADY_RESOLVED" | "DUPLICATE_REFERENCE" => {
                StatusCode::CONFLICT
            }
            "INVALID_PHASE" | "NO_ACTIVE_STAKE" => StatusCode::CONFLICT,
            "PAYMENT_FAILED" => StatusCode::BAD_GATEWAY,
            "LEDGER_CONFLICT" | "UNAVAILABLE" | "CONFIGURATION_FAULT" => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "STORAGE_ERROR" | "INTERNAL" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Reason string for clients. Storage details stay in the logs.
    pub fn message(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.message(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), err = %self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aviator_types::WithdrawalStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServiceError::from(LedgerError::InsufficientFunds {
                    balance: 5,
                    requested: 10,
                }),
                "INSUFFICIENT_FUNDS",
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::from(EngineError::InvalidPhase {
                    action: "cash out",
                    phase: "crashed",
                }),
                "INVALID_PHASE",
                StatusCode::CONFLICT,
            ),
            (
                ServiceError::from(WithdrawalError::AlreadyResolved {
                    id: 3,
                    status: WithdrawalStatus::Completed,
                }),
                "ALREADY_RESOLVED",
                StatusCode::CONFLICT,
            ),
            (
                ServiceError::from(LedgerError::AccountNotFound("bob".to_string())),
                "ACCOUNT_NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                ServiceError::from(PaymentError::GatewayFailed),
                "PAYMENT_FAILED",
                StatusCode::BAD_GATEWAY,
            ),
            (
                ServiceError::from(LedgerError::Conflict),
                "LEDGER_CONFLICT",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status, "{code}");
        }
    }

    #[test]
    fn test_storage_details_are_hidden() {
        let err = ServiceError::from(LedgerError::Storage("disk I/O error at page 7".to_string()));
        let body = err.body();
        assert_eq!(body.code, "STORAGE_ERROR");
        assert_eq!(body.message, "internal error");
    }

    #[test]
    fn test_gateway_failure_reads_as_retry() {
        let err = ServiceError::from(PaymentError::GatewayFailed);
        assert_eq!(err.message(), "payment failed, please retry");
    }
}
