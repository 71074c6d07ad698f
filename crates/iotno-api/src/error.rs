//! API error types and HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use iotno_store::StoreError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// HTTP status code, repeated in the body.
    pub status: u16,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// 400 `INVALID_ARGUMENT` for syntactic and precondition failures.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
    }

    /// 409 `CONFLICT` for devices already held by an active transaction.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// 404 `NOT_FOUND` for unknown transactions.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// 500 `INTERNAL` for store or broker failures.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorInfo {
                status: self.status.as_u16(),
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<iotno_core::Error> for ApiError {
    fn from(value: iotno_core::Error) -> Self {
        match value {
            iotno_core::Error::Validation { message } | iotno_core::Error::InvalidId { message } => {
                Self::invalid_argument(message)
            }
            iotno_core::Error::Config { message }
            | iotno_core::Error::Serialization { message } => Self::internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::TransactionNotFound { transaction_id } => {
                Self::not_found(format!("transaction not found: {transaction_id}"))
            }
            StoreError::DeviceNotFound { .. } | StoreError::Backend { .. } => {
                Self::internal("store operation failed")
            }
        }
    }
}
