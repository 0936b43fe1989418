//! API Error Handling
//!
//! Structured error responses carrying the stable error code and the
//! request id.

use crate::errors::{CrashError, ErrorKind, GameError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable code (INVALID_STATE, DUPLICATE_BET, NOT_FOUND, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

impl ApiError {
    fn new(request_id: String, status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            code,
            message,
            details: None,
            request_id,
        }
    }

    pub fn not_found(request_id: String, message: String) -> Self {
        Self::new(request_id, StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self::new(request_id, StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Map an engine error onto an HTTP status, keeping its error code
    pub fn from_crash(request_id: String, error: CrashError) -> Self {
        let kind = error.kind();
        let status = match kind {
            ErrorKind::InvalidState | ErrorKind::DuplicateBet | ErrorKind::AlreadyCashedOut => {
                StatusCode::CONFLICT
            }
            ErrorKind::NoSuchBet | ErrorKind::RoundNotFound => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::InvalidAmount => StatusCode::BAD_REQUEST,
            ErrorKind::StoreUnavailable | ErrorKind::Halted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let details = match &error {
            CrashError::Game(GameError::InsufficientFunds { balance, requested }) => {
                Some(json!({ "balance": balance, "requested": requested }))
            }
            _ => None,
        };

        if kind == ErrorKind::Internal {
            tracing::error!(request_id = %request_id, error = %error, "Request failed");
        }

        Self {
            details,
            ..Self::new(request_id, status, kind.code(), error.to_string())
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.request_id, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        });

        (self.status, body).into_response()
    }
}
