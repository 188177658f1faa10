//! Boundary error taxonomy.
//!
//! Background work never surfaces errors over HTTP — it records them into the
//! task store and publishes a hub `error` event. Everything a foreground
//! handler can fail with is one of these kinds, and each kind maps to exactly
//! one status code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use schema::ErrorBody;

use crate::database::DatabaseError;
use crate::relay::RelayError;
use crate::vmm::VmError;

#[derive(Debug)]
pub enum ApiError {
    /// Unknown task id → 404
    NotFound(String),
    /// Schema or value violation → 400
    BadRequest(String),
    /// Illegal state transition → 409
    InvalidState(String),
    /// No free IP or context id → 503
    Allocation(String),
    /// Hypervisor failed to start or configure → 500
    VmLaunch(String),
    /// Multiplexer or init write failed → 500
    RelayHandshake(String),
    /// Database error → 500
    Storage(String),
    /// Anything else → 500
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::Allocation(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::VmLaunch(_)
            | ApiError::RelayHandshake(_)
            | ApiError::Storage(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound(msg) => write!(f, "not found: {msg}"),
            ApiError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ApiError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            ApiError::Allocation(msg) => write!(f, "allocation failed: {msg}"),
            ApiError::VmLaunch(msg) => write!(f, "vm launch failed: {msg}"),
            ApiError::RelayHandshake(msg) => write!(f, "relay handshake failed: {msg}"),
            ApiError::Storage(msg) => write!(f, "storage error: {msg}"),
            ApiError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => ApiError::NotFound(msg),
            DatabaseError::InvalidState(msg) => ApiError::InvalidState(msg),
            DatabaseError::InvalidData(msg) => ApiError::Internal(msg),
            DatabaseError::Connection(e) | DatabaseError::Query(e) => {
                ApiError::Storage(e.to_string())
            }
        }
    }
}

impl From<VmError> for ApiError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Allocation(msg) => ApiError::Allocation(msg),
            other => ApiError::VmLaunch(other.to_string()),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError::RelayHandshake(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
