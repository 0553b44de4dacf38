use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::nip46::Nip46Error;
use crate::peers::PolicyError;
use crate::ratelimit::RateLimitError;
use crate::signer::SupervisorError;

/// Top-level error taxonomy for the HTTP/WS admin surface (spec §7).
///
/// Internal subsystems return their own `thiserror` enums; this is the only
/// error type a handler returns, so every subsystem error is converted at
/// the boundary rather than threaded through as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication failed")]
    AuthFailure,
    #[error("forbidden: {0}")]
    AuthorizationDenied(String),
    #[error("policy denied: {direction} to {peer}")]
    PolicyDenied { direction: &'static str, peer: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage busy, retry")]
    StorageBusy,
    #[error("storage error: {0}")]
    StorageError(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("signer node unavailable: {0}")]
    NodeUnavailable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited { reset_at_ms: i64, remaining: u32 },
    #[error("rate limiter unavailable")]
    RateLimiterUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u32>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Self::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StorageBusy => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DecryptionFailed => StatusCode::BAD_REQUEST,
            Self::NodeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RateLimiterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let (reset_at_ms, remaining) = match &self {
            Self::RateLimited {
                reset_at_ms,
                remaining,
            } => (Some(*reset_at_ms), Some(*remaining)),
            _ => (None, None),
        };

        let payload = ErrorPayload {
            error: self.to_string(),
            reset_at_ms,
            remaining,
        };
        (status, Json(payload)).into_response()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                ApiError::StorageBusy
            }
            other => ApiError::StorageError(other.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotStarted | SupervisorError::Unavailable(_) => {
                ApiError::NodeUnavailable(err.to_string())
            }
            SupervisorError::Timeout => ApiError::Timeout,
            SupervisorError::Startup(msg) => ApiError::NodeUnavailable(msg),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Denied { direction, peer } => ApiError::PolicyDenied { direction, peer },
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Limited {
                reset_at_ms,
                remaining,
            } => ApiError::RateLimited {
                reset_at_ms,
                remaining,
            },
            RateLimitError::Unavailable => ApiError::RateLimiterUnavailable,
        }
    }
}

impl From<Nip46Error> for ApiError {
    fn from(err: Nip46Error) -> Self {
        match err {
            Nip46Error::InvalidConnectString(msg) => ApiError::InvalidInput(msg),
            Nip46Error::Storage(msg) => ApiError::StorageError(msg),
            Nip46Error::Supervisor(e) => e.into(),
            Nip46Error::Policy(e) => e.into(),
            Nip46Error::Timeout => ApiError::Timeout,
        }
    }
}
