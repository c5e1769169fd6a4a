//! HTTP error types for the `MageBox` server.
//!
//! Maps domain errors from `magebox-core` and `magebox-storage` into HTTP
//! responses. Every variant produces a JSON body with a machine-readable
//! `error` field and a human-readable `message`.

use axum::extract::{FromRequest, FromRequestParts};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use magebox_core::error::{CryptoError, MfaError};
use magebox_storage::StoreError;

/// Application-level error returned from HTTP handlers and middleware.
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid input.
    BadRequest(String),
    /// Missing, invalid, or expired credentials.
    Unauthorized(String),
    /// The client IP is locked out after repeated failures.
    LockedOut,
    /// Role or IP policy denies the request.
    Forbidden(String),
    /// The MFA policy demands a valid code.
    MfaRequired(String),
    /// Requested resource not found.
    NotFound(String),
    /// Uniqueness or state conflict.
    Conflict(String),
    /// The client exceeded its request quota.
    RateLimited,
    /// Internal server error. The detail is logged, never returned.
    Internal(String),
}

/// Machine-readable error code attached to error responses as an
/// extension, for middleware that reports on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub &'static str);

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::LockedOut => (
                StatusCode::FORBIDDEN,
                "locked_out",
                "too many failed attempts, try again later".to_owned(),
            ),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::MfaRequired(msg) => (StatusCode::FORBIDDEN, "mfa_required", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate limit exceeded".to_owned(),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        let mut response = (status, axum::Json(body)).into_response();
        response.extensions_mut().insert(ErrorCode(error_type));
        response
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound(err.to_string()),
            StoreError::AlreadyExists(_) => Self::Conflict(err.to_string()),
            StoreError::Invalid(_) => Self::BadRequest(err.to_string()),
            StoreError::Crypto(_) | StoreError::Database(_) | StoreError::Migration(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<MfaError> for AppError {
    fn from(err: MfaError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// `axum::Json` whose rejections render as `bad_request` error bodies.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `axum::extract::Query` with the same error rendering.
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);
