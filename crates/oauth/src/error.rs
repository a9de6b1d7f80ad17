// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classify::ErrorType;

/// Error codes for the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    NotFound,
    ReauthRequired,
    RefreshFailed,
    CircuitOpen,
    ValidationFailed,
    AuthenticationFailed,
    ProbeFailed,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::ReauthRequired => 401,
            Self::RefreshFailed => 502,
            Self::CircuitOpen => 503,
            Self::ValidationFailed => 400,
            Self::AuthenticationFailed => 401,
            Self::ProbeFailed => 502,
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::ReauthRequired => "REAUTH_REQUIRED",
            Self::RefreshFailed => "REFRESH_FAILED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::ProbeFailed => "PROBE_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Failures surfaced by the token lifecycle core.
///
/// `Clone` so one in-flight refresh can hand the same outcome to every
/// coalesced caller. Messages carried here are the classifier's fixed
/// user-facing strings, never raw provider bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Stored tokens are unusable; the user must redo the OAuth flow.
    #[error("re-authorization required for {instance}: {message}")]
    ReauthRequired { instance: String, error_type: ErrorType, message: String },

    /// Permanent failure or retries exhausted. Tokens are left in place.
    #[error("token refresh failed for {instance} after {attempts} attempt(s): {message}")]
    RefreshFailed { instance: String, error_type: ErrorType, attempts: u32, message: String },

    /// The breaker guarding `key` is open; no request was sent.
    #[error("circuit open for {key}; next attempt allowed at {next_attempt_at_ms}")]
    CircuitOpen { key: String, next_attempt_at_ms: u64 },

    /// Structural or format problem in supplied credentials.
    #[error("invalid credentials: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// The provider rejected the supplied token.
    #[error("{provider} rejected the credentials: {message}")]
    Authentication { provider: String, message: String },

    /// The validation probe could not reach a verdict.
    #[error("{provider} probe failed: {message}")]
    ProbeFailed { provider: String, error_type: ErrorType, message: String },

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("credential store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ReauthRequired { .. } => ErrorCode::ReauthRequired,
            Self::RefreshFailed { .. } => ErrorCode::RefreshFailed,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Validation { .. } => ErrorCode::ValidationFailed,
            Self::Authentication { .. } => ErrorCode::AuthenticationFailed,
            Self::ProbeFailed { .. } => ErrorCode::ProbeFailed,
            Self::UnknownInstance(_) => ErrorCode::NotFound,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Store(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a caller may reasonably try the same operation again later.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::ProbeFailed { .. } | Self::Cancelled)
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        self.code().to_http_response(self.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
