// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classification of raw token-endpoint failures.
//!
//! [`classify`] is the only place that decides whether a failure is
//! retryable or requires the user to re-authorize. The refresh engine acts
//! on its verdict without any per-call-site special cases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the refresh engine, metrics, and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    InvalidRefreshToken,
    TokenRevoked,
    InvalidClient,
    InvalidRequest,
    NetworkError,
    RateLimited,
    ServiceUnavailable,
    ServerError,
    UnknownError,
}

impl ErrorType {
    /// Wire-format string for this error type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::InvalidClient => "INVALID_CLIENT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ServerError => "SERVER_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::InvalidRefreshToken | Self::TokenRevoked | Self::InvalidClient)
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest
                | Self::NetworkError
                | Self::RateLimited
                | Self::ServiceUnavailable
                | Self::ServerError
        )
    }

    /// Fixed human-readable message shown to users for this error type.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidRefreshToken => {
                "The stored refresh token is invalid or expired. Please re-authorize the integration."
            }
            Self::TokenRevoked => {
                "Access for this integration has been revoked. Please re-authorize the integration."
            }
            Self::InvalidClient => {
                "The OAuth client credentials were rejected. Check the client ID and secret, then re-authorize."
            }
            Self::InvalidRequest => {
                "The token request was rejected as malformed. It will be retried automatically."
            }
            Self::NetworkError => {
                "Could not reach the OAuth provider. The request will be retried shortly."
            }
            Self::RateLimited => {
                "The OAuth provider is rate limiting requests. The request will be retried shortly."
            }
            Self::ServiceUnavailable => {
                "The OAuth service is temporarily unavailable. The request will be retried shortly."
            }
            Self::ServerError => {
                "The OAuth provider returned a server error. The request will be retried shortly."
            }
            Self::UnknownError => "Token refresh failed due to an unexpected error.",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure observed before any response arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFailure {
    ConnectionReset,
    TimedOut,
    DnsNotFound,
    ConnectionRefused,
    Aborted,
    Other,
}

impl NetworkFailure {
    /// Conventional socket error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionReset => "ECONNRESET",
            Self::TimedOut => "ETIMEDOUT",
            Self::DnsNotFound => "ENOTFOUND",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::Aborted => "AbortError",
            Self::Other => "ENETWORK",
        }
    }

    /// Map a `reqwest` transport error onto a failure kind.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::TimedOut;
        }
        let detail = format!("{err:?}").to_lowercase();
        if detail.contains("dns") || detail.contains("failed to lookup") {
            Self::DnsNotFound
        } else if detail.contains("connection refused") {
            Self::ConnectionRefused
        } else if detail.contains("connection reset") || detail.contains("broken pipe") {
            Self::ConnectionReset
        } else if err.is_connect() {
            Self::ConnectionRefused
        } else {
            Self::Other
        }
    }
}

/// A failure as observed at the HTTP boundary, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawError {
    /// OAuth error body (`{error, error_description}`).
    OAuth { status: Option<u16>, code: String, description: Option<String> },
    /// Non-success response without a recognizable OAuth error body.
    Http { status: u16, body: String },
    /// No response was received.
    Network(NetworkFailure),
    /// Anything else, described by its message.
    Other(String),
}

impl RawError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::OAuth { status, .. } => *status,
            Self::Http { status, .. } => Some(*status),
            Self::Network(_) | Self::Other(_) => None,
        }
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth { status, code, description } => {
                write!(f, "oauth error {code}")?;
                if let Some(status) = status {
                    write!(f, " ({status})")?;
                }
                if let Some(desc) = description {
                    write!(f, ": {desc}")?;
                }
                Ok(())
            }
            Self::Http { status, body } => write!(f, "http {status}: {body}"),
            Self::Network(kind) => write!(f, "network error {}", kind.code()),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

/// Verdict produced by [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub error_type: ErrorType,
    pub requires_reauth: bool,
    pub is_temporary: bool,
    pub user_message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl ClassifiedError {
    fn new(error_type: ErrorType, http_status: Option<u16>) -> Self {
        Self {
            error_type,
            requires_reauth: error_type.requires_reauth(),
            is_temporary: error_type.is_temporary(),
            user_message: error_type.user_message(),
            http_status,
        }
    }
}

/// Classify a raw failure. Pure and deterministic.
pub fn classify(raw: &RawError) -> ClassifiedError {
    let status = raw.status();
    let error_type = match raw {
        RawError::OAuth { status, code, description } => {
            let mut text = code.to_lowercase();
            if let Some(desc) = description {
                text.push(' ');
                text.push_str(&desc.to_lowercase());
            }
            signal_from_text(&text)
                .or_else(|| status.and_then(signal_from_status))
                .unwrap_or(ErrorType::UnknownError)
        }
        RawError::Http { status, body } => signal_from_status(*status)
            .or_else(|| signal_from_text(&body.to_lowercase()))
            .unwrap_or(ErrorType::UnknownError),
        RawError::Network(_) => ErrorType::NetworkError,
        RawError::Other(msg) => {
            signal_from_text(&msg.to_lowercase()).unwrap_or(ErrorType::UnknownError)
        }
    };
    ClassifiedError::new(error_type, status)
}

fn signal_from_status(status: u16) -> Option<ErrorType> {
    match status {
        429 => Some(ErrorType::RateLimited),
        503 => Some(ErrorType::ServiceUnavailable),
        500..=599 => Some(ErrorType::ServerError),
        _ => None,
    }
}

/// Match known signals in lowercased error text. Order matters: revocation
/// wins over the generic grant failure it is usually reported under.
fn signal_from_text(lower: &str) -> Option<ErrorType> {
    if lower.contains("token_revoked") || lower.contains("revoked") {
        return Some(ErrorType::TokenRevoked);
    }
    if lower.contains("invalid_grant") || lower.contains("invalid_refresh_token") {
        return Some(ErrorType::InvalidRefreshToken);
    }
    if lower.contains("invalid_client") {
        return Some(ErrorType::InvalidClient);
    }
    if lower.contains("invalid_request") || lower.contains("malformed") {
        return Some(ErrorType::InvalidRequest);
    }
    if lower.contains("econnreset")
        || lower.contains("etimedout")
        || lower.contains("enotfound")
        || lower.contains("econnrefused")
        || lower.contains("aborterror")
    {
        return Some(ErrorType::NetworkError);
    }
    if lower.contains("rate limit") || lower.contains("ratelimited") || lower.contains("too many requests")
    {
        return Some(ErrorType::RateLimited);
    }
    if lower.contains("service unavailable") || lower.contains("oauth service") {
        return Some(ErrorType::ServiceUnavailable);
    }
    if lower.contains("internal server error") || lower.contains("server_error") {
        return Some(ErrorType::ServerError);
    }
    None
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
